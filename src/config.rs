use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Absolute ceiling for any configured `max_limit`.
pub const HARD_LIMIT_CEILING: u32 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Relational,
    Document,
}

impl BackendType {
    pub fn name(&self) -> &'static str {
        match self {
            BackendType::Relational => "relational",
            BackendType::Document => "document",
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" | "sql" => Ok(BackendType::Relational),
            "document" | "mongodb" | "mongo" => Ok(BackendType::Document),
            other => Err(Error::Config(format!("unknown backend_type {:?}", other))),
        }
    }
}

/// SSL/TLS connection modes for the relational backend.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Ignored for verify-ca/verify-full.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    pub ca_cert_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// Program and arguments; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_seconds: 60,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend_type: BackendType,
    pub connection_uri: String,
    pub database_name: String,
    pub default_limit: u32,
    pub max_limit: u32,
    pub query_timeout_seconds: u64,
    pub confidence_threshold: f64,
    pub allow_raw_query: bool,
    pub pool_size: usize,
    pub schema_path: Option<PathBuf>,
    pub log_level: String,
    pub oracle: OracleConfig,
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_type: BackendType::default(),
            connection_uri: String::new(),
            database_name: String::new(),
            default_limit: 1000,
            max_limit: HARD_LIMIT_CEILING,
            query_timeout_seconds: 30,
            confidence_threshold: 0.5,
            allow_raw_query: false,
            pool_size: 8,
            schema_path: None,
            log_level: String::from("info"),
            oracle: OracleConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("querygate")
            .join("config.toml")
    }

    /// Load from `path`, or the default location if it exists, then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Self::get_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `QUERYGATE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QUERYGATE_BACKEND_TYPE") {
            self.backend_type = v.parse()?;
        }
        if let Some(v) = lookup("QUERYGATE_CONNECTION_URI") {
            self.connection_uri = v;
        }
        if let Some(v) = lookup("QUERYGATE_DATABASE_NAME") {
            self.database_name = v;
        }
        if let Some(v) = lookup("QUERYGATE_MAX_LIMIT") {
            self.max_limit = parse_env("QUERYGATE_MAX_LIMIT", &v)?;
        }
        if let Some(v) = lookup("QUERYGATE_QUERY_TIMEOUT_SECONDS") {
            self.query_timeout_seconds = parse_env("QUERYGATE_QUERY_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("QUERYGATE_ALLOW_RAW_QUERY") {
            self.allow_raw_query = parse_env("QUERYGATE_ALLOW_RAW_QUERY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.max_limit == 0 || self.max_limit > HARD_LIMIT_CEILING {
            return Err(Error::Config(format!(
                "max_limit must be between 1 and {}, got {}",
                HARD_LIMIT_CEILING, self.max_limit
            )));
        }
        if self.default_limit == 0 {
            return Err(Error::Config("default_limit must be at least 1".into()));
        }
        self.default_limit = self.default_limit.min(self.max_limit);
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.query_timeout_seconds == 0 {
            return Err(Error::Config("query_timeout_seconds must be at least 1".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    /// Checked before an adapter is built; schema-only commands skip it.
    pub fn require_connection(&self) -> Result<()> {
        if self.connection_uri.trim().is_empty() {
            return Err(Error::Config("connection_uri is not set".into()));
        }
        if self.backend_type == BackendType::Document && self.database_name.trim().is_empty() {
            return Err(Error::Config(
                "database_name is required for the document backend".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backend_type, BackendType::Relational);
        assert_eq!(config.default_limit, 1000);
        assert_eq!(config.max_limit, 10_000);
        assert_eq!(config.query_timeout_seconds, 30);
        assert_eq!(config.confidence_threshold, 0.5);
        assert!(!config.allow_raw_query);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            backend_type = "document"
            connection_uri = "mongodb://localhost:27017"
            database_name = "shop"
            max_limit = 500

            [oracle]
            command = ["llm", "-m", "small"]
            "#,
        )
        .unwrap();
        assert_eq!(config.backend_type, BackendType::Document);
        assert_eq!(config.max_limit, 500);
        assert_eq!(config.default_limit, 1000);
        assert_eq!(config.oracle.command, vec!["llm", "-m", "small"]);
        assert_eq!(config.oracle.timeout_seconds, 60);
    }

    #[test]
    fn test_validate_clamps_default_limit() {
        let mut config = Config {
            max_limit: 200,
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.default_limit, 200);
    }

    #[test]
    fn test_validate_rejects_ceiling_breach() {
        let mut config = Config {
            max_limit: 50_000,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_threshold() {
        let mut config = Config {
            confidence_threshold: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("QUERYGATE_BACKEND_TYPE", "mongodb"),
            ("QUERYGATE_MAX_LIMIT", "250"),
            ("QUERYGATE_ALLOW_RAW_QUERY", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend_type, BackendType::Document);
        assert_eq!(config.max_limit, 250);
        assert!(config.allow_raw_query);
    }

    #[test]
    fn test_env_override_bad_number() {
        let mut config = Config::default();
        let result = config.apply_env(|k| {
            (k == "QUERYGATE_MAX_LIMIT").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_require_connection() {
        let config = Config::default();
        assert!(config.require_connection().is_err());
        let config = Config {
            connection_uri: "postgres://localhost/db".into(),
            ..Config::default()
        };
        assert!(config.require_connection().is_ok());
    }

    #[test]
    fn test_ssl_mode_defaults_to_prefer() {
        assert_eq!(SslMode::default(), SslMode::Prefer);
        let tls: TlsConfig = toml::from_str("accept_invalid_certs = true").unwrap();
        assert_eq!(tls.ssl_mode, SslMode::Prefer);
        assert_eq!(Config::default().tls.ssl_mode, SslMode::Prefer);
    }

    #[test]
    fn test_ssl_mode_names() {
        let tls: TlsConfig = toml::from_str("ssl_mode = \"verify-full\"").unwrap();
        assert_eq!(tls.ssl_mode, SslMode::VerifyFull);
    }
}
