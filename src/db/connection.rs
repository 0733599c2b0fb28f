use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::{CancelToken, NoTls};

use crate::config::{Config, SslMode, TlsConfig};
use crate::error::{Error, Result, Stage};

/// TLS setting a pool was built with; cancel requests reuse it.
#[derive(Clone)]
pub enum PgTls {
    Plain,
    Tls(MakeTlsConnector),
}

impl PgTls {
    /// Ask the server to cancel whatever the session behind `token` is running.
    pub async fn cancel(&self, token: CancelToken) {
        let result = match self {
            PgTls::Plain => token.cancel_query(NoTls).await,
            PgTls::Tls(tls) => token.cancel_query(tls.clone()).await,
        };
        if let Err(e) = result {
            tracing::warn!(stage = "execute", error = %e, "cancel request failed");
        }
    }
}

impl std::fmt::Debug for PgTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgTls::Plain => f.write_str("PgTls::Plain"),
            PgTls::Tls(_) => f.write_str("PgTls::Tls"),
        }
    }
}

/// Build the shared connection pool for the relational backend.
///
/// No connection is opened here; the first query acquires one.
pub fn create_pool(config: &Config) -> Result<(Pool, PgTls)> {
    let mut pg_config: tokio_postgres::Config = config
        .connection_uri
        .parse()
        .map_err(|e| Error::Config(format!("invalid connection_uri: {}", e)))?;
    if !config.database_name.trim().is_empty() {
        pg_config.dbname(config.database_name.trim());
    }
    if pg_config.get_connect_timeout().is_none() {
        pg_config.connect_timeout(Duration::from_secs(15));
    }
    pg_config.application_name("querygate");

    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let (manager, tls) = match config.tls.ssl_mode {
        SslMode::Disable => (
            Manager::from_config(pg_config, NoTls, manager_config),
            PgTls::Plain,
        ),
        SslMode::Prefer | SslMode::Require => {
            // Certificate verification depends on settings
            let tls = build_tls_connector(&config.tls, false)?;
            pg_config.ssl_mode(ssl_mode(config.tls.ssl_mode));
            (
                Manager::from_config(pg_config, tls.clone(), manager_config),
                PgTls::Tls(tls),
            )
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let tls = build_tls_connector(&config.tls, true)?;
            pg_config.ssl_mode(tokio_postgres::config::SslMode::Require);
            (
                Manager::from_config(pg_config, tls.clone(), manager_config),
                PgTls::Tls(tls),
            )
        }
    };

    let pool = Pool::builder(manager)
        .max_size(config.pool_size)
        .build()
        .map_err(|e| Error::Config(format!("cannot build connection pool: {}", e)))?;
    Ok((pool, tls))
}

fn ssl_mode(mode: SslMode) -> tokio_postgres::config::SslMode {
    match mode {
        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
        SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            tokio_postgres::config::SslMode::Require
        }
    }
}

/// Acquire a pooled client within `timeout`.
pub async fn acquire(pool: &Pool, timeout: Duration) -> Result<deadpool_postgres::Object> {
    match tokio::time::timeout(timeout, pool.get()).await {
        Err(_) => Err(Error::timeout(Stage::Execute, timeout)),
        Ok(Err(e)) => Err(Error::Connection(pool_error_message(&e))),
        Ok(Ok(client)) => Ok(client),
    }
}

fn pool_error_message(err: &deadpool_postgres::PoolError) -> String {
    match err {
        deadpool_postgres::PoolError::Backend(e) => match e.as_db_error() {
            Some(db) => db.message().to_string(),
            None => e.to_string(),
        },
        other => other.to_string(),
    }
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `strict_verify` forces verification (verify-ca/verify-full modes).
fn build_tls_connector(config: &TlsConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path).map_err(|e| {
            Error::Config(format!("failed to read CA certificate file {}: {}", ca_path, e))
        })?;
        for pem in split_pem_certificates(&ca_data)? {
            let cert = native_tls::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| Error::Config(format!("failed to parse certificate: {}", e)))?;
            builder.add_root_certificate(cert);
        }
    }
    // Otherwise the system trust store applies.

    let connector = builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one PEM block per certificate.
fn split_pem_certificates(pem_data: &[u8]) -> Result<Vec<String>> {
    let pem_str = std::str::from_utf8(pem_data)
        .map_err(|_| Error::Config("CA certificate file is not valid UTF-8".into()))?;

    let mut certs = Vec::new();
    let mut current = String::new();
    let mut in_cert = false;

    for line in pem_str.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            in_cert = true;
            current.clear();
            current.push_str(line.trim());
            current.push('\n');
        } else if line.contains("-----END CERTIFICATE-----") {
            if in_cert {
                current.push_str(line.trim());
                current.push('\n');
                certs.push(std::mem::take(&mut current));
            }
            in_cert = false;
        } else if in_cert {
            current.push_str(line.trim());
            current.push('\n');
        }
    }

    if certs.is_empty() {
        return Err(Error::Config("no valid certificates found in PEM data".into()));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = "junk\n-----BEGIN CERTIFICATE-----\nAAAA\nBBBB\n-----END CERTIFICATE-----\n\
                          -----BEGIN CERTIFICATE-----\nCCCC\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_split_pem_bundle() {
        let certs = split_pem_certificates(BUNDLE.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);
        assert!(certs[0].starts_with("-----BEGIN CERTIFICATE-----\nAAAA\nBBBB\n"));
        assert!(certs[1].contains("CCCC"));
    }

    #[test]
    fn test_split_pem_empty() {
        assert!(matches!(
            split_pem_certificates(b"nothing here"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_create_pool_rejects_bad_uri() {
        let config = Config {
            connection_uri: "postgres://reader@localhost:notaport/shop".into(),
            ..Config::default()
        };
        assert!(matches!(create_pool(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_create_pool_is_lazy() {
        let config = Config {
            connection_uri: "postgres://reader@127.0.0.1:1/shop".into(),
            tls: TlsConfig {
                ssl_mode: SslMode::Disable,
                ..TlsConfig::default()
            },
            ..Config::default()
        };
        let (pool, tls) = create_pool(&config).unwrap();
        assert!(matches!(tls, PgTls::Plain));
        assert_eq!(pool.status().size, 0);
    }

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(
            ssl_mode(SslMode::VerifyFull),
            tokio_postgres::config::SslMode::Require
        ));
        assert!(matches!(
            ssl_mode(SslMode::Prefer),
            tokio_postgres::config::SslMode::Prefer
        ));
    }
}
