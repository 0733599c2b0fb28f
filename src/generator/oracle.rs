use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::OracleConfig;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("oracle is not configured")]
    NotConfigured,

    #[error("cannot start oracle `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("oracle I/O failed: {0}")]
    Io(String),

    #[error("oracle exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("oracle output is not UTF-8")]
    Encoding,

    #[error("{0}")]
    Other(String),
}

/// The text-generation capability: prompt in, completion out.
///
/// No determinism is assumed; callers validate everything it returns.
pub trait Oracle: Send + Sync {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, OracleError>> + Send;
}

impl<O: Oracle> Oracle for &O {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, OracleError>> + Send {
        (**self).generate(prompt)
    }
}

impl<O: Oracle> Oracle for Arc<O> {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, OracleError>> + Send {
        (**self).generate(prompt)
    }
}

/// Refuses every prompt. Stands in where only caller-supplied descriptors run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOracle;

impl Oracle for NoOracle {
    fn generate(&self, _prompt: &str) -> impl Future<Output = Result<String, OracleError>> + Send {
        std::future::ready(Err(OracleError::NotConfigured))
    }
}

/// Runs an external command per prompt: the prompt goes to stdin, the
/// completion is read from stdout. The child is killed if the call is dropped.
#[derive(Debug, Clone)]
pub struct ProcessOracle {
    program: String,
    args: Vec<String>,
}

impl ProcessOracle {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or(OracleError::NotConfigured)?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    async fn run(&self, prompt: &str) -> Result<String, OracleError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OracleError::Spawn {
                command: self.program.clone(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().ok_or_else(|| OracleError::Io("no stdout".into()))?;
        let mut stderr = child.stderr.take().ok_or_else(|| OracleError::Io("no stderr".into()))?;
        // Feed stdin while draining both pipes; stdin is closed when the
        // write finishes so the child sees EOF.
        let write = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(prompt.as_bytes()).await,
                None => Ok(()),
            }
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (written, read_out, read_err) = tokio::join!(
            write,
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err)
        );

        let status = child
            .wait()
            .await
            .map_err(|e| OracleError::Io(e.to_string()))?;
        if !status.success() {
            return Err(OracleError::Failed {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&err).trim().to_string(),
            });
        }
        written.map_err(|e| OracleError::Io(e.to_string()))?;
        read_out.map_err(|e| OracleError::Io(e.to_string()))?;
        read_err.map_err(|e| OracleError::Io(e.to_string()))?;
        String::from_utf8(out).map_err(|_| OracleError::Encoding)
    }
}

impl Oracle for ProcessOracle {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, OracleError>> + Send {
        self.run(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_command() {
        assert_eq!(
            ProcessOracle::from_config(&OracleConfig::default()).unwrap_err(),
            OracleError::NotConfigured
        );
        let config = OracleConfig {
            command: vec!["llm".into(), "--json".into()],
            ..OracleConfig::default()
        };
        let oracle = ProcessOracle::from_config(&config).unwrap();
        assert_eq!(oracle.program, "llm");
        assert_eq!(oracle.args, vec!["--json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_oracle_echoes_stdin() {
        let oracle = ProcessOracle::new("cat", vec![]);
        assert_eq!(oracle.generate("{\"a\": 1}").await.unwrap(), "{\"a\": 1}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_oracle_reports_failure() {
        let oracle = ProcessOracle::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        match oracle.generate("").await {
            Err(OracleError::Failed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_oracle_refuses() {
        assert_eq!(NoOracle.generate("x").await, Err(OracleError::NotConfigured));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let oracle = ProcessOracle::new("querygate-no-such-oracle", vec![]);
        assert!(matches!(
            oracle.generate("x").await,
            Err(OracleError::Spawn { .. })
        ));
    }
}
