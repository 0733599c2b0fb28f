use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the compiler can report, one variant per error kind.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// The schema document yielded no usable collection.
    #[error("schema parse error: {0}")]
    SchemaParse(String),

    /// The oracle's output could not be decoded as a descriptor.
    #[error("descriptor generation failed after {attempts} attempt(s): {message}")]
    Generation { message: String, attempts: u32 },

    #[error("unknown collection `{collection}`")]
    UnknownCollection { collection: String },

    #[error("unknown field `{path}` in `{collection}`")]
    UnknownField { collection: String, path: String },

    #[error("no declared relationship between `{from}` and `{to}` on `{local_field}` = `{foreign_field}`")]
    NoRelationship {
        from: String,
        to: String,
        local_field: String,
        foreign_field: String,
    },

    #[error("unsafe operation rejected: {0}")]
    UnsafeOperation(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The backend reports that a collection/table does not exist.
    #[error("collection `{0}` not found in backend")]
    BackendNotFound(String),

    #[error("{stage} timed out after {}s", .after.as_secs_f64())]
    Timeout { stage: Stage, after: Duration },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Stable, serializable name of an error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaParse,
    Generation,
    UnknownCollection,
    UnknownField,
    NoRelationship,
    UnsafeOperation,
    InvalidDescriptor,
    BackendNotFound,
    Timeout,
    Connection,
    Execution,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SchemaParse(_) => ErrorKind::SchemaParse,
            Error::Generation { .. } => ErrorKind::Generation,
            Error::UnknownCollection { .. } => ErrorKind::UnknownCollection,
            Error::UnknownField { .. } => ErrorKind::UnknownField,
            Error::NoRelationship { .. } => ErrorKind::NoRelationship,
            Error::UnsafeOperation(_) => ErrorKind::UnsafeOperation,
            Error::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Error::BackendNotFound(_) => ErrorKind::BackendNotFound,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Execution(_) => ErrorKind::Execution,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the caller may retry. The compiler itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Connection(_))
    }

    pub(crate) fn timeout(stage: Stage, after: Duration) -> Self {
        Error::Timeout { stage, after }
    }
}

/// Pipeline stage an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Schema,
    Route,
    Generate,
    Validate,
    Execute,
    Format,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Schema => "schema",
            Stage::Route => "route",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
            Stage::Execute => "execute",
            Stage::Format => "format",
        };
        f.write_str(name)
    }
}

/// An [`Error`] tagged with the stage that raised it.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage}: {error}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl PipelineError {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Structured object handed to callers in place of a result envelope.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorBody {
                kind: self.error.kind(),
                stage: self.stage,
                message: self.error.to_string(),
                retryable: self.error.is_retryable(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::timeout(Stage::Execute, Duration::from_secs(30)).is_retryable());
        assert!(Error::Connection("refused".into()).is_retryable());
        assert!(!Error::UnsafeOperation("drop".into()).is_retryable());
        assert!(!Error::Generation {
            message: "bad json".into(),
            attempts: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_no_relationship_message_names_both_sides() {
        let err = Error::NoRelationship {
            from: "orders".into(),
            to: "users".into(),
            local_field: "user_id".into(),
            foreign_field: "id".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("users"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout(Stage::Execute, Duration::from_secs(30));
        assert_eq!(err.to_string(), "execute timed out after 30s");
    }

    #[test]
    fn test_error_response_shape() {
        let err = PipelineError::new(
            Stage::Validate,
            Error::UnknownField {
                collection: "orders".into(),
                path: "total".into(),
            },
        );
        let json = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(json["error"]["kind"], "unknown_field");
        assert_eq!(json["error"]["stage"], "validate");
        assert_eq!(json["error"]["retryable"], false);
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("total"));
    }
}
