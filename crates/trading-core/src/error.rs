use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared across the whole platform. Component boundaries
/// return this type; internal helpers may use whatever is convenient.
#[derive(Error, Debug)]
pub enum KtrdrError {
    #[error("invalid config at {path}: {message}")]
    Config { path: String, message: String },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no data for {symbol} {timeframe} in requested range")]
    NoData { symbol: String, timeframe: String },

    #[error("contract error for {symbol}: {message}")]
    Contract { symbol: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("model error: {0}")]
    Model(String),
}

impl KtrdrError {
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        KtrdrError::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KtrdrError::Config { .. } => ErrorKind::ConfigError,
            KtrdrError::DataIntegrity(_) => ErrorKind::DataIntegrity,
            KtrdrError::RateLimited(_) => ErrorKind::RateLimited,
            KtrdrError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            KtrdrError::NoData { .. } => ErrorKind::NoData,
            KtrdrError::Contract { .. } => ErrorKind::ContractError,
            KtrdrError::Cancelled => ErrorKind::Cancelled,
            KtrdrError::Persistence(_) => ErrorKind::PersistenceError,
            KtrdrError::Model(_) => ErrorKind::ModelError,
        }
    }

    /// Errors the DataManager may recover from locally with retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KtrdrError::RateLimited(_) | KtrdrError::ConnectionLost(_)
        )
    }

    /// Errors that must abort the enclosing operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KtrdrError::Config { .. }
                | KtrdrError::DataIntegrity(_)
                | KtrdrError::Persistence(_)
                | KtrdrError::Model(_)
        )
    }
}

/// Serializable classification of an error, used in result records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigError,
    DataIntegrity,
    RateLimited,
    ConnectionLost,
    NoData,
    ContractError,
    Cancelled,
    PersistenceError,
    ModelError,
}

/// Structured failure payload carried in a failed result record. Never a
/// raw backtrace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Operation context: series key, range, epoch, whatever the failing
    /// component knew.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(err: &KtrdrError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            context: serde_json::Map::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

impl From<&KtrdrError> for ErrorInfo {
    fn from(err: &KtrdrError) -> Self {
        ErrorInfo::new(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        assert_eq!(
            KtrdrError::config("training.epochs", "must be positive").kind(),
            ErrorKind::ConfigError
        );
        assert_eq!(
            KtrdrError::RateLimited("pacing".into()).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(KtrdrError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn retry_and_fatal_classification() {
        assert!(KtrdrError::RateLimited("x".into()).is_retryable());
        assert!(KtrdrError::ConnectionLost("x".into()).is_retryable());
        assert!(!KtrdrError::DataIntegrity("x".into()).is_retryable());
        assert!(KtrdrError::DataIntegrity("x".into()).is_fatal());
        assert!(!KtrdrError::Cancelled.is_fatal());
    }

    #[test]
    fn error_info_carries_context() {
        let err = KtrdrError::Persistence("disk full".into());
        let info = ErrorInfo::new(&err)
            .with_context("series", "AAPL/1d")
            .with_context("epoch", 7);
        assert_eq!(info.kind, ErrorKind::PersistenceError);
        assert_eq!(info.context["series"], "AAPL/1d");
        assert_eq!(info.context["epoch"], 7);
    }
}
