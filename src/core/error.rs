use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("{target}.{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        target: String,
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Target '{0}' was removed while the operation was in flight")]
    TargetRemoved(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Attempt failed: {0}")]
    AttemptFailure(String),

    #[error("Chunk {index} failed: {error}")]
    ChunkFailure { index: usize, error: String },

    #[error("Fallback for '{operation}' failed: supervised path: {supervised}; direct call: {direct}")]
    FallbackFailed {
        operation: String,
        supervised: String,
        direct: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
