use thiserror::Error;

pub type ExperimentResult<T> = Result<T, ExperimentError>;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Backend not connected: {0}")]
    NotConnected(&'static str),

    #[error("Storage key of {len} characters exceeds maximum of {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("Storage key must have at least one fragment")]
    EmptyKey,

    /// Deliberately carries no detail about which check failed.
    #[error("request rejected")]
    Rejected,

    #[error("Cannot create a session without a site")]
    SessionScope,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExperimentError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        ExperimentError::Store(err.to_string())
    }
}
