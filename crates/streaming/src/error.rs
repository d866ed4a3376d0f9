use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("server is shutting down")]
    ShuttingDown,

    #[error("frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
