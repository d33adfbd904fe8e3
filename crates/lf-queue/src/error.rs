use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Disk-assist persistence failed: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue {0} is stopped")]
    Stopped(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Persistence(e.to_string())
    }
}
