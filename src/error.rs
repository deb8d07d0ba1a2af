use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("backing store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("supervisor not found: {0}")]
    SupervisorNotFound(String),

    #[error("enqueue failed: {0}")]
    Enqueue(String),

    #[error("malformed log entry {entry_id}: {reason}")]
    MalformedMessage { entry_id: String, reason: String },

    #[error("event references unknown job: {0}")]
    UnknownJob(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
