//! Error types for thing-jobs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The jobs service answered a request on its `rejected` topic.
    #[error("{operation} request rejected with code '{code}': {message}")]
    Rejected {
        operation: String,
        code: String,
        message: String,
    },

    #[error("publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("subscribe to {filter} failed: {reason}")]
    SubscribeFailed { filter: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Local failure while executing a job. Fatal for the agent.
    #[error("job {job_id} failed locally: {reason}")]
    Work { job_id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
