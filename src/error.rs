//! Error types for siakad-queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
