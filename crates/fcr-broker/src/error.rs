use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker backend error: {0}")]
    Backend(String),

    #[error("unknown receipt: {0}")]
    ReceiptNotFound(String),

    #[error("broker is stopped")]
    Stopped,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
}
