use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("manager is not running")]
    ManagerUnavailable,

    #[error("manager did not answer within {0} seconds")]
    ManagerTimeout(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(#[from] fcr_broker::BrokerError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
