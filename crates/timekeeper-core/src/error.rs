use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimekeeperError {
    #[error("no timer slots available")]
    PoolExhausted,

    #[error("countdown call failed: {0}")]
    ExternalCall(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TimekeeperError>;
