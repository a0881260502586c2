use drover_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("run failed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
