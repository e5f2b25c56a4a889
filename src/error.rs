use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PregelError>;

#[derive(Debug, Error)]
pub enum PregelError {
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("superstep out of sync: expected {expected}, got {got}")]
    OutOfSync { expected: u64, got: u64 },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PregelError {
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        PregelError::BadParameter(msg.into())
    }
}

impl From<serde_json::Error> for PregelError {
    fn from(err: serde_json::Error) -> Self {
        PregelError::Serialization(err.to_string())
    }
}
