use thiserror::Error;

use crate::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("duplicated {1} message from {0}")]
    DuplicatedMessage(NodeId, String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("generic error: {0}")]
    Generic(String),
}

pub type Result<T> = std::result::Result<T, Error>;
