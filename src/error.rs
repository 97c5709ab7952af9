use thiserror::Error;

use crate::{aba, bla, rbc};

#[derive(Error, Debug)]
pub enum Error {
    #[error("encoding/decoding error {0:?}")]
    Encoding(#[from] bincode::Error),

    #[error("rbc error {0}")]
    Rbc(#[from] rbc::error::Error),

    #[error("bla error {0}")]
    Bla(#[from] bla::error::Error),

    #[error("aba error {0}")]
    Aba(#[from] aba::error::Error),

    #[error("invalid message {0}")]
    InvalidMessage(String),

    #[error("generic error {0}")]
    Generic(String),
}
