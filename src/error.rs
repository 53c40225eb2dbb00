use snafu::Snafu;

use crate::retry::{Transient, TransientFault};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Error returned from database: {source}"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Malformed custom person tokens: {source}"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl Error {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }
}

impl Transient for Error {
    fn transient_fault(&self) -> Option<TransientFault> {
        match self {
            Self::Sqlx { source } => source.transient_fault(),
            _ => None,
        }
    }
}
