use thiserror::Error;

/// Infrastructure-level errors returned by facilitator operations.
///
/// Protocol outcomes (bad signature, insufficient escrow, ...) are not errors;
/// they travel in-band as [`crate::VerifyResponse`] / [`crate::SettleResponse`].
#[derive(Debug, Error)]
pub enum X402Error {
    #[error("signature error: {0}")]
    SignatureError(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt settlement record: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for X402Error {
    fn from(e: rusqlite::Error) -> Self {
        X402Error::Storage(e.to_string())
    }
}
