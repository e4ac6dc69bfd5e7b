//! Error kinds for the admission server and injector verifier.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("handler error: {0}")]
    Handler(#[from] whitebox_runtime::error::Error),

    #[error("malformed handler output: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("invalid verification key: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
