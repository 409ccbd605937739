use thiserror::Error;

/// Result type for decoder job operations
pub type Result<T> = std::result::Result<T, DecoderJobError>;

/// Errors returned synchronously by the decoder job's public entry points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecoderJobError {
    #[error("A decode cycle is already in flight")]
    DecodeInFlight,

    #[error("The job has been released")]
    Released,

    #[error("Codec creation failed: {0}")]
    CodecCreation(String),
}

/// Errors produced by the codec bridge and codec factory
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Failed to create codec: {0}")]
    CreationFailed(String),

    #[error("Fatal codec error: {0}")]
    Fatal(String),
}
