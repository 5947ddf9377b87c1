use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Send timed out")]
    SendTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("No sync endpoint configured")]
    NotConfigured,

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by hosts for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::SendTimeout => "SEND_TIMEOUT",
            Error::NotConnected => "NOT_CONNECTED",
            Error::NotConfigured => "NOT_CONFIGURED",
            Error::ConflictNotFound(_) => "CONFLICT_NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Transient transport failures are retryable, while logical errors
    /// like InvalidArgument or ConflictNotFound are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors (transient)
            Error::Io(_) => true,
            Error::Transport(_) => true,
            Error::SendTimeout => true,
            Error::NotConnected => true,

            // Non-retryable errors (logical/permanent)
            Error::Serialization(_) => false,
            Error::NotConfigured => false,
            Error::ConflictNotFound(_) => false,
            Error::InvalidArgument(_) => false,
            Error::Internal(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
