//! Error types for the cluster layer

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// `Unavailable` without an underlying cause
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// `Unavailable` wrapping the terminal cause of a failed operation
    pub fn unavailable_with(message: impl Into<String>, source: Self) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the failure should be charged to the node that produced it
    /// and the call retried elsewhere.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. }
                | Self::DeadlineExceeded(_)
                | Self::Rpc(_)
                | Self::Transport(_)
                | Self::Internal(_)
        )
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(message),
            tonic::Code::InvalidArgument => Self::InvalidArgument(message),
            tonic::Code::Unimplemented => Self::Unsupported(message),
            tonic::Code::Unavailable => Self::unavailable(message),
            tonic::Code::DeadlineExceeded => Self::DeadlineExceeded(message),
            tonic::Code::Cancelled => Self::Cancelled,
            code => Self::Rpc(format!("{code:?}: {message}")),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) => Self::not_found(message),
            Error::InvalidArgument(_) => Self::invalid_argument(message),
            Error::Unsupported(_) => Self::unimplemented(message),
            Error::Unavailable { .. } | Error::Transport(_) => Self::unavailable(message),
            Error::DeadlineExceeded(_) => Self::deadline_exceeded(message),
            Error::Cancelled => Self::cancelled(message),
            Error::Configuration(_) => Self::failed_precondition(message),
            Error::Internal(_) | Error::Rpc(_) => Self::internal(message),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
