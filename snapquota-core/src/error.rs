//! Error types for snapquota

use std::path::PathBuf;

use thiserror::Error;

/// snapquota error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// The filesystem backing a path has no project quota support
    #[error("Project quota not enabled on the filesystem backing {}", path.display())]
    QuotaUnsupported {
        /// Path that was checked
        path: PathBuf,
    },

    /// Project quota operation failed
    #[error("Quota error: {message}")]
    Quota {
        /// Error message
        message: String,
    },

    /// Container or mount lookup against the runtime failed
    #[error("Runtime lookup error: {message}")]
    RuntimeLookup {
        /// Error message
        message: String,
    },

    /// Orchestrator resource lookup failed or returned malformed data
    #[error("Resource lookup error: {message}")]
    ResourceLookup {
        /// Error message
        message: String,
    },

    /// Registration with, or event loop of, the host runtime failed
    #[error("Session error: {message}")]
    Session {
        /// Error message
        message: String,
    },

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSend,

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Build a [`Error::Quota`] from anything displayable
    pub fn quota(message: impl Into<String>) -> Self {
        Self::Quota {
            message: message.into(),
        }
    }

    /// Build a [`Error::RuntimeLookup`] from anything displayable
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeLookup {
            message: message.into(),
        }
    }

    /// Build a [`Error::ResourceLookup`] from anything displayable
    pub fn resource(message: impl Into<String>) -> Self {
        Self::ResourceLookup {
            message: message.into(),
        }
    }

    /// Build a [`Error::Session`] from anything displayable
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Build a [`Error::InvalidConfig`] from anything displayable
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelSend
    }
}

/// Result type alias for snapquota operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::quota("project 7: quotactl failed");
        assert_eq!(err.to_string(), "Quota error: project 7: quotactl failed");

        let err = Error::QuotaUnsupported {
            path: PathBuf::from("/var/lib/containerd"),
        };
        assert!(err.to_string().contains("/var/lib/containerd"));
    }

    #[tokio::test]
    async fn test_send_error_conversion() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(1);
        drop(rx);
        let err: Error = tx.send(1).await.unwrap_err().into();
        assert!(matches!(err, Error::ChannelSend));
    }
}
