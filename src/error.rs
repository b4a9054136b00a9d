//! Error types shared by configuration, harvesting, and delivery.

use thiserror::Error;

/// Errors surfaced while loading configuration, harvesting reviews, or
/// delivering a report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarvestError {
    /// A configured user, group, repository, host, or project does not exist.
    #[error("{message}")]
    NotFound {
        /// Explanation naming the missing target.
        message: String,
    },

    /// A platform rejected the configured credentials.
    #[error("authentication failed: {message}")]
    AuthFailed {
        /// Error detail returned with the 401/403 response.
        message: String,
    },

    /// A platform response could not be decoded.
    #[error("malformed response: {message}")]
    Decode {
        /// Description of the payload that failed to decode.
        message: String,
    },

    /// Networking failed while calling a platform.
    #[error("network error: {message}")]
    Network {
        /// Transport-level error detail.
        message: String,
    },

    /// An age filter argument was rejected.
    #[error("{message}")]
    InvalidAge {
        /// Description of the rejected token.
        message: String,
    },

    /// Command-line options contradict each other.
    #[error("{message}")]
    ConfigConflict {
        /// Description of the conflicting options.
        message: String,
    },

    /// The configuration file could not be loaded or understood.
    #[error("{message}")]
    Configuration {
        /// Details about the configuration failure.
        message: String,
    },

    /// Local I/O operation failed.
    #[error("I/O error: {message}")]
    Io {
        /// Error detail from the underlying I/O operation.
        message: String,
    },
}

impl From<std::io::Error> for HarvestError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}
