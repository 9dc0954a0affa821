//! Hosts-file errors

use thiserror::Error;

/// Errors raised while updating a hosts file
#[derive(Debug, Error)]
pub enum HostsError {
    /// Reading or writing the file failed
    #[error("IO error on {path}: {source}")]
    Io {
        /// File being updated
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Another writer kept changing the file
    #[error("too many retries writing {path} ({attempts} attempts)")]
    TooManyRetries {
        /// File being updated
        path: String,
        /// Writes attempted
        attempts: usize,
    },
}

/// Result type for hosts-file operations
pub type Result<T> = std::result::Result<T, HostsError>;
