//! Error types for master operations.

/// Alias for `Result<T, rcmd::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the master.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The slave reported a failure of its main loop, or the slave is gone.
    #[error("commander error: {0}")]
    Commander(String),

    /// Framing or decoding failed on either side.
    #[error("messenger error: {0}")]
    Messenger(String),

    /// No final result arrived before the deadline.
    #[error("command timed out: {0}")]
    Timeout(String),

    /// The remote callable failed.
    #[error("{kind}: {message}")]
    Remote {
        /// Error class reported by the slave.
        kind: String,
        /// Error message.
        message: String,
        /// Formatted traceback from the slave.
        traceback: String,
    },

    /// An I/O error on the transport or a state file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
