//! Error types for cxlctl.

use thiserror::Error;

/// Result type alias using cxlctl's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cxlctl operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: bad size, unparsable token, command misuse.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Named or referenced object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation or mailbox command not supported by this device/kernel.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Device is in a state that forbids the operation (e.g. still bound).
    #[error("device busy: {0}")]
    Busy(String),

    /// Mailbox command completed with a device-level error status.
    #[error("firmware status {status}")]
    Firmware {
        /// Raw `retval` reported by the device.
        status: u32,
    },

    /// An attribute was present but its contents could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub(crate) fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }
}
