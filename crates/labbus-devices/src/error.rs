/*!
 * Transport error taxonomy.
 *
 * Every failure recorded on a transport command is one of these variants.
 * Errors are `Clone` because the same failure is stored on the command,
 * seen by every completion listener and re-raised to the waiting caller.
 */
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use labbus_core::service::ServiceState;

/// Error type for bus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Malformed command or out-of-range value, detected before touching the channel
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A wait or a channel read did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Channel failure: socket error, end of stream, malformed terminator
    #[error("I/O error: {0}")]
    Io(String),

    /// The requested capability is not implemented
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The operation was cancelled
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The service no longer accepts work
    #[error("{service} is {state} and does not accept commands")]
    Inactive {
        /// Name of the service
        service: String,
        /// Its state at submission time
        state: ServiceState,
    },
}

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Category of a [`BusError`], used to apply failure policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`BusError::InvalidArgument`]
    InvalidArgument,
    /// See [`BusError::Timeout`]
    Timeout,
    /// See [`BusError::Io`]
    Io,
    /// See [`BusError::Unsupported`]
    Unsupported,
    /// See [`BusError::Interrupted`]
    Interrupted,
    /// See [`BusError::Inactive`]
    Inactive,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

impl BusError {
    /// Create a new invalid argument error
    pub fn invalid_argument<S: AsRef<str>>(msg: S) -> Self {
        BusError::InvalidArgument(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        BusError::Timeout(msg.as_ref().to_string())
    }

    /// Create a timeout error for a wait of `after`
    pub fn timed_out_after(what: &str, after: Duration) -> Self {
        BusError::Timeout(format!("{} did not complete within {:?}", what, after))
    }

    /// Create a new I/O error
    pub fn io<S: AsRef<str>>(msg: S) -> Self {
        BusError::Io(msg.as_ref().to_string())
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: AsRef<str>>(msg: S) -> Self {
        BusError::Unsupported(msg.as_ref().to_string())
    }

    /// Create a new interruption error
    pub fn interrupted<S: AsRef<str>>(msg: S) -> Self {
        BusError::Interrupted(msg.as_ref().to_string())
    }

    /// Create a new inactive service error
    pub fn inactive<S: Into<String>>(service: S, state: ServiceState) -> Self {
        BusError::Inactive {
            service: service.into(),
            state,
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BusError::Timeout(_) => ErrorKind::Timeout,
            BusError::Io(_) => ErrorKind::Io,
            BusError::Unsupported(_) => ErrorKind::Unsupported,
            BusError::Interrupted(_) => ErrorKind::Interrupted,
            BusError::Inactive { .. } => ErrorKind::Inactive,
        }
    }

    /// Whether a background task hitting this error must stop and fail its service
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::Unsupported | ErrorKind::Inactive)
    }

    /// Whether this error is a timeout
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Whether this error reports cancellation
    pub fn is_interrupted(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => BusError::Timeout(err.to_string()),
            std::io::ErrorKind::Interrupted => BusError::Interrupted(err.to_string()),
            std::io::ErrorKind::InvalidInput => BusError::InvalidArgument(err.to_string()),
            kind => BusError::Io(format!("{} ({:?})", err, kind)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for BusError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        BusError::Timeout(err.to_string())
    }
}

impl From<labbus_core::error::Error> for BusError {
    fn from(err: labbus_core::error::Error) -> Self {
        use labbus_core::error::Error as CoreError;
        match err {
            CoreError::InvalidArgument(msg) | CoreError::Config(msg) => {
                BusError::InvalidArgument(msg)
            }
            CoreError::Timeout(msg) => BusError::Timeout(msg),
            CoreError::Io(e) => e.into(),
            lifecycle @ CoreError::Lifecycle { .. } => {
                BusError::InvalidArgument(lifecycle.to_string())
            }
            other => BusError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_policy() {
        assert!(BusError::io("socket closed").is_fatal());
        assert!(BusError::unsupported("no reading").is_fatal());
        assert!(!BusError::timeout("slow").is_fatal());
        assert!(BusError::timeout("slow").is_timeout());
        assert!(!BusError::invalid_argument("bad").is_fatal());
        assert!(BusError::interrupted("stop").is_interrupted());
        assert_eq!(
            BusError::inactive("bridge", ServiceState::Error).kind(),
            ErrorKind::Inactive
        );
    }

    #[test]
    fn test_from_io_error() {
        let err: BusError = std::io::Error::new(std::io::ErrorKind::TimedOut, "read").into();
        assert!(err.is_timeout());

        let err: BusError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_display() {
        let err = BusError::inactive("bridge0", ServiceState::Error);
        assert_eq!(err.to_string(), "bridge0 is ERROR and does not accept commands");
        assert_eq!(ErrorKind::Unsupported.to_string(), "unsupported");
    }
}
