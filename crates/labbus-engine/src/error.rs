/*!
 * Error types for the LabBus engine crate.
 */
use thiserror::Error;

use labbus_devices::error::{BusError, ErrorKind};

/// Error type for LabBus engine operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transport failure, carrying the bus taxonomy
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A driver could not make sense of an instrument response
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration or lifecycle error
    #[error("Core error: {0}")]
    Core(String),
}

/// Result type for LabBus engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new decode error
    pub fn decode<S: AsRef<str>>(msg: S) -> Self {
        Error::Decode(msg.as_ref().to_string())
    }

    /// Create a new core error
    pub fn core<S: AsRef<str>>(msg: S) -> Self {
        Error::Core(msg.as_ref().to_string())
    }

    /// Create an unsupported operation error
    pub fn unsupported<S: AsRef<str>>(msg: S) -> Self {
        Error::Bus(BusError::unsupported(msg))
    }

    /// Create an interruption error
    pub fn interrupted<S: AsRef<str>>(msg: S) -> Self {
        Error::Bus(BusError::interrupted(msg))
    }

    /// Taxonomy category; malformed responses count as invalid arguments
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Bus(e) => e.kind(),
            Error::Decode(_) | Error::Core(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Whether a background task hitting this error must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Bus(e) if e.is_fatal())
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

impl From<labbus_core::error::Error> for Error {
    fn from(err: labbus_core::error::Error) -> Self {
        Error::Core(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(err: std::num::ParseFloatError) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy() {
        assert!(Error::from(BusError::io("reset")).is_fatal());
        assert!(Error::unsupported("no reading").is_fatal());
        assert!(!Error::decode("garbage").is_fatal());
        assert!(Error::from(BusError::timeout("slow")).is_timeout());
        assert!(Error::interrupted("stop").is_interrupted());
        assert_eq!(Error::decode("x").kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_parse_errors_are_decode_errors() {
        let err: Error = "abc".parse::<u8>().unwrap_err().into();
        assert!(matches!(err, Error::Decode(_)));
    }
}
