/*!
Common error types for the turntable scanner components.
*/

use thiserror::Error;

/// Common result type used throughout the scanner crates
pub type Result<T> = std::result::Result<T, ScannerError>;

/// Broad classification of a [`ScannerError`].
///
/// Protocol errors are stream noise and are swallowed where they occur.
/// Device and process errors are fatal to the operation in progress.
/// Persistence errors degrade to warnings on an otherwise successful scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Device,
    Process,
    Persistence,
    Caller,
}

/// Error type for all scanner operations
#[derive(Error, Debug)]
pub enum ScannerError {
    /// Malformed or unexpected message on the worker stream
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The worker reported a failed command
    #[error("Device error during {command}: {message}")]
    Device { command: String, message: String },

    /// The worker process exited or its stream closed
    #[error("Worker process error: {0}")]
    Process(String),

    /// No response arrived within the configured timeout
    #[error("Command {command} timed out after {millis} ms")]
    Timeout { command: String, millis: u64 },

    /// Scan repository write failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    /// Settings failed validation
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Operation was cut short by a concurrent cleanup
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Captured frame payload could not be decoded
    #[error("Invalid frame data: {0}")]
    Frame(String),

    /// I/O errors (frame files, worker pipes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ScannerError {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new device error for the given command
    pub fn device(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Device {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a new worker process error
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create a new persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a new invalid settings error
    pub fn invalid_settings(msg: impl Into<String>) -> Self {
        Self::InvalidSettings(msg.into())
    }

    /// Create a new frame decoding error
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::Serde(_) => ErrorKind::Protocol,
            Self::Device { .. } | Self::Timeout { .. } | Self::Frame(_) | Self::Io(_) => {
                ErrorKind::Device
            }
            Self::Process(_) | Self::Aborted(_) => ErrorKind::Process,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::InvalidState { .. } | Self::InvalidSettings(_) => ErrorKind::Caller,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ScannerError::protocol("bad json").kind(), ErrorKind::Protocol);
        assert_eq!(ScannerError::device("capture", "no frame").kind(), ErrorKind::Device);
        assert_eq!(ScannerError::process("stream closed").kind(), ErrorKind::Process);
        assert_eq!(ScannerError::persistence("db locked").kind(), ErrorKind::Persistence);
        assert_eq!(
            ScannerError::invalid_state("scan", "Uninitialized").kind(),
            ErrorKind::Caller
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ScannerError::device("rotate", "motor stalled");
        assert_eq!(err.to_string(), "Device error during rotate: motor stalled");

        let err = ScannerError::invalid_state("initialize", "Scanning");
        assert_eq!(err.to_string(), "Cannot initialize while Scanning");
    }
}
