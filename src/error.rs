use thiserror::Error;

use crate::validate::ValidationError;

/// Errors that can occur when talking to a Mio wearable
#[derive(Error, Debug)]
pub enum MioError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No usable Bluetooth adapter on this host
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    /// A record failed validation; nothing was sent
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A logical name does not belong to the closed identifier table
    #[error("Unknown {kind} identifier: {name}")]
    UnknownIdentifier {
        /// What was being resolved ("service" or "characteristic")
        kind: &'static str,
        /// The name that failed to resolve
        name: String,
    },

    /// A transport operation failed
    #[error("Transport error during {operation} ({context}): {message}")]
    Transport {
        /// Operation that failed, e.g. "connect" or "read"
        operation: &'static str,
        /// Peripheral, service or characteristic the operation targeted
        context: String,
        /// Underlying failure
        message: String,
    },

    /// A required service or characteristic is missing on the peripheral
    #[error("Required {what} not found - device is incompatible")]
    MissingRequired {
        /// Human readable name of the missing service/characteristic
        what: String,
    },

    /// Payload could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The session ended while the operation was pending
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Session is not in a state where the operation is possible
    #[error("Session not ready: {reason}")]
    NotReady {
        /// Reason why the session is not ready
        reason: String,
    },

    /// The command type has no known frame layout yet
    #[error("Command {command} is not implemented")]
    NotImplemented {
        /// Command name
        command: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for miolink operations
pub type Result<T> = std::result::Result<T, MioError>;

impl MioError {
    pub(crate) fn transport(
        operation: &'static str,
        context: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Transport {
            operation,
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::AdapterUnavailable | Self::Transport { .. } | Self::Disconnected
        )
    }

    /// Check if this error is recoverable without restarting the session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Decode(_)
                | Self::Timeout { .. }
                | Self::Transport { .. }
                | Self::NotReady { .. }
        )
    }

    /// Check if this error ends the session
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingRequired { .. } | Self::UnknownIdentifier { .. } | Self::Disconnected
        )
    }
}

/// Errors produced while decoding a payload received from the device
///
/// These are handed to observers by value, so they carry only owned, cloneable data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload length does not match the known format
    #[error("{format} payload has wrong length: {actual} bytes, expected {expected}")]
    WrongLength {
        /// Name of the expected format
        format: &'static str,
        /// Expected length description
        expected: String,
        /// Actual payload length
        actual: usize,
    },

    /// A field holds a value outside its allowed range
    #[error("{format} value {value} out of range")]
    OutOfRange {
        /// Name of the format
        format: &'static str,
        /// Offending value
        value: u32,
    },

    /// The format is reserved but has no decoder yet
    #[error("Decoding {format} is not implemented")]
    NotImplemented {
        /// Name of the format
        format: &'static str,
    },

    /// Any other structural problem
    #[error("Malformed {format} payload: {reason}")]
    Malformed {
        /// Name of the format
        format: &'static str,
        /// What is wrong
        reason: String,
    },
}
