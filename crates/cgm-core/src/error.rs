//! Error types for cgm-core.
//!
//! Errors fall into a small taxonomy that decides how far a failure
//! propagates:
//!
//! | Kind | Variants | Effect |
//! |------|----------|--------|
//! | Transport | [`Error::Bluetooth`], [`Error::Transport`], [`Error::Timeout`], [`Error::ConnectionFailed`] | reconnect with backoff |
//! | Integrity | [`Error::Integrity`] | drop one packet or image, keep the connection |
//! | Protocol | [`Error::Protocol`] | unsupported sensor, halt the pairing attempt |
//! | Data quality | [`Error::DataQuality`] | drop one reading |
//!
//! Crypto and parsing failures are always local. They never turn into a
//! connection-level error on their own.
//!
//! ## Error Classification
//!
//! [`Error::is_retryable`] drives [`crate::with_retry`]. Transport errors,
//! timeouts and I/O errors are retried; integrity, protocol, parse,
//! cancellation and configuration errors are not.

use std::time::Duration;

use thiserror::Error;

use cgm_types::{ParseError, ReadingError};

/// Errors that can occur when talking to a sensor or decoding its data.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Link-level failure not reported by the BLE stack itself
    /// (short NFC read, dropped notification stream, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The peripheral identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },


    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// A CRC did not match.
    #[error("CRC mismatch in {context}: expected {expected:#06x}, computed {actual:#06x}")]
    Integrity {
        /// What was being checked.
        context: &'static str,
        /// CRC stored in the data.
        expected: u16,
        /// CRC computed over the data.
        actual: u16,
    },

    /// The sensor or its data layout is not supported.
    #[error("Unsupported sensor: {0}")]
    Protocol(String),

    /// A reading carries quality flags and cannot be calibrated.
    #[error("Reading rejected: {0}")]
    DataQuality(ReadingError),

    /// Raw bytes could not be decoded.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Peripheral is out of range or no longer known to the adapter.
    OutOfRange,
    /// Peripheral rejected the connection.
    Rejected,
    /// Connection attempt timed out.
    Timeout,
    /// Expected GATT service is missing.
    ServiceMissing,
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "peripheral out of range"),
            Self::Rejected => write!(f, "connection rejected by peripheral"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::ServiceMissing => write!(f, "sensor service not found"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recoverable link failure.
    Transport,
    /// Checksum failure on one packet or image.
    Integrity,
    /// Unsupported sensor or layout.
    Protocol,
    /// Reading-level quality failure.
    DataQuality,
    /// Anything else (configuration, I/O, cancellation).
    Other,
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an unsupported-sensor error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Bluetooth(_)
            | Error::Transport(_)
            | Error::ConnectionFailed { .. }
            | Error::Timeout { .. } => ErrorKind::Transport,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::Protocol(_) | Error::Parse(_) => ErrorKind::Protocol,
            Error::DataQuality(_) => ErrorKind::DataQuality,
            Error::Cancelled | Error::InvalidConfig(_) | Error::Io(_) | Error::Json(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            // Timeout errors are usually transient
            Error::Timeout { .. } => true,
            // Bluetooth errors are often transient
            Error::Bluetooth(_) => true,
            Error::Transport(_) => true,
            Error::ConnectionFailed { reason, .. } => matches!(
                reason,
                ConnectionFailureReason::OutOfRange
                    | ConnectionFailureReason::Timeout
                    | ConnectionFailureReason::BleError(_)
                    | ConnectionFailureReason::Other(_)
            ),
            Error::Io(_) => true,
            Error::Integrity { .. }
            | Error::Protocol(_)
            | Error::DataQuality(_)
            | Error::Parse(_)
            | Error::Cancelled
            | Error::InvalidConfig(_)
            | Error::Json(_) => false,
        }
    }
}

/// Result type alias using cgm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
