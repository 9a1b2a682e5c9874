//! Error types for the iPixel panel library.

use thiserror::Error;

use crate::link::LinkError;
use crate::unit::UnitId;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the panels.
#[derive(Error, Debug)]
pub enum Error {
    /// Geometry mismatch, bad unit list or other static misconfiguration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another transfer already holds this unit.
    #[error("Unit {0} already has an active transfer")]
    SessionActive(UnitId),

    /// The unit's link could not be established or was lost for good.
    #[error("Connection error on unit {unit}: {reason}")]
    Connection {
        unit: UnitId,
        reason: ConnectionFailure,
    },

    /// Malformed or unexpected bytes from a device.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A transfer step exhausted its retry budget.
    #[error("Transfer to unit {unit} aborted at {step}: {reason}")]
    Transfer {
        unit: UnitId,
        step: TransferStep,
        reason: TransferFailure,
    },

    /// Payload does not fit the frame's length field.
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Configuration file could not be read.
    #[error("Config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn connection(unit: UnitId, reason: ConnectionFailure) -> Self {
        Error::Connection { unit, reason }
    }

    /// Returns true for errors raised before anything was written to a device.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::SessionActive(_) | Error::ConfigIo(_) | Error::ConfigParse(_)
        )
    }
}

/// Why a link could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("link lost after {attempts} reconnect attempts: {last}")]
    LinkLost { attempts: u32, last: String },

    #[error("write failed: {0}")]
    Write(String),
}

impl From<LinkError> for ConnectionFailure {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::AddressInvalid(addr) => ConnectionFailure::AddressInvalid(addr),
            LinkError::Unreachable(msg) => ConnectionFailure::Unreachable(msg),
            LinkError::Timeout => ConnectionFailure::Timeout,
            LinkError::Disconnected(msg) => ConnectionFailure::Unreachable(msg),
            LinkError::Io(e) => ConnectionFailure::Write(e.to_string()),
        }
    }
}

/// Which part of a windowed transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    /// The session header announcing size and window count.
    Header,
    /// A payload window.
    Window(u16),
}

impl std::fmt::Display for TransferStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStep::Header => write!(f, "header"),
            TransferStep::Window(i) => write!(f, "window {}", i),
        }
    }
}

/// Reason recorded for the final failed attempt of a transfer step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    #[error("device reported checksum failure")]
    ChecksumFail,

    #[error("device reported out-of-order window (got ack for {got})")]
    OutOfOrder { got: u16 },

    #[error("no acknowledgment within timeout")]
    Timeout,

    #[error("malformed acknowledgment: {0}")]
    Malformed(String),

    #[error("acknowledgment channel closed")]
    ChannelClosed,
}
