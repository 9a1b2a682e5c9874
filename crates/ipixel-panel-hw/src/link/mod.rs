//! Byte transports to a single unit.
//!
//! A transport only moves bytes: it connects, writes chunks no longer than
//! [`Transport::max_write_len`], and forwards device notifications into the
//! channel handed to it on connect. Fragmentation, reconnects and acks are
//! handled by the layers above.

#[cfg(feature = "ble")]
mod ble;
#[cfg(test)]
pub(crate) mod mock;
mod serial;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(feature = "ble")]
pub use ble::BleTransport;
pub use serial::{SerialTransport, DEFAULT_BAUD_RATE};

/// Sender side of a unit's notification channel.
pub type NotificationSender = mpsc::Sender<Vec<u8>>;

/// Transport-level failures.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid address {0}")]
    AddressInvalid(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out")]
    Timeout,

    /// The link dropped; a reconnect may recover it.
    #[error("link lost: {0}")]
    Disconnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Returns true if the failure means the link itself is gone.
    pub fn is_link_loss(&self) -> bool {
        match self {
            LinkError::Disconnected(_) => true,
            LinkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A raw link to one unit.
#[async_trait]
pub trait Transport: Send {
    /// Opens the link and starts forwarding notifications to `notifications`.
    async fn connect(
        &mut self,
        timeout: Duration,
        notifications: NotificationSender,
    ) -> Result<(), LinkError>;

    /// Writes one chunk of at most `max_write_len()` bytes.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError>;

    /// Largest chunk a single write accepts.
    fn max_write_len(&self) -> usize;

    /// Closes the link. Never fails.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_loss_classification() {
        assert!(LinkError::Disconnected("gone".into()).is_link_loss());
        assert!(LinkError::Io(std::io::ErrorKind::BrokenPipe.into()).is_link_loss());
        assert!(!LinkError::Io(std::io::ErrorKind::InvalidInput.into()).is_link_loss());
        assert!(!LinkError::Timeout.is_link_loss());
        assert!(!LinkError::AddressInvalid("x".into()).is_link_loss());
    }
}
