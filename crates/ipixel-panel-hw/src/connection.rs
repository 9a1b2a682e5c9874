//! Per-unit link ownership: connect, fragmented writes, reconnect, acks.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::error::ConnectionFailure;
use crate::link::{LinkError, Transport};
use crate::protocol::{encode_control, ControlCommand};
use crate::unit::{ConnectionState, Unit, UnitId};
use crate::{Error, Result};

/// Queued notifications per unit before the transport starts dropping them.
const NOTIFICATION_QUEUE: usize = 32;

/// Backoff ceiling as a multiple of the base delay.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Reconnect behaviour after link loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based reconnect attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX)
            .min(MAX_BACKOFF_FACTOR);
        self.base_delay * factor
    }
}

impl From<&Timing> for ReconnectPolicy {
    fn from(timing: &Timing) -> Self {
        Self {
            connect_timeout: timing.connect_timeout(),
            attempts: timing.reconnect_attempts,
            base_delay: timing.reconnect_delay(),
        }
    }
}

/// Result of waiting for a device notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckWait {
    Received(Vec<u8>),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The link's notification channel is gone.
    Closed,
}

/// Exclusive owner of one unit's link.
pub struct ConnectionManager {
    unit: Unit,
    transport: Box<dyn Transport>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    notifications: Option<mpsc::Receiver<Vec<u8>>>,
}

impl ConnectionManager {
    pub fn new(unit: Unit, transport: Box<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            unit,
            transport,
            policy,
            state: watch::channel(ConnectionState::Disconnected).0,
            notifications: None,
        }
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn id(&self) -> UnitId {
        self.unit.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observes state changes without locking the manager.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Opens the link using the configured connect timeout.
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_with_timeout(self.policy.connect_timeout).await
    }

    /// Opens the link, classifying failures.
    pub async fn connect_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match self.open(timeout).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Unit {} connected ({})", self.unit.id, self.unit.address);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                warn!("Unit {} failed to connect: {}", self.unit.id, e);
                Err(Error::connection(self.unit.id, e.into()))
            }
        }
    }

    async fn open(&mut self, timeout: Duration) -> std::result::Result<(), LinkError> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        // Fresh channel per connection so late acks from a dead link never leak in.
        self.notifications = None;
        match tokio::time::timeout(timeout, self.transport.connect(timeout, tx)).await {
            Ok(Ok(())) => {
                self.notifications = Some(rx);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Writes one frame, fragmented to the transport's write limit.
    ///
    /// On link loss the manager reconnects with backoff and rewrites the whole
    /// frame; any other failure is returned to the caller untouched. At most
    /// `attempts` reconnects are made per call, however often the link drops.
    pub async fn write(&mut self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection(self.unit.id, ConnectionFailure::NotConnected));
        }

        let mut reconnects = 0;
        loop {
            match self.write_fragments(frame).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_link_loss() => {
                    warn!("Unit {} lost its link: {}", self.unit.id, e);
                    self.reconnect(e, &mut reconnects).await?;
                }
                Err(e) => {
                    return Err(Error::connection(
                        self.unit.id,
                        ConnectionFailure::Write(e.to_string()),
                    ))
                }
            }
        }
    }

    async fn write_fragments(&mut self, frame: &[u8]) -> std::result::Result<(), LinkError> {
        let limit = self.transport.max_write_len().max(1);
        for chunk in frame.chunks(limit) {
            self.transport.write(chunk).await?;
        }
        debug!(
            "Unit {}: wrote {} bytes in {} chunk(s)",
            self.unit.id,
            frame.len(),
            frame.len().div_ceil(limit)
        );
        Ok(())
    }

    /// Reconnects, drawing attempts from the caller's budget `used`.
    /// Backoff restarts at the base delay on every link loss.
    async fn reconnect(&mut self, cause: LinkError, used: &mut u32) -> Result<()> {
        self.transport.close().await;
        self.set_state(ConnectionState::Connecting);

        let mut last = cause.to_string();
        let mut attempt = 0;
        while *used < self.policy.attempts {
            *used += 1;
            attempt += 1;
            let delay = self.policy.backoff(attempt);
            debug!(
                "Unit {}: reconnect attempt {}/{} in {:?}",
                self.unit.id, used, self.policy.attempts, delay
            );
            tokio::time::sleep(delay).await;

            match self.open(self.policy.connect_timeout).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!("Unit {} reconnected after {} attempt(s)", self.unit.id, attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Unit {}: reconnect attempt {} failed: {}", self.unit.id, used, e);
                    last = e.to_string();
                }
            }
        }

        self.transport.close().await;
        self.set_state(ConnectionState::Failed);
        Err(Error::connection(
            self.unit.id,
            ConnectionFailure::LinkLost {
                attempts: *used,
                last,
            },
        ))
    }

    /// Waits up to `timeout` for the next device notification.
    pub async fn wait_for_ack(&mut self, timeout: Duration) -> AckWait {
        let Some(rx) = self.notifications.as_mut() else {
            return AckWait::Closed;
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(bytes)) => AckWait::Received(bytes),
            Ok(None) => AckWait::Closed,
            Err(_) => AckWait::TimedOut,
        }
    }

    /// Drops notifications that arrived before the next send.
    pub fn discard_pending_acks(&mut self) -> usize {
        let mut dropped = 0;
        if let Some(rx) = self.notifications.as_mut() {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Unit {}: discarded {} stale notification(s)", self.unit.id, dropped);
        }
        dropped
    }

    /// Sends a control frame to this unit.
    pub async fn send_control(&mut self, command: ControlCommand) -> Result<()> {
        self.write(&encode_control(command, self.unit.id)).await?;
        debug!("Unit {}: sent {}", self.unit.id, command);
        Ok(())
    }

    /// Blanks the unit and closes the link. Never fails.
    pub async fn disconnect(&mut self) {
        if self.is_connected() {
            if let Err(e) = self.send_control(ControlCommand::Clear).await {
                warn!("Unit {}: clear before disconnect failed: {}", self.unit.id, e);
            }
        }
        self.transport.close().await;
        self.notifications = None;
        self.set_state(ConnectionState::Disconnected);
        info!("Unit {} disconnected", self.unit.id);
    }
}
