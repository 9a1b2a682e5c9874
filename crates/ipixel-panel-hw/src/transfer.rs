//! Windowed animation transfer with per-window acknowledgment.
//!
//! A session announces the payload with a header frame, then sends fixed-size
//! windows strictly in order. Every frame must be acknowledged before the
//! next one goes out; failed or missing acks resend the same frame until the
//! per-window retry budget runs out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::connection::{AckWait, ConnectionManager};
use crate::error::{TransferFailure, TransferStep};
use crate::protocol::{
    decode_ack, encode_header, encode_window, window_count, windows, AckStatus, ControlCommand,
    HEADER_ACK_INDEX, WINDOW_SIZE,
};
use crate::unit::UnitId;
use crate::{Error, Result};

/// Ack wait and retry budget for transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub ack_timeout: Duration,
    /// Failed attempts allowed per frame before the session aborts.
    pub max_retries: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&Timing::default())
    }
}

impl From<&Timing> for TransferSettings {
    fn from(timing: &Timing) -> Self {
        Self {
            ack_timeout: timing.ack_timeout(),
            max_retries: timing.max_window_retries.max(1),
        }
    }
}

/// Cooperative cancellation flag, checked between windows.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears a stale request before a new session starts.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Engine state for the current (or last) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    HeaderSent,
    WindowSent(u16),
    AwaitingAck(TransferStep),
    Complete,
    Aborted(TransferStep),
}

/// Bookkeeping for one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub unit: UnitId,
    pub session_id: u8,
    pub total_len: usize,
    pub window_count: u16,
    pub next_window: u16,
    /// Failed attempts for the frame currently in flight.
    pub retries: u32,
    pub state: SessionState,
}

impl TransferSession {
    pub fn window_size(&self) -> usize {
        WINDOW_SIZE
    }
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete { windows: u16 },
    /// Stopped by the caller before `next_window` was sent.
    Cancelled { next_window: u16 },
}

/// Per-unit transfer engine. Kept across sessions so the last outcome stays queryable.
#[derive(Debug, Default)]
pub struct WindowedTransferEngine {
    settings: TransferSettings,
    session: Option<TransferSession>,
    next_session_id: u8,
}

impl WindowedTransferEngine {
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            settings,
            session: None,
            next_session_id: 0,
        }
    }

    /// The current or most recent session.
    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// True once a session completed, until the next one starts.
    pub fn is_complete(&self) -> bool {
        self.state() == SessionState::Complete
    }

    /// Runs a full session over `conn`. The caller must hold the unit exclusively.
    pub async fn run(
        &mut self,
        conn: &mut ConnectionManager,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<TransferOutcome> {
        let unit = conn.id();
        if payload.is_empty() {
            return Err(Error::Config(format!("empty animation payload for unit {}", unit)));
        }
        let total_len = u32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
        let count = u16::try_from(window_count(payload.len())).map_err(|_| {
            Error::PayloadTooLarge {
                len: payload.len(),
                max: u16::MAX as usize * WINDOW_SIZE,
            }
        })?;

        if cancel.is_cancelled() {
            info!("Unit {}: animation cancelled before the header", unit);
            return Ok(TransferOutcome::Cancelled { next_window: 0 });
        }

        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        self.session = Some(TransferSession {
            unit,
            session_id,
            total_len: payload.len(),
            window_count: count,
            next_window: 0,
            retries: 0,
            state: SessionState::Idle,
        });
        info!(
            "Unit {}: animation session {} started ({} bytes, {} window(s))",
            unit, session_id, total_len, count
        );

        let header = encode_header(unit, session_id, total_len, count);
        self.set_state(SessionState::HeaderSent);
        self.deliver(conn, &header, TransferStep::Header).await?;

        for (index, chunk) in windows(payload).enumerate() {
            let index = index as u16;
            if cancel.is_cancelled() {
                self.abort(conn, "cancelled").await;
                self.set_state(SessionState::Idle);
                info!("Unit {}: session {} cancelled before window {}", unit, session_id, index);
                return Ok(TransferOutcome::Cancelled { next_window: index });
            }

            let frame = encode_window(unit, session_id, index, chunk)?;
            self.set_state(SessionState::WindowSent(index));
            self.deliver(conn, &frame, TransferStep::Window(index)).await?;
            if let Some(session) = self.session.as_mut() {
                session.next_window = index + 1;
            }
        }

        self.set_state(SessionState::Complete);
        info!("Unit {}: session {} complete", unit, session_id);
        Ok(TransferOutcome::Complete { windows: count })
    }

    /// Sends one frame until it is acknowledged OK or the retry budget is spent.
    async fn deliver(
        &mut self,
        conn: &mut ConnectionManager,
        frame: &[u8],
        step: TransferStep,
    ) -> Result<()> {
        let settings = self.settings;
        let expected = match step {
            TransferStep::Header => HEADER_ACK_INDEX,
            TransferStep::Window(i) => i,
        };
        if let Some(session) = self.session.as_mut() {
            session.retries = 0;
        }

        let mut failures = 0u32;
        loop {
            conn.discard_pending_acks();
            if let Err(e) = conn.write(frame).await {
                self.set_state(SessionState::Aborted(step));
                return Err(e);
            }
            self.set_state(SessionState::AwaitingAck(step));

            let failure = match conn.wait_for_ack(settings.ack_timeout).await {
                AckWait::Received(bytes) => match decode_ack(&bytes) {
                    Ok(ack) if ack.window != expected => TransferFailure::OutOfOrder { got: ack.window },
                    Ok(ack) => match ack.status {
                        AckStatus::Ok => {
                            debug!("Unit {}: {} acknowledged", conn.id(), step);
                            return Ok(());
                        }
                        AckStatus::ChecksumFail => TransferFailure::ChecksumFail,
                        AckStatus::OutOfOrder => TransferFailure::OutOfOrder { got: ack.window },
                    },
                    Err(e) => TransferFailure::Malformed(e.to_string()),
                },
                AckWait::TimedOut => TransferFailure::Timeout,
                AckWait::Closed => TransferFailure::ChannelClosed,
            };

            failures += 1;
            if let Some(session) = self.session.as_mut() {
                session.retries = failures;
            }
            if failures >= settings.max_retries {
                warn!(
                    "Unit {}: {} failed {} time(s), aborting: {}",
                    conn.id(),
                    step,
                    failures,
                    failure
                );
                self.set_state(SessionState::Aborted(step));
                self.abort(conn, "retries exhausted").await;
                return Err(Error::Transfer {
                    unit: conn.id(),
                    step,
                    reason: failure,
                });
            }
            warn!(
                "Unit {}: {} attempt {}/{} failed ({}), resending",
                conn.id(),
                step,
                failures,
                settings.max_retries,
                failure
            );
        }
    }

    /// Best-effort abort frame; failure is only logged.
    async fn abort(&mut self, conn: &mut ConnectionManager, why: &str) {
        if let Err(e) = conn.send_control(ControlCommand::Abort).await {
            warn!("Unit {}: abort ({}) not delivered: {}", conn.id(), why, e);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
    }
}
