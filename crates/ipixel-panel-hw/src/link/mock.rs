//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{LinkError, NotificationSender, Transport};

/// Produces device notifications in reply to a written chunk.
pub(crate) type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
pub(crate) struct MockState {
    pub writes: Vec<Vec<u8>>,
    pub connects: u32,
    pub closes: u32,
    pub connected: bool,
    /// Results for upcoming connect calls; empty means success.
    pub connect_script: VecDeque<Result<(), LinkError>>,
    /// Results for upcoming write calls; empty means success.
    pub write_script: VecDeque<Result<(), LinkError>>,
    pub responder: Option<Responder>,
    /// Once this many chunks have been written, the link is gone for good.
    pub drop_after: Option<usize>,
    notifications: Option<NotificationSender>,
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone, Default)]
pub(crate) struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().writes.clone()
    }

    pub fn connects(&self) -> u32 {
        self.0.lock().unwrap().connects
    }

    pub fn closes(&self) -> u32 {
        self.0.lock().unwrap().closes
    }

    pub fn fail_next_connect(&self, err: LinkError) {
        self.0.lock().unwrap().connect_script.push_back(Err(err));
    }

    pub fn fail_next_write(&self, err: LinkError) {
        self.0.lock().unwrap().write_script.push_back(Err(err));
    }

    /// Makes every write after the current ones fail with link loss.
    pub fn drop_link(&self) {
        let mut state = self.0.lock().unwrap();
        for _ in 0..64 {
            state
                .write_script
                .push_back(Err(LinkError::Disconnected("peer gone".into())));
            state
                .connect_script
                .push_back(Err(LinkError::Unreachable("peer gone".into())));
        }
    }

    /// Lets `writes` more chunks through, then drops the link permanently.
    pub fn drop_link_after(&self, writes: usize) {
        let mut state = self.0.lock().unwrap();
        state.drop_after = Some(state.writes.len() + writes);
    }

    pub fn respond_with(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        self.0.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Pushes a notification as if the device had sent it.
    pub fn notify(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.0.lock().unwrap().notifications {
            let _ = tx.try_send(bytes);
        }
    }
}

pub(crate) struct MockTransport {
    handle: MockHandle,
    max_write_len: usize,
}

impl MockState {
    fn link_dropped(&self) -> bool {
        self.drop_after.is_some_and(|n| self.writes.len() >= n)
    }
}

impl MockTransport {
    pub fn new(max_write_len: usize) -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
                max_write_len,
            },
            handle,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &mut self,
        _timeout: Duration,
        notifications: NotificationSender,
    ) -> Result<(), LinkError> {
        let mut state = self.handle.0.lock().unwrap();
        state.connects += 1;
        if state.link_dropped() {
            return Err(LinkError::Unreachable("mock link dropped".into()));
        }
        state.connect_script.pop_front().unwrap_or(Ok(()))?;
        state.connected = true;
        state.notifications = Some(notifications);
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        let mut state = self.handle.0.lock().unwrap();
        if !state.connected {
            return Err(LinkError::Disconnected("mock not connected".into()));
        }
        if state.link_dropped() {
            state.connected = false;
            return Err(LinkError::Disconnected("mock link dropped".into()));
        }
        if let Some(result) = state.write_script.pop_front() {
            if result.is_err() {
                state.connected = false;
            }
            result?;
        }
        state.writes.push(chunk.to_vec());

        let replies = match state.responder.as_mut() {
            Some(responder) => responder(chunk),
            None => Vec::new(),
        };
        if let Some(tx) = &state.notifications {
            for reply in replies {
                let _ = tx.try_send(reply);
            }
        }
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn close(&mut self) {
        let mut state = self.handle.0.lock().unwrap();
        state.closes += 1;
        state.connected = false;
        state.notifications = None;
    }
}

/// Replies to header and window frames with OK acks, like a healthy device.
pub(crate) fn acking_device() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send {
    use crate::protocol::{Ack, AckStatus, Opcode, HEADER_ACK_INDEX};

    |frame: &[u8]| match frame.first() {
        Some(&op) if op == Opcode::AnimHeader as u8 => {
            vec![Ack::new(HEADER_ACK_INDEX, AckStatus::Ok).encode().to_vec()]
        }
        Some(&op) if op == Opcode::AnimWindow as u8 && frame.len() >= 5 => {
            let index = u16::from_le_bytes([frame[3], frame[4]]);
            vec![Ack::new(index, AckStatus::Ok).encode().to_vec()]
        }
        _ => Vec::new(),
    }
}
