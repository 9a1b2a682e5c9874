//! Serial transport for BLE-UART bridge modules.
//!
//! The bridge holds the radio link to the panel and exposes it as a plain
//! serial port. Bytes written to the port go out over the air unchanged;
//! bytes coming back are device notifications, three bytes per ack.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info};

use super::{LinkError, NotificationSender, Transport};
use crate::protocol::ACK_LEN;

/// Default bridge baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial bridge transport.
pub struct SerialTransport {
    port_path: String,
    baud_rate: u32,
    max_write_len: usize,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Creates a transport for the given port. Nothing is opened yet.
    pub fn new(port_path: &str, baud_rate: u32, max_write_len: usize) -> Self {
        Self {
            port_path: port_path.to_string(),
            baud_rate,
            max_write_len: max_write_len.max(1),
            writer: None,
            reader: None,
        }
    }

    /// Returns the port path.
    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    fn classify(&self, e: tokio_serial::Error) -> LinkError {
        match &e.kind {
            tokio_serial::ErrorKind::NoDevice => LinkError::Unreachable(e.description),
            tokio_serial::ErrorKind::InvalidInput => LinkError::AddressInvalid(self.port_path.clone()),
            tokio_serial::ErrorKind::Io(kind) => {
                if !std::path::Path::new(&self.port_path).exists() {
                    LinkError::Unreachable(format!("{} does not exist", self.port_path))
                } else {
                    LinkError::Io(std::io::Error::new(*kind, e.description))
                }
            }
            _ => LinkError::Unreachable(e.description),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(
        &mut self,
        _timeout: Duration,
        notifications: NotificationSender,
    ) -> Result<(), LinkError> {
        self.close().await;

        if self.port_path.trim().is_empty() {
            return Err(LinkError::AddressInvalid(self.port_path.clone()));
        }

        // Opening a local port does not block, so the timeout has nothing to bound.
        let port = tokio_serial::new(&self.port_path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| self.classify(e))?;

        let (mut reader, writer) = tokio::io::split(port);
        let path = self.port_path.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut pending = Vec::new();
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        while pending.len() >= ACK_LEN {
                            let ack: Vec<u8> = pending.drain(..ACK_LEN).collect();
                            if notifications.send(ack).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Serial read on {} ended: {}", path, e);
                        break;
                    }
                }
            }
        });

        self.writer = Some(writer);
        self.reader = Some(task);
        info!("Serial bridge opened at {} ({} baud)", self.port_path, self.baud_rate);
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| LinkError::Disconnected(format!("{} is not open", self.port_path)))?;

        writer.write_all(chunk).await?;
        writer.flush().await?;
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn close(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            debug!("Serial bridge at {} closed", self.port_path);
        }
    }
}
