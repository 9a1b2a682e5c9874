//! Native BLE transport.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LinkError, NotificationSender, Transport};

/// How often the scan results are polled while looking for the unit.
const SCAN_POLL: Duration = Duration::from_millis(250);

impl From<btleplug::Error> for LinkError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => LinkError::Unreachable(e.to_string()),
            btleplug::Error::NotConnected => LinkError::Disconnected(e.to_string()),
            btleplug::Error::TimedOut(_) => LinkError::Timeout,
            other => LinkError::Disconnected(other.to_string()),
        }
    }
}

/// BLE link to one panel, writing without response to a GATT characteristic.
pub struct BleTransport {
    address: String,
    write_uuid: String,
    notify_uuid: Option<String>,
    max_write_len: usize,
    /// Adapter with a scan in progress.
    scanning: Option<Adapter>,
    /// Set as soon as the link is up, so `close` can tear down a half-built connection.
    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    notify_task: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(
        address: &str,
        write_uuid: &str,
        notify_uuid: Option<&str>,
        max_write_len: usize,
    ) -> Self {
        Self {
            address: address.to_string(),
            write_uuid: write_uuid.to_string(),
            notify_uuid: notify_uuid.map(str::to_string),
            max_write_len: max_write_len.max(1),
            scanning: None,
            peripheral: None,
            write_char: None,
            notify_task: None,
        }
    }

    fn parse_uuid(value: &str) -> Result<Uuid, LinkError> {
        Uuid::parse_str(value).map_err(|_| LinkError::AddressInvalid(value.to_string()))
    }

    async fn find_peripheral(&mut self, addr: BDAddr) -> Result<Peripheral, LinkError> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Unreachable("no Bluetooth adapter".to_string()))?;

        central.start_scan(ScanFilter::default()).await?;
        self.scanning = Some(central.clone());
        let found = loop {
            let hit = central
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.address() == addr);
            if let Some(p) = hit {
                break p;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };
        self.stop_scan().await;
        Ok(found)
    }

    async fn stop_scan(&mut self) {
        if let Some(central) = self.scanning.take() {
            if let Err(e) = central.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        }
    }

    async fn establish(
        &mut self,
        addr: BDAddr,
        write_uuid: Uuid,
        notify_uuid: Option<Uuid>,
        notifications: NotificationSender,
    ) -> Result<(), LinkError> {
        let peripheral = self.find_peripheral(addr).await?;
        peripheral.connect().await?;
        self.peripheral = Some(peripheral.clone());
        peripheral.discover_services().await?;

        let chars = peripheral.characteristics();
        let write_char = chars
            .iter()
            .find(|c| c.uuid == write_uuid)
            .cloned()
            .ok_or_else(|| {
                LinkError::Unreachable(format!("write characteristic {} not found", write_uuid))
            })?;

        if let Some(notify_uuid) = notify_uuid {
            match chars.iter().find(|c| c.uuid == notify_uuid) {
                Some(c) => {
                    peripheral.subscribe(c).await?;
                    let mut stream = peripheral.notifications().await?;
                    self.notify_task = Some(tokio::spawn(async move {
                        while let Some(n) = stream.next().await {
                            if n.uuid == notify_uuid && notifications.send(n.value).await.is_err() {
                                break;
                            }
                        }
                    }));
                }
                None => warn!(
                    "Notify characteristic {} not found on {}; acks will time out",
                    notify_uuid, self.address
                ),
            }
        }

        self.write_char = Some(write_char);
        Ok(())
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(
        &mut self,
        timeout: Duration,
        notifications: NotificationSender,
    ) -> Result<(), LinkError> {
        self.close().await;

        let addr = BDAddr::from_str(&self.address)
            .map_err(|_| LinkError::AddressInvalid(self.address.clone()))?;
        let write_uuid = Self::parse_uuid(&self.write_uuid)?;
        let notify_uuid = self.notify_uuid.as_deref().map(Self::parse_uuid).transpose()?;

        let result = match tokio::time::timeout(
            timeout,
            self.establish(addr, write_uuid, notify_uuid, notifications),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };
        if let Err(e) = result {
            debug!("BLE connect to {} failed: {}", self.address, e);
            self.close().await;
            return Err(e);
        }

        info!("BLE link up to {}", self.address);
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        let (peripheral, write_char) = match (&self.peripheral, &self.write_char) {
            (Some(p), Some(c)) => (p, c),
            _ => return Err(LinkError::Disconnected(format!("{} not connected", self.address))),
        };
        peripheral
            .write(write_char, chunk, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn close(&mut self) {
        self.stop_scan().await;
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.write_char = None;
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(e) = peripheral.disconnect().await {
                debug!("BLE disconnect from {} failed: {}", self.address, e);
            }
        }
    }
}
