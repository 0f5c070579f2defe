// src/transport/ble.rs
//
// BLE SMP transport over the standard SMP GATT service. Messages larger
// than the ATT payload are written in chunks; the device reassembles by
// the SMP header length, and responses arrive as notifications that are
// reassembled here the same way.
//
// The negotiated MTU is not always honest: some stacks accept a large
// MTU and then fail writes near it. A failed write backs the chunk size
// off in steps and resumes from the first unsent byte, remembering the
// largest MTU that has actually worked. Already-delivered bytes are
// never resent; the peer reassembles purely by header-declared length,
// so a duplicate would corrupt the message.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{SmpHeader, SmpMessage, SMP_HEADER_SIZE};
use crate::transport::{SmpTransport, DEFAULT_TRANSPORT_RETRIES, DEFAULT_TRANSPORT_TIMEOUT};

/// SMP GATT service.
pub const SMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x8D53DC1D_1DB7_4CD3_868B_8A527460AA84);
/// SMP characteristic (write without response + notify).
pub const SMP_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xDA2E7828_FBCE_4E01_AE9E_261174997C48);

/// ATT header bytes subtracted from the MTU per write.
const ATT_HEADER_SIZE: usize = 3;
/// Smallest chunk worth attempting; below this the link is unusable.
const BLE_CHUNK_MIN: usize = 20;
/// Largest ATT payload any stack will take.
const BLE_CHUNK_MAX: usize = 509;
/// MTU reduction step after a failed write.
const BLE_MTU_BACKOFF_STEP: usize = 32;

pub const DEFAULT_BLE_MTU: usize = 490;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Advertised device name to connect to; `None` takes the first
    /// peripheral advertising the SMP service.
    pub device_name: Option<String>,
    pub mtu: usize,
    pub write_with_response: bool,
    pub scan_timeout: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for BleConfig {
    fn default() -> Self {
        BleConfig {
            device_name: None,
            mtu: DEFAULT_BLE_MTU,
            write_with_response: false,
            scan_timeout: Duration::from_secs(10),
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
            retries: DEFAULT_TRANSPORT_RETRIES,
        }
    }
}

fn chunk_size(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_HEADER_SIZE).clamp(BLE_CHUNK_MIN, BLE_CHUNK_MAX)
}

/// Accumulates notification payloads and splits out complete messages by
/// the header length field.
#[derive(Default)]
struct BleReassembler {
    buf: Vec<u8>,
}

impl BleReassembler {
    fn push(&mut self, data: &[u8]) -> Vec<SmpMessage> {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        while self.buf.len() >= SMP_HEADER_SIZE {
            let total = match SmpHeader::parse(&self.buf) {
                Ok(header) => SMP_HEADER_SIZE + header.length as usize,
                Err(_) => break,
            };
            if self.buf.len() < total {
                break;
            }
            let bytes: Vec<u8> = self.buf.drain(..total).collect();
            out.push(SmpMessage::from_bytes(bytes));
        }
        out
    }
}

pub struct BleTransport {
    config: BleConfig,
    peripheral: Peripheral,
    characteristic: Characteristic,
    rx: mpsc::UnboundedReceiver<SmpMessage>,
    notify_task: Option<JoinHandle<()>>,
    mtu: usize,
    /// Largest MTU a write has succeeded at on this link.
    mtu_max_worked: usize,
}

impl BleTransport {
    /// Scan for the device, connect, and subscribe to SMP notifications.
    /// The subscription is established before anything is written so the
    /// first response cannot be lost.
    pub async fn connect(config: BleConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidConfiguration("no BLE adapter present".into()))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SMP_SERVICE_UUID],
            })
            .await?;
        let peripheral = find_peripheral(&adapter, &config).await;
        let _ = adapter.stop_scan().await;
        let peripheral = peripheral?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == SMP_CHARACTERISTIC_UUID)
            .ok_or_else(|| {
                Error::InvalidConfiguration("device has no SMP characteristic".into())
            })?;

        peripheral.subscribe(&characteristic).await?;

        let mut notifications = peripheral.notifications().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let notify_task = tokio::spawn(async move {
            let mut reassembler = BleReassembler::default();
            while let Some(notification) = notifications.next().await {
                if notification.uuid != SMP_CHARACTERISTIC_UUID {
                    continue;
                }
                for msg in reassembler.push(&notification.value) {
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            }
            debug!("BLE notification stream ended");
        });

        info!(mtu = config.mtu, "BLE SMP link established");

        Ok(BleTransport {
            mtu: config.mtu,
            config,
            peripheral,
            characteristic,
            rx,
            notify_task: Some(notify_task),
            mtu_max_worked: 0,
        })
    }

    fn write_type(&self) -> WriteType {
        if self.config.write_with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        }
    }
}

async fn find_peripheral(
    adapter: &btleplug::platform::Adapter,
    config: &BleConfig,
) -> Result<Peripheral> {
    let deadline = tokio::time::Instant::now() + config.scan_timeout;
    loop {
        for peripheral in adapter.peripherals().await? {
            let properties = peripheral.properties().await?;
            let Some(properties) = properties else {
                continue;
            };
            let advertises_smp = properties.services.contains(&SMP_SERVICE_UUID);
            let name_matches = match (&config.device_name, &properties.local_name) {
                (Some(wanted), Some(name)) => wanted == name,
                (Some(_), None) => false,
                (None, _) => advertises_smp,
            };
            if name_matches {
                return Ok(peripheral);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }
}

/// Write `data` in `chunk_size(mtu)` pieces through `write`. A failed
/// chunk lowers the MTU and resumes from the first unsent byte; bytes
/// the device already took stay taken. Raises the worked watermark once
/// the whole message is out.
async fn write_backoff<'c>(
    data: &[u8],
    mtu: &mut usize,
    mtu_max_worked: &mut usize,
    mut write: impl FnMut(Vec<u8>) -> BoxFuture<'c, std::result::Result<(), btleplug::Error>>,
) -> Result<()> {
    let mut written = 0;
    loop {
        let chunk = chunk_size(*mtu);
        let mut write_error = None;
        while written < data.len() {
            let end = (written + chunk).min(data.len());
            match write(data[written..end].to_vec()).await {
                Ok(()) => written = end,
                Err(e) => {
                    write_error = Some(e);
                    break;
                }
            }
        }

        let Some(e) = write_error else {
            if *mtu > *mtu_max_worked {
                *mtu_max_worked = *mtu;
            }
            return Ok(());
        };

        if chunk <= BLE_CHUNK_MIN {
            warn!("BLE write failed at minimum chunk size: {e}");
            return Err(Error::BleLinkUnusable);
        }
        *mtu = mtu
            .saturating_sub(BLE_MTU_BACKOFF_STEP)
            .max(BLE_CHUNK_MIN + ATT_HEADER_SIZE);
        warn!(mtu = *mtu, "BLE write failed, resuming with smaller chunks: {e}");
    }
}

#[async_trait]
impl SmpTransport for BleTransport {
    async fn send(&mut self, msg: &SmpMessage) -> Result<()> {
        // A shrunken MTU from an earlier exchange recovers to the best
        // value this link has actually carried.
        if self.mtu_max_worked > self.mtu {
            self.mtu = self.mtu_max_worked;
        }
        let write_type = self.write_type();

        let BleTransport {
            peripheral,
            characteristic,
            mtu,
            mtu_max_worked,
            ..
        } = self;
        let peripheral: &Peripheral = peripheral;
        let characteristic: &Characteristic = characteristic;

        write_backoff(msg.bytes(), mtu, mtu_max_worked, move |part| {
            Box::pin(async move { peripheral.write(characteristic, &part, write_type).await })
        })
        .await
    }

    async fn receive(&mut self) -> Result<SmpMessage> {
        self.rx.recv().await.ok_or(Error::TransportNotConnected)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        let _ = self.peripheral.unsubscribe(&self.characteristic).await;
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn retries(&self) -> u32 {
        self.config.retries
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}
