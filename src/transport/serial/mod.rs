// src/transport/serial/mod.rs
//
// Serial (UART console) SMP transport. The port is opened blocking with a
// short read timeout; a blocking reader task owns the framer and pumps
// complete messages into a channel, writes go through spawn_blocking on a
// cloned port handle.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::message::SmpMessage;
use crate::transport::{SmpTransport, DEFAULT_TRANSPORT_RETRIES, DEFAULT_TRANSPORT_TIMEOUT};

pub mod framer;

use framer::{encode_frames, SmpFramer, DEFAULT_GARBAGE_THRESHOLD};

/// Wire-byte budget per message on a console link.
pub const DEFAULT_SERIAL_MTU: usize = 256;

const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Total framed bytes a message may occupy on the wire.
    pub mtu: usize,
    /// Console noise tolerated in the receive buffer before flushing.
    pub garbage_threshold: usize,
    pub timeout: Duration,
    pub retries: u32,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        SerialConfig {
            port: port.into(),
            baud_rate,
            mtu: DEFAULT_SERIAL_MTU,
            garbage_threshold: DEFAULT_GARBAGE_THRESHOLD,
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
            retries: DEFAULT_TRANSPORT_RETRIES,
        }
    }
}

/// List serial port names present on the system.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect())
}

pub struct SerialTransport {
    config: SerialConfig,
    writer: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    rx: mpsc::UnboundedReceiver<SmpMessage>,
    shutdown: Arc<AtomicBool>,
    reader_task: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open the port and start the reader task.
    pub async fn connect(config: SerialConfig) -> Result<Self> {
        let port_name = config.port.clone();
        let baud_rate = config.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(READ_POLL_INTERVAL)
                .open()
        })
        .await
        .map_err(join_error)??;

        let writer = port.try_clone()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader_task = tokio::task::spawn_blocking({
            let shutdown = Arc::clone(&shutdown);
            let garbage_threshold = config.garbage_threshold;
            let mut port = port;
            move || {
                let mut framer = SmpFramer::new(garbage_threshold);
                let mut buf = [0u8; 1024];
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match port.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => {
                            for msg in framer.feed(&buf[..n]) {
                                if tx.send(msg).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            error!("serial read failed, stopping reader: {e}");
                            return;
                        }
                    }
                }
                debug!("serial reader stopped");
            }
        });

        Ok(SerialTransport {
            config,
            writer: Arc::new(Mutex::new(writer)),
            rx,
            shutdown,
            reader_task: Some(reader_task),
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn poisoned_writer() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, "serial writer poisoned"))
}

#[async_trait]
impl SmpTransport for SerialTransport {
    async fn send(&mut self, msg: &SmpMessage) -> Result<()> {
        let frames = encode_frames(msg);
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut port = writer.lock().map_err(|_| poisoned_writer())?;
            for frame in &frames {
                port.write_all(frame)?;
            }
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn receive(&mut self) -> Result<SmpMessage> {
        self.rx.recv().await.ok_or(Error::TransportNotConnected)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn max_message_data_size(&self, mtu: usize) -> usize {
        framer::max_message_data_size(mtu)
    }

    fn retries(&self) -> u32 {
        self.config.retries
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
