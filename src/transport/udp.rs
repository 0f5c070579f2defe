// src/transport/udp.rs
//
// UDP SMP transport: one message per datagram, no framing. The local
// socket is bound to the unspecified address of the same family as the
// resolved target.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::SmpMessage;
use crate::transport::{SmpTransport, DEFAULT_TRANSPORT_RETRIES, DEFAULT_TRANSPORT_TIMEOUT};

/// Datagram budget per message.
pub const DEFAULT_UDP_MTU: usize = 1500;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Target as `host:port`.
    pub address: String,
    pub mtu: usize,
    pub timeout: Duration,
    pub retries: u32,
}

impl UdpConfig {
    pub fn new(address: impl Into<String>) -> Self {
        UdpConfig {
            address: address.into(),
            mtu: DEFAULT_UDP_MTU,
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
            retries: DEFAULT_TRANSPORT_RETRIES,
        }
    }
}

pub struct UdpTransport {
    config: UdpConfig,
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(config: UdpConfig) -> Result<Self> {
        let target = lookup_host(&config.address)
            .await?
            .next()
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!("cannot resolve {}", config.address))
            })?;

        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        debug!(%target, "UDP SMP link ready");

        Ok(UdpTransport { config, socket })
    }
}

#[async_trait]
impl SmpTransport for UdpTransport {
    async fn send(&mut self, msg: &SmpMessage) -> Result<()> {
        self.socket.send(msg.bytes()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<SmpMessage> {
        let mut buf = vec![0u8; 65535];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(SmpMessage::from_bytes(buf))
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn retries(&self) -> u32 {
        self.config.retries
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}
