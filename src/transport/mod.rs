// src/transport/mod.rs
//
// Transport adapters: each one moves whole SMP messages across a link
// with its own framing and size limits. The group engine only ever sees
// `send` / `receive` on complete messages.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::SmpMessage;

pub mod ble;
pub mod lorawan;
pub mod serial;
pub mod udp;

#[cfg(test)]
pub mod mock;

/// Resend attempts after the first send, before giving up on a response.
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;

/// How long to wait for a response before a resend attempt.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_millis(3000);

/// A connected SMP link.
///
/// `receive` yields the next fully reassembled message from the device;
/// partial frames, CRC failures and console noise never surface here.
/// Implementations are not required to be cancel-safe across `send`, so
/// callers drive one exchange at a time.
#[async_trait]
pub trait SmpTransport: Send {
    /// Transmit one complete message, fragmenting as the link requires.
    async fn send(&mut self, msg: &SmpMessage) -> Result<()>;

    /// Wait for the next complete message from the device.
    async fn receive(&mut self) -> Result<SmpMessage>;

    /// Close the link. Dropping the transport also disconnects; this
    /// exists for orderly shutdown paths that want the error.
    async fn disconnect(&mut self) -> Result<()>;

    /// Current negotiated MTU in bytes, as understood by this link.
    fn mtu(&self) -> usize;

    /// Largest SMP message (header plus body) that fits through the link
    /// at the given MTU, accounting for the transport's own framing
    /// overhead. The default is for transports that carry messages 1:1.
    fn max_message_data_size(&self, mtu: usize) -> usize {
        mtu
    }

    fn retries(&self) -> u32 {
        DEFAULT_TRANSPORT_RETRIES
    }

    fn timeout(&self) -> Duration {
        DEFAULT_TRANSPORT_TIMEOUT
    }
}

#[async_trait]
impl SmpTransport for Box<dyn SmpTransport> {
    async fn send(&mut self, msg: &SmpMessage) -> Result<()> {
        (**self).send(msg).await
    }

    async fn receive(&mut self) -> Result<SmpMessage> {
        (**self).receive().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }

    fn mtu(&self) -> usize {
        (**self).mtu()
    }

    fn max_message_data_size(&self, mtu: usize) -> usize {
        (**self).max_message_data_size(mtu)
    }

    fn retries(&self) -> u32 {
        (**self).retries()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }
}
