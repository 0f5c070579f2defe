// src/transport/mock.rs
//
// Scripted in-process device for engine and group tests. A handler
// closure plays the device: it sees every sent request and returns the
// responses to queue. An empty response list models a silent device so
// timeout and resend paths can be exercised.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::SmpMessage;
use crate::transport::{SmpTransport, DEFAULT_TRANSPORT_RETRIES};

type Handler = Box<dyn FnMut(&SmpMessage) -> Vec<SmpMessage> + Send>;

pub struct MockTransport {
    handler: Handler,
    queue: VecDeque<SmpMessage>,
    pub mtu: usize,
    pub timeout: Duration,
    pub retries: u32,
    /// Requests sent so far, for resend assertions.
    pub sent: Vec<SmpMessage>,
    connected: bool,
}

impl MockTransport {
    pub fn new(handler: impl FnMut(&SmpMessage) -> Vec<SmpMessage> + Send + 'static) -> Self {
        MockTransport {
            handler: Box::new(handler),
            queue: VecDeque::new(),
            mtu: 512,
            timeout: Duration::from_millis(100),
            retries: DEFAULT_TRANSPORT_RETRIES,
            sent: Vec::new(),
            connected: true,
        }
    }

    /// Queue an unsolicited message, as a device reboot notification
    /// would be.
    pub fn inject(&mut self, msg: SmpMessage) {
        self.queue.push_back(msg);
    }
}

#[async_trait]
impl SmpTransport for MockTransport {
    async fn send(&mut self, msg: &SmpMessage) -> Result<()> {
        if !self.connected {
            return Err(Error::TransportNotConnected);
        }
        self.sent.push(msg.clone());
        let responses = (self.handler)(msg);
        self.queue.extend(responses);
        Ok(())
    }

    async fn receive(&mut self) -> Result<SmpMessage> {
        if !self.connected {
            return Err(Error::TransportNotConnected);
        }
        match self.queue.pop_front() {
            Some(msg) => Ok(msg),
            // A silent device: wait forever and let the caller's timer
            // fire.
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
