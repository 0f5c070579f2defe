// src/transport/lorawan.rs
//
// SMP over LoRaWAN via an MQTT application server (The Things Stack
// topic layout). Messages are split into downlink fragments queued with
// a single publish to `<topic>/down/push`; device responses arrive as
// uplinks on `<topic>/up`, filtered by f_port, base64 decoded and
// reassembled by the SMP header length.
//
// Application servers redeliver uplinks at times; a fragment that is
// already the tail of the reassembly buffer is dropped as a duplicate.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{SmpHeader, SmpMessage, SMP_HEADER_SIZE};
use crate::transport::{SmpTransport, DEFAULT_TRANSPORT_RETRIES};

/// Default downlink fragment size, sized for the larger LoRaWAN data
/// rates. Lower this for regions or data rates with a smaller payload
/// budget.
pub const DEFAULT_LORAWAN_FRAGMENT_SIZE: usize = 222;

/// Device class A round trips are slow; responses ride on the next
/// uplink window.
pub const DEFAULT_LORAWAN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LorawanConfig {
    pub host: String,
    pub port: u16,
    /// MQTT username (application id on The Things Stack).
    pub username: String,
    /// MQTT password (API key).
    pub password: String,
    /// Base topic for the device, e.g.
    /// `v3/my-app@ttn/devices/my-device`.
    pub topic: String,
    /// f_port carrying SMP traffic in both directions.
    pub f_port: u8,
    pub fragment_size: usize,
    pub confirmed_downlinks: bool,
    pub timeout: Duration,
    pub retries: u32,
}

impl LorawanConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        LorawanConfig {
            host: host.into(),
            port: 1883,
            username: username.into(),
            password: password.into(),
            topic: topic.into(),
            f_port: 2,
            fragment_size: DEFAULT_LORAWAN_FRAGMENT_SIZE,
            confirmed_downlinks: false,
            timeout: DEFAULT_LORAWAN_TIMEOUT,
            retries: DEFAULT_TRANSPORT_RETRIES,
        }
    }
}

#[derive(Serialize)]
struct DownlinkPush {
    downlinks: Vec<Downlink>,
}

#[derive(Serialize)]
struct Downlink {
    f_port: u8,
    frm_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirmed: Option<bool>,
}

#[derive(Deserialize)]
struct UplinkEnvelope {
    uplink_message: Option<UplinkMessage>,
}

#[derive(Deserialize)]
struct UplinkMessage {
    f_port: Option<u8>,
    frm_payload: Option<String>,
}

/// Reassembles uplink fragments into messages, dropping redelivered
/// fragments.
#[derive(Default)]
struct LorawanReassembler {
    buf: Vec<u8>,
}

impl LorawanReassembler {
    fn push(&mut self, fragment: &[u8]) -> Vec<SmpMessage> {
        if fragment.is_empty() {
            return Vec::new();
        }
        if !self.buf.is_empty() && self.buf.ends_with(fragment) {
            debug!(bytes = fragment.len(), "dropping redelivered uplink fragment");
            return Vec::new();
        }
        self.buf.extend_from_slice(fragment);

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

pub struct LorawanTransport {
    config: LorawanConfig,
    client: AsyncClient,
    rx: mpsc::UnboundedReceiver<SmpMessage>,
    event_task: Option<JoinHandle<()>>,
}

impl LorawanTransport {
    pub async fn connect(config: LorawanConfig) -> Result<Self> {
        let mut options = MqttOptions::new(
            format!("smplink-{}", std::process::id()),
            &config.host,
            config.port,
        );
        options.set_credentials(&config.username, &config.password);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        client
            .subscribe(format!("{}/up", config.topic), QoS::AtLeastOnce)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let f_port = config.f_port;
        let event_task = tokio::spawn(async move {
            let mut reassembler = LorawanReassembler::default();
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        for fragment in decode_uplink(&publish.payload, f_port) {
                            for msg in reassembler.push(&fragment) {
                                if tx.send(msg).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if tx.is_closed() {
                            return;
                        }
                        warn!("MQTT connection error, reconnecting: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });

        Ok(LorawanTransport {
            config,
            client,
            rx,
            event_task: Some(event_task),
        })
    }
}

/// Pull the SMP fragment out of an uplink publish, ignoring uplinks for
/// other ports and envelopes without a payload.
fn decode_uplink(payload: &[u8], f_port: u8) -> Vec<Vec<u8>> {
    let envelope: UplinkEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("ignoring unparseable uplink envelope: {e}");
            return Vec::new();
        }
    };
    let Some(uplink) = envelope.uplink_message else {
        return Vec::new();
    };
    if uplink.f_port != Some(f_port) {
        return Vec::new();
    }
    let Some(frm_payload) = uplink.frm_payload else {
        return Vec::new();
    };
    match BASE64.decode(frm_payload.as_bytes()) {
        Ok(decoded) => vec![decoded],
        Err(e) => {
            warn!("ignoring uplink with invalid base64 payload: {e}");
            Vec::new()
        }
    }
}

#[async_trait]
impl SmpTransport for LorawanTransport {
    async fn send(&mut self, msg: &SmpMessage) -> Result<()> {
        let confirmed = self.config.confirmed_downlinks.then_some(true);
        let downlinks = msg
            .bytes()
            .chunks(self.config.fragment_size)
            .map(|chunk| Downlink {
                f_port: self.config.f_port,
                frm_payload: BASE64.encode(chunk),
                confirmed,
            })
            .collect();

        let push = DownlinkPush { downlinks };
        let payload = serde_json::to_vec(&push)
            .map_err(|e| Error::InvalidConfiguration(format!("downlink encode: {e}")))?;

        self.client
            .publish(
                format!("{}/down/push", self.config.topic),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<SmpMessage> {
        self.rx.recv().await.ok_or(Error::TransportNotConnected)
    }

    async fn disconnect(&mut self) -> Result<()> {
        let _ = self.client.disconnect().await;
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.config.fragment_size
    }

    fn retries(&self) -> u32 {
        self.config.retries
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}
