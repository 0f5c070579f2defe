//! SMP (mcumgr) device management client.
//!
//! Talks to embedded devices running an SMP management server over
//! serial/UART, BLE, UDP or LoRaWAN via MQTT: firmware upload and image
//! state, filesystem access, OS commands, settings, statistics, shell
//! execution, group enumeration and Zephyr storage management.
//!
//! The moving parts:
//! - [`message`]: SMP header and CBOR body codec.
//! - [`transport`]: per-link framing and reassembly behind the
//!   [`transport::SmpTransport`] trait.
//! - [`processor`]: request/response matching, retries, version
//!   fallback and device error decoding.
//! - [`groups`]: typed APIs per management group.
//! - [`mcuboot`]: MCUboot image header and TLV parsing for uploads.

pub mod cbor;
pub mod checksums;
pub mod error;
pub mod groups;
pub mod mcuboot;
pub mod message;
pub mod processor;
pub mod transport;

pub use error::{Error, Result, SmpError, SmpErrorKind};
pub use message::{SmpHeader, SmpMessage, SmpOp, SmpVersion};
pub use processor::SmpProcessor;
pub use transport::SmpTransport;
