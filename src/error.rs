// src/error.rs
//
// Error taxonomy for the SMP client and the device-reported error types.
//
// Two layers are kept apart on purpose: `Error` covers everything that can
// go wrong on the host side (transports, framing, timeouts), while
// `SmpError` carries a status the device itself reported inside a response
// body. Frame-level decode failures on serial/LoRaWAN are *not* routed
// through `Error` at all; the adapters drop the corrupt frame with a log
// and keep listening.

use thiserror::Error;

use crate::groups;

/// How the device reported an error: legacy top-level `rc` (SMP v1) or the
/// v2 `ret` map carrying a group id plus a group-scoped code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpErrorKind {
    /// SMP v1 `rc` field, codes from the shared base table.
    Rc,
    /// SMP v2 `ret` map, group-scoped codes starting at offset 2.
    Ret,
}

/// An error status decoded from a device response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpError {
    pub kind: SmpErrorKind,
    /// Group the code belongs to. For `Rc` errors this is the group the
    /// request was sent to (base codes are group-independent).
    pub group: u16,
    pub rc: i32,
}

/// Base status codes shared by every group (SMP v1 `rc` values and the
/// first two v2 codes).
pub mod base_code {
    pub const OK: i32 = 0;
    pub const UNKNOWN: i32 = 1;
    pub const NOMEM: i32 = 2;
    pub const INVAL: i32 = 3;
    pub const TIMEOUT: i32 = 4;
    pub const NOENT: i32 = 5;
    pub const BADSTATE: i32 = 6;
    pub const MSGSIZE: i32 = 7;
    pub const NOTSUP: i32 = 8;
    pub const CORRUPT: i32 = 9;
    pub const BUSY: i32 = 10;
    pub const ACCESSDENIED: i32 = 11;
    pub const UNSUPPORTED_TOO_OLD: i32 = 12;
    pub const UNSUPPORTED_TOO_NEW: i32 = 13;
}

/// All SMP v2 group error codes start at this offset; 0 and 1 keep their
/// base meaning (ok / unknown) in every group.
pub const GROUP_ERROR_CODE_START: i32 = 2;

impl SmpError {
    /// True when the device reported the command itself as unsupported.
    /// Used by the upload pipeline to keep going when a recovery-mode
    /// bootloader lacks full image management.
    pub fn is_unsupported(&self) -> bool {
        match self.kind {
            SmpErrorKind::Rc => self.rc == base_code::NOTSUP,
            // v2 codes 0/1 are ok/unknown; anything group-scoped is not a
            // plain "not supported". UnexpectedResponse-style NOTSUP still
            // arrives as an rc error from pre-v2 recovery bootloaders.
            SmpErrorKind::Ret => false,
        }
    }

    /// Resolve the code against the two-stage taxonomy: base table for
    /// `rc` errors, the owning group's table (offset 2) for `ret` errors.
    pub fn describe(&self) -> String {
        match self.kind {
            SmpErrorKind::Rc => groups::error_lookup::base_error_string(self.rc)
                .map(str::to_string)
                .unwrap_or_else(|| format!("unknown error {}", self.rc)),
            SmpErrorKind::Ret => {
                if self.rc < GROUP_ERROR_CODE_START {
                    groups::error_lookup::base_error_string(self.rc)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("unknown error {}", self.rc))
                } else {
                    groups::error_lookup::group_error_string(self.group, self.rc)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            format!("group {} error {}", self.group, self.rc)
                        })
                }
            }
        }
    }
}

impl std::fmt::Display for SmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SmpErrorKind::Rc => write!(f, "rc={}: {}", self.rc, self.describe()),
            SmpErrorKind::Ret => {
                write!(f, "group={} rc={}: {}", self.group, self.rc, self.describe())
            }
        }
    }
}

/// Host-side error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport is not connected")]
    TransportNotConnected,

    #[error("response header truncated (fewer than 8 bytes)")]
    TruncatedHeader,

    #[error("unexpected response for the active operation: {0}")]
    UnexpectedResponse(String),

    #[error("device reported an error: {0}")]
    Protocol(SmpError),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("an operation is already in progress on this group")]
    Busy,

    #[error("no valid MCUboot image header magic found")]
    MissingImageHeader,

    #[error("image has no hash TLV")]
    MissingImageHash,

    #[error("image has multiple hash TLVs")]
    DuplicateImageHash,

    #[error("upload is stuck: device keeps reporting an already-sent offset")]
    StuckTransferLoop,

    #[error("BLE link unusable: write failed at the minimum chunk size")]
    BleLinkUnusable,

    #[error("malformed CBOR in response body: {0}")]
    CborDecode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl From<minicbor::decode::Error> for Error {
    fn from(e: minicbor::decode::Error) -> Self {
        Error::CborDecode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
