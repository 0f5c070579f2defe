// src/message.rs
//
// SMP message building and header codec.
//
// An SMP message is an 8-byte header followed by a CBOR map body:
//
//   byte 0: bits [2:0] op, bits [4:3] protocol version, bits [7:5] reserved
//   byte 1: flags (reserved)
//   bytes 2-3: body length, big-endian
//   bytes 4-5: group id, big-endian
//   byte 6: sequence number
//   byte 7: command id
//
// The header is always encoded/decoded through explicit bit masks so the
// wire format is identical on every host, and the body length is patched
// in by `finalize()` once the CBOR map is closed.

use minicbor::Encoder;

use crate::error::{Error, Result};

/// Size of the fixed SMP header in bytes.
pub const SMP_HEADER_SIZE: usize = 8;

/// SMP operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmpOp {
    Read = 0,
    ReadResponse = 1,
    Write = 2,
    WriteResponse = 3,
}

impl SmpOp {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => SmpOp::Read,
            1 => SmpOp::ReadResponse,
            2 => SmpOp::Write,
            // 4-7 are undefined on the wire; folding them into the
            // response space makes mismatch checks reject them.
            _ => SmpOp::WriteResponse,
        }
    }

    /// The response op expected for a request op.
    pub fn response(self) -> Self {
        match self {
            SmpOp::Read => SmpOp::ReadResponse,
            SmpOp::Write => SmpOp::WriteResponse,
            other => other,
        }
    }
}

/// SMP protocol version carried in the header.
/// V2 adds group-scoped error reporting via the `ret` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SmpVersion {
    V1 = 0,
    #[default]
    V2 = 1,
}

impl SmpVersion {
    pub fn from_bits(bits: u8) -> Self {
        if bits & 0x03 == 0 {
            SmpVersion::V1
        } else {
            SmpVersion::V2
        }
    }
}

/// Decoded SMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpHeader {
    pub op: SmpOp,
    pub version: SmpVersion,
    pub flags: u8,
    /// Byte length of the CBOR body following the header.
    pub length: u16,
    pub group: u16,
    pub sequence: u8,
    pub command: u8,
}

impl SmpHeader {
    /// Encode to the fixed 8-byte wire layout.
    pub fn encode(&self) -> [u8; SMP_HEADER_SIZE] {
        [
            (self.op as u8 & 0x07) | ((self.version as u8 & 0x03) << 3),
            self.flags,
            (self.length >> 8) as u8,
            (self.length & 0xff) as u8,
            (self.group >> 8) as u8,
            (self.group & 0xff) as u8,
            self.sequence,
            self.command,
        ]
    }

    /// Parse a header from the start of `data`.
    /// Fails with `TruncatedHeader` when fewer than 8 bytes are available.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SMP_HEADER_SIZE {
            return Err(Error::TruncatedHeader);
        }

        Ok(SmpHeader {
            op: SmpOp::from_bits(data[0] & 0x07),
            version: SmpVersion::from_bits((data[0] >> 3) & 0x03),
            flags: data[1],
            length: ((data[2] as u16) << 8) | data[3] as u16,
            group: ((data[4] as u16) << 8) | data[5] as u16,
            sequence: data[6],
            command: data[7],
        })
    }
}

/// A growable SMP message buffer: header plus CBOR map body.
///
/// Lifecycle: `start()` writes the header with a zero length placeholder
/// and opens the body map, the `add_*` writers append key/value pairs in
/// document order, `finalize()` closes the map and patches the length.
/// Writers perform no key-uniqueness checks; duplicate keys are a caller
/// error.
#[derive(Debug, Clone)]
pub struct SmpMessage {
    buf: Vec<u8>,
}

impl SmpMessage {
    /// Begin a new message: header (length 0 for now) plus an open
    /// indefinite-length CBOR map.
    pub fn start(
        op: SmpOp,
        version: SmpVersion,
        group: u16,
        sequence: u8,
        command: u8,
    ) -> Self {
        let header = SmpHeader {
            op,
            version,
            flags: 0,
            length: 0,
            group,
            sequence,
            command,
        };

        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&header.encode());

        let mut msg = SmpMessage { buf };
        // Writing into a Vec cannot fail.
        let _ = Encoder::new(&mut msg.buf).begin_map();
        msg
    }

    /// Wrap already-reassembled wire bytes (header + body).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SmpMessage { buf: bytes }
    }

    pub fn add_u64(&mut self, key: &str, value: u64) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.u64(value);
        self
    }

    pub fn add_i64(&mut self, key: &str, value: i64) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.i64(value);
        self
    }

    pub fn add_str(&mut self, key: &str, value: &str) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.str(value);
        self
    }

    pub fn add_bytes(&mut self, key: &str, value: &[u8]) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.bytes(value);
        self
    }

    pub fn add_bool(&mut self, key: &str, value: bool) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.bool(value);
        self
    }

    /// Write the key and open a nested indefinite map. Close with
    /// `end_container()`.
    pub fn begin_map(&mut self, key: &str) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.begin_map();
        self
    }

    /// Write the key and open a nested indefinite array. Close with
    /// `end_container()`.
    pub fn begin_array(&mut self, key: &str) -> &mut Self {
        let mut e = Encoder::new(&mut self.buf);
        let _ = e.str(key);
        let _ = e.begin_array();
        self
    }

    /// Append a bare string element (inside an open array).
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        let _ = Encoder::new(&mut self.buf).str(value);
        self
    }

    /// Append a bare unsigned element (inside an open array).
    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        let _ = Encoder::new(&mut self.buf).u64(value);
        self
    }

    /// Open a bare indefinite map element (inside an open array). Close
    /// with `end_container()`.
    pub fn push_map(&mut self) -> &mut Self {
        let _ = Encoder::new(&mut self.buf).begin_map();
        self
    }

    pub fn end_container(&mut self) -> &mut Self {
        let _ = Encoder::new(&mut self.buf).end();
        self
    }

    /// Close the body map and patch the header length field with the
    /// final CBOR body size. Must be called exactly once, after which the
    /// message is ready for transmission.
    pub fn finalize(&mut self) {
        let _ = Encoder::new(&mut self.buf).end();

        let body_len = (self.buf.len() - SMP_HEADER_SIZE) as u16;
        self.buf[2] = (body_len >> 8) as u8;
        self.buf[3] = (body_len & 0xff) as u8;
    }

    /// Full wire bytes (header + body).
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn header(&self) -> Result<SmpHeader> {
        SmpHeader::parse(&self.buf)
    }

    /// Body bytes after the 8-byte header, for handing to a CBOR decoder.
    pub fn body(&self) -> &[u8] {
        if self.buf.len() <= SMP_HEADER_SIZE {
            &[]
        } else {
            &self.buf[SMP_HEADER_SIZE..]
        }
    }

    /// Whether the buffer holds at least the full body the header claims.
    /// Used by reassembling transports to decide when to emit.
    pub fn is_complete(&self) -> bool {
        if self.buf.len() < SMP_HEADER_SIZE {
            return false;
        }
        match SmpHeader::parse(&self.buf) {
            Ok(header) => self.buf.len() >= SMP_HEADER_SIZE + header.length as usize,
            Err(_) => false,
        }
    }
}
