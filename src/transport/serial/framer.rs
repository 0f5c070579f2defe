// src/transport/serial/framer.rs
//
// SMP console framing over a UART shared with normal console output.
//
// Each message is carried as one or more newline-terminated frames:
//
//   first frame:        0x06 0x09 <base64> \n
//   continuation frame: 0x04 0x14 <base64> \n
//
// The base64 payload of the first frame starts with a big-endian u16
// giving the total length of what follows across all frames (message
// plus 2 CRC bytes); the stream ends with a big-endian CRC-16/XMODEM of
// the message. At most 93 raw bytes are packed per frame before base64
// expansion, keeping every encoded line within 127 bytes.
//
// Console noise interleaved with frames is tolerated: bytes outside a
// frame are discarded once they exceed the garbage threshold, and frames
// that fail base64 decode or CRC are dropped with a log while the framer
// keeps listening.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, warn};

use crate::checksums::crc16_smp;
use crate::message::SmpMessage;

/// Start-of-message token.
pub const FRAME_TOKEN_FIRST: [u8; 2] = [0x06, 0x09];
/// Continuation token.
pub const FRAME_TOKEN_CONTINUATION: [u8; 2] = [0x04, 0x14];

/// Raw bytes packed into a frame before base64 encoding.
const FRAME_PAYLOAD_MAX: usize = 93;

/// Longest encoded frame: token + base64(93) + newline.
const FRAME_LINE_MAX: usize = 127;

/// Non-frame bytes tolerated in the receive buffer before flushing.
pub const DEFAULT_GARBAGE_THRESHOLD: usize = 10;

/// Encode a message into ready-to-write frame lines.
pub fn encode_frames(msg: &SmpMessage) -> Vec<Vec<u8>> {
    let body = msg.bytes();
    let crc = crc16_smp(body);

    let mut stream = Vec::with_capacity(body.len() + 4);
    stream.extend_from_slice(&((body.len() as u16 + 2).to_be_bytes()));
    stream.extend_from_slice(body);
    stream.extend_from_slice(&crc.to_be_bytes());

    stream
        .chunks(FRAME_PAYLOAD_MAX)
        .enumerate()
        .map(|(index, chunk)| {
            let mut line = Vec::with_capacity(FRAME_LINE_MAX);
            if index == 0 {
                line.extend_from_slice(&FRAME_TOKEN_FIRST);
            } else {
                line.extend_from_slice(&FRAME_TOKEN_CONTINUATION);
            }
            line.extend_from_slice(BASE64.encode(chunk).as_bytes());
            line.push(b'\n');
            line
        })
        .collect()
}

/// Largest SMP message (header plus body) whose framed encoding fits in
/// `mtu` bytes on the wire: frame overhead of token/newline per packet,
/// 4/3 base64 expansion, then the length prefix and CRC.
pub fn max_message_data_size(mtu: usize) -> usize {
    let packets = mtu.div_ceil(FRAME_LINE_MAX);
    let size = mtu.saturating_sub(2 + 3 * packets);
    (size / 4 * 3).saturating_sub(2)
}

fn find_token(haystack: &[u8], token: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|window| window == token)
}

/// Stateful reassembler for the receive side of the console framing.
/// Feed raw serial bytes in, get complete verified messages out.
pub struct SmpFramer {
    rx: Vec<u8>,
    pending: Vec<u8>,
    /// Expected total of message + CRC bytes, zero when idle.
    waiting_len: usize,
    garbage_threshold: usize,
}

impl SmpFramer {
    pub fn new(garbage_threshold: usize) -> Self {
        SmpFramer {
            rx: Vec::new(),
            pending: Vec::new(),
            waiting_len: 0,
            garbage_threshold,
        }
    }

    fn reset_pending(&mut self) {
        self.pending.clear();
        self.waiting_len = 0;
    }

    /// Append raw bytes from the port and return any messages completed
    /// by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<SmpMessage> {
        self.rx.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            let first = find_token(&self.rx, &FRAME_TOKEN_FIRST);
            let continuation = find_token(&self.rx, &FRAME_TOKEN_CONTINUATION);

            let (start, is_first) = match (first, continuation) {
                (Some(f), Some(c)) if f <= c => (f, true),
                (Some(_), Some(c)) => (c, false),
                (Some(f), None) => (f, true),
                (None, Some(c)) => (c, false),
                (None, None) => {
                    // No frame in sight. Keep a possible half-received
                    // token byte at the tail, flush the rest once it
                    // exceeds the threshold.
                    let keep = match self.rx.last() {
                        Some(0x06) | Some(0x04) => 1,
                        _ => 0,
                    };
                    let noise = self.rx.len() - keep;
                    if noise > self.garbage_threshold {
                        debug!(bytes = noise, "flushing non-SMP console output");
                        self.rx.drain(..noise);
                    }
                    break;
                }
            };

            if start > 0 {
                debug!(bytes = start, "discarding console bytes before frame token");
                self.rx.drain(..start);
            }

            // Token now at offset 0; wait for the line terminator.
            let Some(newline) = self.rx.iter().position(|&b| b == b'\n') else {
                break;
            };

            let decoded = BASE64.decode(&self.rx[2..newline]);
            self.rx.drain(..=newline);

            let decoded = match decoded {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("dropping frame with invalid base64: {e}");
                    self.reset_pending();
                    continue;
                }
            };

            if is_first {
                if self.waiting_len != 0 {
                    warn!("new start frame while reassembling, dropping partial message");
                }
                if decoded.len() < 2 {
                    warn!("dropping start frame without a length prefix");
                    self.reset_pending();
                    continue;
                }
                let declared = u16::from_be_bytes([decoded[0], decoded[1]]) as usize;
                // The total always covers at least the 2 CRC bytes; a
                // smaller value can never complete a message.
                if declared < 2 {
                    warn!(declared, "dropping start frame with an invalid length prefix");
                    self.reset_pending();
                    continue;
                }
                self.waiting_len = declared;
                self.pending = decoded[2..].to_vec();
            } else {
                if self.waiting_len == 0 {
                    warn!("dropping continuation frame without a start frame");
                    continue;
                }
                self.pending.extend_from_slice(&decoded);
            }

            if self.waiting_len >= 2 && self.pending.len() >= self.waiting_len {
                let body_len = self.waiting_len - 2;
                let received =
                    u16::from_be_bytes([self.pending[body_len], self.pending[body_len + 1]]);
                let computed = crc16_smp(&self.pending[..body_len]);

                if received == computed {
                    out.push(SmpMessage::from_bytes(self.pending[..body_len].to_vec()));
                } else {
                    warn!(
                        received = format!("{received:#06x}"),
                        computed = format!("{computed:#06x}"),
                        "dropping message with CRC mismatch"
                    );
                }
                self.reset_pending();
            }
        }

        out
    }
}

impl Default for SmpFramer {
    fn default() -> Self {
        SmpFramer::new(DEFAULT_GARBAGE_THRESHOLD)
    }
}
