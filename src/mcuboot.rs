// src/mcuboot.rs
//
// MCUboot image parsing: header fields and the trailing TLV area.
//
// Layout of a signed image:
//
//   [image header] [firmware, img_size bytes] [protected TLVs] [TLV area]
//
// Header (offsets from the start of the file, stored in the image's own
// endianness):
//
//   0x00  u32  magic (0x96f3b83d)
//   0x08  u16  header size
//   0x0a  u16  protected TLV area size
//   0x0c  u32  image size
//
// The TLV area begins with a 4-byte info record (magic 0x6907 then the
// total TLV area length) followed by {type u8, pad u8, len u16, value}
// entries. Multibyte TLV fields are little-endian regardless of the
// header endianness.

use tracing::debug;

use crate::error::{Error, Result};

/// MCUboot image header magic.
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;

/// TLV area info magic.
pub const TLV_INFO_MAGIC: u16 = 0x6907;

/// TLV tags carrying the image hash.
pub const TLV_TAG_SHA256: u8 = 0x10;
pub const TLV_TAG_SHA384: u8 = 0x11;
pub const TLV_TAG_SHA512: u8 = 0x12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Parsed MCUboot image header fields needed to locate the TLV area.
#[derive(Debug, Clone, Copy)]
pub struct ImageHeader {
    pub endianness: Endianness,
    pub header_size: u16,
    pub protected_tlv_size: u16,
    pub image_size: u32,
}

fn read_u16(data: &[u8], offset: usize, endianness: Endianness) -> u16 {
    let raw = [data[offset], data[offset + 1]];
    match endianness {
        Endianness::Little => u16::from_le_bytes(raw),
        Endianness::Big => u16::from_be_bytes(raw),
    }
}

fn read_u32(data: &[u8], offset: usize, endianness: Endianness) -> u32 {
    let raw = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
    match endianness {
        Endianness::Little => u32::from_le_bytes(raw),
        Endianness::Big => u32::from_be_bytes(raw),
    }
}

impl ImageHeader {
    /// Parse the image header from the start of `data`, probing the magic
    /// as little-endian first and big-endian second.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x20 {
            return Err(Error::MissingImageHeader);
        }

        let endianness = if read_u32(data, 0, Endianness::Little) == IMAGE_MAGIC {
            Endianness::Little
        } else if read_u32(data, 0, Endianness::Big) == IMAGE_MAGIC {
            Endianness::Big
        } else {
            return Err(Error::MissingImageHeader);
        };

        Ok(ImageHeader {
            endianness,
            header_size: read_u16(data, 0x08, endianness),
            protected_tlv_size: read_u16(data, 0x0a, endianness),
            image_size: read_u32(data, 0x0c, endianness),
        })
    }

    /// Offset of the unprotected TLV area, directly after the firmware
    /// payload and any protected TLVs.
    pub fn tlv_area_offset(&self) -> usize {
        self.header_size as usize + self.image_size as usize + self.protected_tlv_size as usize
    }
}

fn expected_hash_len(tag: u8) -> Option<usize> {
    match tag {
        TLV_TAG_SHA256 => Some(32),
        TLV_TAG_SHA384 => Some(48),
        TLV_TAG_SHA512 => Some(64),
        _ => None,
    }
}

/// Walk the TLV entries starting at `pos` (the first byte after the info
/// record) up to `end`, collecting the hash TLV. Returns `Ok(None)` when
/// no hash entry exists, an error only for a duplicate.
fn scan_tlv_entries(data: &[u8], mut pos: usize, end: usize) -> Result<Option<Vec<u8>>> {
    let mut hash: Option<Vec<u8>> = None;

    while pos + 4 <= end {
        let tag = data[pos];
        let len = u16::from_le_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + len > end {
            break;
        }

        if let Some(expected) = expected_hash_len(tag) {
            if len == expected {
                if hash.is_some() {
                    return Err(Error::DuplicateImageHash);
                }
                hash = Some(data[pos..pos + len].to_vec());
            }
        }

        pos += len;
    }

    Ok(hash)
}

/// Whether `pos` is a plausible TLV info record: magic matches and the
/// declared total length runs exactly to the end of the file.
fn tlv_info_at(data: &[u8], pos: usize) -> Option<usize> {
    if pos + 4 > data.len() {
        return None;
    }
    if u16::from_le_bytes([data[pos], data[pos + 1]]) != TLV_INFO_MAGIC {
        return None;
    }
    let total = u16::from_le_bytes([data[pos + 2], data[pos + 3]]) as usize;
    if total >= 4 && pos + total == data.len() {
        Some(pos + total)
    } else {
        None
    }
}

/// Extract the image hash from a signed MCUboot image.
///
/// The TLV area is located from the header fields when the header is
/// intact. Images with a damaged or zeroed header are still handled by
/// scanning backwards for a TLV info record whose declared length runs
/// exactly to the end of the file.
pub fn extract_hash(data: &[u8]) -> Result<Vec<u8>> {
    if let Ok(header) = ImageHeader::parse(data) {
        let offset = header.tlv_area_offset();
        if let Some(end) = tlv_info_at(data, offset) {
            if let Some(hash) = scan_tlv_entries(data, offset + 4, end)? {
                return Ok(hash);
            }
        }
    }

    debug!("image header did not locate a TLV area, scanning backwards");

    let mut hash: Option<Vec<u8>> = None;
    let mut pos = data.len().saturating_sub(4);
    loop {
        if let Some(end) = tlv_info_at(data, pos) {
            if let Some(found) = scan_tlv_entries(data, pos + 4, end)? {
                if hash.is_some() {
                    return Err(Error::DuplicateImageHash);
                }
                hash = Some(found);
            }
        }
        if pos == 0 {
            break;
        }
        pos -= 1;
    }

    hash.ok_or(Error::MissingImageHash)
}
