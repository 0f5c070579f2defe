// src/cbor.rs
//
// Decode helpers over minicbor for the map-of-named-fields bodies SMP
// responses use. Devices emit both definite and indefinite-length
// containers depending on firmware, so every walker handles both.

use minicbor::data::Type;
use minicbor::Decoder;

use crate::error::Result;

/// Consume the break byte terminating an indefinite container.
fn consume_break(d: &mut Decoder<'_>) {
    d.set_position(d.position() + 1);
}

/// Walk a CBOR map, calling `f` with each key. `f` must consume the
/// value (or `skip` it).
pub fn decode_map<'b, F>(d: &mut Decoder<'b>, mut f: F) -> Result<()>
where
    F: FnMut(&mut Decoder<'b>, &'b str) -> Result<()>,
{
    match d.map()? {
        Some(entries) => {
            for _ in 0..entries {
                let key = d.str()?;
                f(d, key)?;
            }
        }
        None => loop {
            if d.datatype()? == Type::Break {
                consume_break(d);
                break;
            }
            let key = d.str()?;
            f(d, key)?;
        },
    }
    Ok(())
}

/// Walk a CBOR array, calling `f` once per element.
pub fn decode_array<'b, F>(d: &mut Decoder<'b>, mut f: F) -> Result<()>
where
    F: FnMut(&mut Decoder<'b>) -> Result<()>,
{
    match d.array()? {
        Some(elements) => {
            for _ in 0..elements {
                f(d)?;
            }
        }
        None => loop {
            if d.datatype()? == Type::Break {
                consume_break(d);
                break;
            }
            f(d)?;
        },
    }
    Ok(())
}

/// Bytes the CBOR byte-string header occupies for a payload of `len`
/// bytes. Used when budgeting how much image data fits in a message.
pub fn bytes_header_overhead(len: usize) -> usize {
    match len {
        0..=23 => 1,
        24..=0xff => 2,
        0x100..=0xffff => 3,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::Encoder;

    #[test]
    fn test_decode_definite_map() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        let _ = e.map(2);
        let _ = e.str("rc");
        let _ = e.i64(0);
        let _ = e.str("off");
        let _ = e.u64(1024);

        let mut off = 0u64;
        let mut d = Decoder::new(&buf);
        decode_map(&mut d, |d, key| {
            match key {
                "off" => off = d.u64()?,
                _ => d.skip()?,
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(off, 1024);
    }

    #[test]
    fn test_decode_indefinite_map_and_array() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        let _ = e.begin_map();
        let _ = e.str("names");
        let _ = e.begin_array();
        let _ = e.str("a");
        let _ = e.str("b");
        let _ = e.end();
        let _ = e.str("tail");
        let _ = e.bool(true);
        let _ = e.end();

        let mut names = Vec::new();
        let mut tail = false;
        let mut d = Decoder::new(&buf);
        decode_map(&mut d, |d, key| {
            match key {
                "names" => decode_array(d, |d| {
                    names.push(d.str()?.to_string());
                    Ok(())
                })?,
                "tail" => tail = d.bool()?,
                _ => d.skip()?,
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(names, ["a", "b"]);
        assert!(tail);
        // The walker consumed everything including the break.
        assert_eq!(d.position(), buf.len());
    }

    #[test]
    fn test_bytes_header_overhead() {
        assert_eq!(bytes_header_overhead(0), 1);
        assert_eq!(bytes_header_overhead(23), 1);
        assert_eq!(bytes_header_overhead(24), 2);
        assert_eq!(bytes_header_overhead(255), 2);
        assert_eq!(bytes_header_overhead(256), 3);
        assert_eq!(bytes_header_overhead(65535), 3);
        assert_eq!(bytes_header_overhead(65536), 5);
    }
}
