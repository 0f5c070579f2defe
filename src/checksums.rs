// src/checksums.rs
//
// CRC calculation for frame validation.
// The SMP console framing uses CRC-16/XMODEM: polynomial 0x1021, initial
// value 0x0000, no reflection, no final XOR.

/// Reflect (reverse) the bits of a 16-bit value.
fn reflect16(mut value: u16) -> u16 {
    let mut reflected = 0u16;
    for _ in 0..16 {
        reflected = (reflected << 1) | (value & 1);
        value >>= 1;
    }
    reflected
}

/// Parameterised CRC-16 supporting both normal (MSB-first) and reflected
/// (LSB-first) input processing.
pub fn crc16_parameterised(
    data: &[u8],
    polynomial: u16,
    init: u16,
    xor_out: u16,
    reflect_in: bool,
    reflect_out: bool,
) -> u16 {
    let mut crc = init;

    if reflect_in {
        let reflected_poly = reflect16(polynomial);
        for &byte in data {
            crc ^= byte as u16;
            for _ in 0..8 {
                if crc & 0x0001 != 0 {
                    crc = (crc >> 1) ^ reflected_poly;
                } else {
                    crc >>= 1;
                }
            }
        }
    } else {
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ polynomial;
                } else {
                    crc <<= 1;
                }
            }
        }
    }

    let final_crc = if reflect_out != reflect_in {
        reflect16(crc)
    } else {
        crc
    };

    final_crc ^ xor_out
}

/// CRC-16/XMODEM as used by the SMP serial console framing.
/// Polynomial 0x1021, init 0x0000, non-reflected, no final XOR.
pub fn crc16_smp(data: &[u8]) -> u16 {
    crc16_parameterised(data, 0x1021, 0x0000, 0x0000, false, false)
}
