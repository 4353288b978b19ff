//! Checksums and bit-level field access for sensor memory and packets.
//!
//! The sensor packs its records as little-endian bit fields that cross byte
//! boundaries, and protects every memory section and streaming packet with a
//! CRC16 (reflected polynomial 0x8408, seed 0xFFFF, result bit-reversed).

use cgm_types::{ParseError, ParseResult};

const POLYNOMIAL: u16 = 0x8408;

/// Seed used by every checksum in the protocol.
pub const CRC16_SEED: u16 = 0xFFFF;

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();

/// CRC16 over `bytes` with an explicit seed.
#[must_use]
pub fn crc16_with_seed(bytes: &[u8], seed: u16) -> u16 {
    let crc = bytes.iter().fold(seed, |crc, &byte| {
        (crc >> 8) ^ CRC16_TABLE[usize::from((crc ^ u16::from(byte)) & 0xFF)]
    });
    crc.reverse_bits()
}

/// CRC16 over `bytes` with the protocol seed.
///
/// ```
/// assert_eq!(cgm_core::codec::crc16(b"123456789"), 0x89F6);
/// ```
#[must_use]
pub fn crc16(bytes: &[u8]) -> u16 {
    crc16_with_seed(bytes, CRC16_SEED)
}

/// Check a buffer whose last two bytes are a big-endian CRC over the rest.
#[must_use]
pub fn has_valid_trailing_crc(bytes: &[u8]) -> bool {
    trailing_crc_mismatch(bytes).is_none()
}

/// `Some((stored, computed))` when the trailing CRC does not match.
pub(crate) fn trailing_crc_mismatch(bytes: &[u8]) -> Option<(u16, u16)> {
    if bytes.len() < 2 {
        return Some((0, 0));
    }
    let (data, tail) = bytes.split_at(bytes.len() - 2);
    let stored = u16_be(tail, 0);
    let computed = crc16(data);
    (stored != computed).then_some((stored, computed))
}

/// Check a section whose first two bytes are a little-endian CRC over the rest.
#[must_use]
pub fn has_valid_leading_crc(section: &[u8]) -> bool {
    leading_crc_mismatch(section).is_none()
}

/// `Some((stored, computed))` when the leading CRC does not match.
pub(crate) fn leading_crc_mismatch(section: &[u8]) -> Option<(u16, u16)> {
    if section.len() < 2 {
        return Some((0, 0));
    }
    let stored = u16_le(section, 0);
    let computed = crc16(&section[2..]);
    (stored != computed).then_some((stored, computed))
}

/// Write a little-endian CRC over `section[2..]` into its first two bytes.
pub fn seal_leading_crc(section: &mut [u8]) {
    if section.len() < 2 {
        return;
    }
    let crc = crc16(&section[2..]);
    section[..2].copy_from_slice(&crc.to_le_bytes());
}

/// Append a big-endian CRC over `bytes[..len - 2]` into the last two bytes.
pub fn seal_trailing_crc(bytes: &mut [u8]) {
    if bytes.len() < 2 {
        return;
    }
    let split = bytes.len() - 2;
    let crc = crc16(&bytes[..split]);
    bytes[split..].copy_from_slice(&crc.to_be_bytes());
}

/// Little-endian word at `offset`; out-of-range bytes read as zero.
#[must_use]
pub fn u16_le(bytes: &[u8], offset: usize) -> u16 {
    let lo = bytes.get(offset).copied().unwrap_or(0);
    let hi = bytes.get(offset + 1).copied().unwrap_or(0);
    u16::from_le_bytes([lo, hi])
}

/// Big-endian word at `offset`; out-of-range bytes read as zero.
#[must_use]
pub fn u16_be(bytes: &[u8], offset: usize) -> u16 {
    let hi = bytes.get(offset).copied().unwrap_or(0);
    let lo = bytes.get(offset + 1).copied().unwrap_or(0);
    u16::from_be_bytes([hi, lo])
}

fn check_bit_range(
    len: usize,
    byte_offset: usize,
    bit_offset: usize,
    bit_count: usize,
) -> ParseResult<()> {
    let end = byte_offset
        .checked_mul(8)
        .and_then(|bits| bits.checked_add(bit_offset))
        .and_then(|bits| bits.checked_add(bit_count));
    match end {
        Some(end) if bit_count <= 32 && end <= len * 8 => Ok(()),
        _ => Err(ParseError::OutOfBounds {
            byte_offset,
            bit_offset,
            bit_count,
            len,
        }),
    }
}

/// Read `bit_count` bits starting at `bit_offset` bits past `byte_offset`.
///
/// Bits are numbered little-endian: bit `i` of the result is bit
/// `(start + i) % 8` of byte `(start + i) / 8`.
pub fn read_bits(
    buffer: &[u8],
    byte_offset: usize,
    bit_offset: usize,
    bit_count: usize,
) -> ParseResult<u32> {
    if bit_count == 0 {
        return Ok(0);
    }
    check_bit_range(buffer.len(), byte_offset, bit_offset, bit_count)?;

    let start = byte_offset * 8 + bit_offset;
    let mut value = 0u32;
    for i in 0..bit_count {
        let bit = start + i;
        if (buffer[bit / 8] >> (bit % 8)) & 1 == 1 {
            value |= 1 << i;
        }
    }
    Ok(value)
}

/// Write the low `bit_count` bits of `value` at the given position.
pub fn write_bits(
    buffer: &mut [u8],
    byte_offset: usize,
    bit_offset: usize,
    bit_count: usize,
    value: u32,
) -> ParseResult<()> {
    if bit_count == 0 {
        return Ok(());
    }
    check_bit_range(buffer.len(), byte_offset, bit_offset, bit_count)?;

    let start = byte_offset * 8 + bit_offset;
    for i in 0..bit_count {
        let bit = start + i;
        let mask = 1u8 << (bit % 8);
        if (value >> i) & 1 == 1 {
            buffer[bit / 8] |= mask;
        } else {
            buffer[bit / 8] &= !mask;
        }
    }
    Ok(())
}
