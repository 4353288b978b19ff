//! Sensor protocol cryptography.
//!
//! All keys are derived from the sensor uid through a 4-word shift/xor mixing
//! function. Two cipher generations exist:
//!
//! - **Memory**: the 344-byte memory image is XORed block by block (43 blocks
//!   of 8 bytes), each block with its own key.
//! - **Streaming**: BLE packets carry a 2-byte seed followed by data XORed
//!   with a 64-byte keystream, protected by a trailing CRC16.
//!
//! Every function here is pure. Failures are reported as
//! [`Error::Integrity`] or [`Error::Protocol`] and concern one packet or
//! image only.

use cgm_types::{PATCH_INFO_LEN, SensorType, UID_LEN};

use crate::codec::{crc16, trailing_crc_mismatch, u16_le};
use crate::error::{Error, Result};

/// Family key constants.
pub const KEY: [u16; 4] = [0xA0C5, 0x6860, 0x0000, 0x14C6];

/// Size of a decrypted memory image.
pub const MEMORY_IMAGE_LEN: usize = 344;

/// Size of one memory block.
pub const BLOCK_LEN: usize = 8;

/// Number of blocks in a memory image.
pub const BLOCK_COUNT: usize = MEMORY_IMAGE_LEN / BLOCK_LEN;

/// Size of an encrypted streaming packet (seed + payload).
pub const STREAMING_PACKET_LEN: usize = 46;

/// Size of a decrypted streaming payload, CRC included.
pub const STREAMING_PAYLOAD_LEN: usize = STREAMING_PACKET_LEN - 2;

/// Enable time used when the host has no better value.
pub const DEFAULT_ENABLE_TIME: u32 = 42;

const SEED_CONSTANT: u16 = 0x241A;
const ACTIVATION_X: u16 = 0x1B;
const ACTIVATION_Y: u16 = 0x1B6A;
const ENABLE_X: u16 = 0x1E;
const STREAMING_MASK: u16 = 0x63;
const LIBRE2_MEMORY_MASK: u16 = 0x44;
const US14DAY_FRAME_KEY: u16 = 0xCADC;
const UNLOCK_PREAMBLE: [u8; 8] = [0xC1, 0xC4, 0xC3, 0xC0, 0xD4, 0xE1, 0xE7, 0xBA];

/// How the memory image of a sensor type is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCipher {
    /// Stored in the clear.
    Plain,
    /// One key per block, `y` mixed with 0x44.
    Libre2,
    /// One key per block, fixed `y` for header and footer blocks.
    Us14Day,
}

impl MemoryCipher {
    /// Select the cipher for a sensor type.
    pub fn for_sensor_type(sensor_type: SensorType) -> Result<Self> {
        match sensor_type {
            SensorType::Libre1 | SensorType::LibrePro => Ok(MemoryCipher::Plain),
            SensorType::Libre2Eu
            | SensorType::Libre2Us
            | SensorType::Libre2Ca
            | SensorType::LibreSense => Ok(MemoryCipher::Libre2),
            SensorType::LibreUs14Day => Ok(MemoryCipher::Us14Day),
            other => Err(Error::protocol(format!("no memory cipher for {other}"))),
        }
    }
}

fn op(value: u16) -> u16 {
    let mut result = value >> 2;
    if value & 1 != 0 {
        result ^= KEY[1];
    }
    if value & 2 != 0 {
        result ^= KEY[0];
    }
    result
}

/// The 4-word mixing function every key is derived with.
#[must_use]
pub fn mix(input: [u16; 4]) -> [u16; 4] {
    let r0 = op(input[0]) ^ input[3];
    let r1 = op(r0) ^ input[2];
    let r2 = op(r1) ^ input[1];
    let r3 = op(r2) ^ input[0];
    let r4 = op(r3);
    let r5 = op(r4 ^ r0);
    let r6 = op(r5 ^ r1);
    let r7 = op(r6 ^ r2);
    [r3 ^ r7, r2 ^ r6, r1 ^ r5, r0 ^ r4]
}

fn seed_words(uid: &[u8; UID_LEN], x: u16, y: u16) -> [u16; 4] {
    [
        u16_le(uid, 4).wrapping_add(x).wrapping_add(y),
        u16_le(uid, 2).wrapping_add(KEY[2]),
        u16_le(uid, 0).wrapping_add(x.wrapping_mul(2)),
        SEED_CONSTANT ^ KEY[3],
    ]
}

fn tagged_seed_words(uid: &[u8; UID_LEN], words: [u16; 4]) -> [u16; 4] {
    [
        u16_le(uid, 4).wrapping_add(words[0]),
        u16_le(uid, 2).wrapping_add(words[1]),
        u16_le(uid, 0).wrapping_add(words[2]).wrapping_add(KEY[2]),
        words[3].wrapping_add(KEY[3]),
    ]
}

/// Derive a 4-word key from the sensor uid and a nonce pair.
#[must_use]
pub fn derive_key(uid: &[u8; UID_LEN], x: u16, y: u16) -> [u16; 4] {
    mix(seed_words(uid, x, y))
}

/// 4-byte tag derived from the uid, used for the streaming key and unlock.
#[must_use]
pub fn activation_tag(uid: &[u8; UID_LEN], x: u16, y: u16) -> [u8; 4] {
    let key = derive_key(uid, x, y);
    let a = (key[0] ^ 0x4163).to_le_bytes();
    let b = (key[1] ^ 0x4344).to_le_bytes();
    [a[0], a[1], b[0], b[1]]
}

fn key_bytes(key: [u16; 4]) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(key) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn check_image_len(image: &[u8]) -> Result<()> {
    if image.len() != MEMORY_IMAGE_LEN {
        return Err(cgm_types::ParseError::InsufficientBytes {
            expected: MEMORY_IMAGE_LEN,
            actual: image.len(),
        }
        .into());
    }
    Ok(())
}

/// Apply the memory cipher of `sensor_type` to an image.
///
/// The cipher is an XOR, so the same call encrypts and decrypts.
pub fn apply_memory_cipher(
    sensor_type: SensorType,
    uid: &[u8; UID_LEN],
    patch_info: &[u8; PATCH_INFO_LEN],
    image: &[u8],
) -> Result<Vec<u8>> {
    check_image_len(image)?;
    let cipher = MemoryCipher::for_sensor_type(sensor_type)?;
    let patch_word = u16_le(patch_info, 4);

    let mut output = image.to_vec();
    if cipher == MemoryCipher::Plain {
        return Ok(output);
    }

    for (block, chunk) in output.chunks_exact_mut(BLOCK_LEN).enumerate() {
        let y = match cipher {
            MemoryCipher::Libre2 => patch_word ^ LIBRE2_MEMORY_MASK,
            _ if block < 3 || block >= 40 => US14DAY_FRAME_KEY,
            _ => patch_word,
        };
        let key = key_bytes(derive_key(uid, block as u16, y));
        for (byte, k) in chunk.iter_mut().zip(key) {
            *byte ^= k;
        }
    }
    Ok(output)
}

/// Decrypt a 344-byte memory image read from the sensor.
pub fn decrypt_memory_image(
    sensor_type: SensorType,
    uid: &[u8; UID_LEN],
    patch_info: &[u8; PATCH_INFO_LEN],
    image: &[u8],
) -> Result<Vec<u8>> {
    apply_memory_cipher(sensor_type, uid, patch_info, image)
}

fn streaming_keystream(uid: &[u8; UID_LEN], seed: u16) -> [u8; 64] {
    let tag = activation_tag(uid, ACTIVATION_X, ACTIVATION_Y);
    let x = (u16_le(&tag, 0) ^ u16_le(&tag, 2)) | STREAMING_MASK;
    let y = seed ^ STREAMING_MASK;

    let mut keystream = [0u8; 64];
    let mut key = derive_key(uid, x, y);
    for chunk in keystream.chunks_exact_mut(8) {
        chunk.copy_from_slice(&key_bytes(key));
        key = mix(key);
    }
    keystream
}

/// Decrypt a 46-byte streaming packet into its 44-byte payload.
///
/// The payload's last two bytes are a big-endian CRC16 over the first 42;
/// a mismatch is reported as [`Error::Integrity`].
pub fn decrypt_streaming_packet(uid: &[u8; UID_LEN], raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() != STREAMING_PACKET_LEN {
        return Err(cgm_types::ParseError::InsufficientBytes {
            expected: STREAMING_PACKET_LEN,
            actual: raw.len(),
        }
        .into());
    }

    let keystream = streaming_keystream(uid, u16_le(raw, 0));
    let plain: Vec<u8> = raw[2..]
        .iter()
        .zip(keystream)
        .map(|(byte, k)| byte ^ k)
        .collect();

    if let Some((expected, actual)) = trailing_crc_mismatch(&plain) {
        return Err(Error::Integrity {
            context: "streaming packet",
            expected,
            actual,
        });
    }
    Ok(plain)
}

/// Encrypt a 44-byte payload with the given seed.
///
/// Inverse of [`decrypt_streaming_packet`]; used by transmitter fixtures.
pub fn encrypt_streaming_packet(uid: &[u8; UID_LEN], seed: u16, plain: &[u8]) -> Result<Vec<u8>> {
    if plain.len() != STREAMING_PAYLOAD_LEN {
        return Err(cgm_types::ParseError::InsufficientBytes {
            expected: STREAMING_PAYLOAD_LEN,
            actual: plain.len(),
        }
        .into());
    }

    let keystream = streaming_keystream(uid, seed);
    let mut raw = Vec::with_capacity(STREAMING_PACKET_LEN);
    raw.extend_from_slice(&seed.to_le_bytes());
    raw.extend(plain.iter().zip(keystream).map(|(byte, k)| byte ^ k));
    Ok(raw)
}

fn crc_tag(bytes: &[u8]) -> u16 {
    crc16(bytes).swap_bytes()
}

/// Build the 12-byte payload that unlocks BLE streaming.
///
/// `unlock_count` must be incremented and persisted by the caller on every
/// connection; the sensor rejects a replayed payload.
#[must_use]
pub fn build_unlock_payload(
    uid: &[u8; UID_LEN],
    patch_info: &[u8; PATCH_INFO_LEN],
    enable_time: u32,
    unlock_count: u16,
) -> [u8; 12] {
    let time = enable_time.wrapping_add(u32::from(unlock_count));
    let b = time.to_le_bytes();

    let activation = activation_tag(uid, ACTIVATION_X, ACTIVATION_Y);
    let enable = activation_tag(
        uid,
        ENABLE_X,
        ((enable_time & 0xFFFF) as u16) ^ u16_le(patch_info, 4),
    );

    let first = mix(tagged_seed_words(
        uid,
        [
            u16_le(&enable, 0) ^ u16_le(&b, 2),
            u16_le(&activation, 0),
            u16_le(&enable, 2) ^ u16_le(&b, 0),
            u16_le(&activation, 2),
        ],
    ));

    let first_bytes = key_bytes(first);
    let mut preamble = [0u8; 10];
    preamble[..8].copy_from_slice(&UNLOCK_PREAMBLE);
    preamble[8..].copy_from_slice(&first_bytes[..2]);

    let mut auth = [0u8; 6];
    auth[..4].copy_from_slice(&activation);
    auth[4..].copy_from_slice(&enable[..2]);

    let mut clock = [0u8; 6];
    clock[..2].copy_from_slice(&enable[2..]);
    clock[2..].copy_from_slice(&b);

    let second = mix(tagged_seed_words(
        uid,
        [
            crc_tag(&preamble),
            crc_tag(&first_bytes[2..]),
            crc_tag(&auth),
            crc_tag(&clock),
        ],
    ));

    let mut payload = [0u8; 12];
    payload[..4].copy_from_slice(&b);
    payload[4..].copy_from_slice(&key_bytes(second));
    payload
}
