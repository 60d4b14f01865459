// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Host/accelerator byte-order conversion.
//!
//! The accelerator reads every multi-byte field (descriptor words, buffer
//! addresses, ring entries, counters, handshake payloads) as big-endian.
//! This module is the only place the conversion happens; every read of
//! accelerator-visible data goes back through the matching `get_*`.
//!
//! Single-byte fields (handshake state, result, command and length) have no
//! byte order and are accessed directly. Operand byte strings (moduli, keys,
//! messages) are big-endian integers already and are copied verbatim.

/// Convert a 32-bit value to its in-memory accelerator representation.
#[inline]
pub const fn to_device_u32(value: u32) -> u32 {
    value.to_be()
}

/// Inverse of [`to_device_u32`].
#[inline]
pub const fn from_device_u32(value: u32) -> u32 {
    u32::from_be(value)
}

#[inline]
pub fn put_u32(dst: &mut [u8], value: u32) {
    dst[..4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_u32(src: &[u8]) -> u32 {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]])
}

#[inline]
pub fn put_i32(dst: &mut [u8], value: i32) {
    dst[..4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_i32(src: &[u8]) -> i32 {
    i32::from_be_bytes([src[0], src[1], src[2], src[3]])
}

#[inline]
pub fn put_u64(dst: &mut [u8], value: u64) {
    dst[..8].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_u64(src: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[..8]);
    u64::from_be_bytes(raw)
}

/// Split an accelerator address into (high, low) 32-bit halves.
#[inline]
pub const fn split_addr(addr: u64) -> (u32, u32) {
    ((addr >> 32) as u32, addr as u32)
}

/// Join (high, low) halves back into an address.
#[inline]
pub const fn join_addr(high: u32, low: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

/// Serialize descriptor words into accelerator order.
///
/// `dst` must hold at least `4 * words.len()` bytes.
pub fn words_to_device(words: &[u32], dst: &mut [u8]) {
    for (chunk, word) in dst.chunks_exact_mut(4).zip(words) {
        put_u32(chunk, *word);
    }
}

/// Read accelerator-order words back into host order.
pub fn words_from_device(src: &[u8]) -> Vec<u32> {
    src.chunks_exact(4).map(get_u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_fields_round_trip() {
        let mut buf = [0u8; 8];

        put_u32(&mut buf, 0x0102_0304);
        assert_eq!(buf[..4], [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(get_u32(&buf), 0x0102_0304);

        put_i32(&mut buf, -1);
        assert_eq!(get_i32(&buf), -1);

        put_u64(&mut buf, 0x1122_3344_5566_7788);
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(get_u64(&buf), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_conversion_is_involutive() {
        for value in [0u32, 1, 0x8000_0000, 0xDEAD_BEEF, u32::MAX] {
            assert_eq!(from_device_u32(to_device_u32(value)), value);
        }
        for addr in [0u64, 0x1_0000_0000, 0xFFFF_FFFF, 0x8000_0000_0000_1234] {
            let (high, low) = split_addr(addr);
            assert_eq!(join_addr(high, low), addr);
        }
    }

    #[test]
    fn test_multi_word_buffers() {
        let words: Vec<u32> = (0..37u32).map(|i| i.wrapping_mul(0x0101_0101) ^ 0xA5A5_0000).collect();
        let mut raw = vec![0u8; words.len() * 4];
        words_to_device(&words, &mut raw);
        assert_eq!(raw[..4], words[0].to_be_bytes());
        assert_eq!(words_from_device(&raw), words);
    }
}
