//! CRC-32/IEEE (the reflected 0xEDB88320 polynomial), used as a corruption
//! check on record payloads, not a cryptographic MAC.

use std::sync::OnceLock;

const POLY: u32 = 0xEDB8_8320;

fn table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ POLY
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    })
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let table = table();
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ table[idx];
    }
    crc ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn known_vector() {
        // Canonical CRC-32/IEEE check value for the ASCII string "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn empty_input() {
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn same_input_same_checksum() {
        let data = b"the quick brown fox";
        assert_eq!(crc32(data), crc32(data));
    }

    #[test]
    fn single_bit_flip_changes_checksum() {
        let mut data = b"the quick brown fox".to_vec();
        let original = crc32(&data);
        data[0] ^= 0x01;
        assert_ne!(crc32(&data), original);
    }

    #[test]
    fn differing_inputs_differ_with_high_probability() {
        for i in 0..64u8 {
            let mut data = vec![0u8; 32];
            data[i as usize % 32] = i;
            let mut flipped = data.clone();
            flipped[(i as usize + 1) % 32] ^= 0xFF;
            assert_ne!(crc32(&data), crc32(&flipped));
        }
    }
}
