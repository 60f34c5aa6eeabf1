//! Hash slot calculation.
//!
//! Keys map to one of 16384 slots through CRC16/XMODEM modulo 16384. When a
//! key contains a hash tag, only the tag is hashed.

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the hash slot for a key.
///
/// If the key contains `{...}` with a non-empty body, only that body is
/// hashed, so related keys can be forced into the same slot.
///
/// # Arguments
///
/// * `key` - The key, as text or raw bytes
///
/// # Returns
///
/// The slot number (0-16383)
///
/// # Examples
///
/// ```
/// use shardis::key_slot;
///
/// assert_eq!(key_slot("123456789"), 12739);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hashed = hash_tag(key.as_ref());
    CRC16.checksum(hashed) % SLOT_COUNT
}

/// Returns the part of `key` that is hashed.
///
/// - `{user1000}.following` hashes `user1000`
/// - `foo{bar}baz` hashes `bar`
/// - `foo{}{bar}` hashes the whole key (first tag is empty)
/// - `foo` hashes the whole key
pub(crate) fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_slots() {
        assert_eq!(key_slot("123456789"), 12739);
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("bar"), 5061);
        assert_eq!(key_slot(""), 0);
    }

    #[test]
    fn test_key_slot_with_hash_tag() {
        let slot1 = key_slot("{user1000}.following");
        let slot2 = key_slot("{user1000}.followers");
        assert_eq!(slot1, slot2);
        assert_eq!(slot1, key_slot("user1000"));
    }

    #[test]
    fn test_key_slot_accepts_bytes() {
        assert_eq!(key_slot(b"foo"), key_slot("foo"));
        assert_eq!(key_slot(vec![b'f', b'o', b'o']), 12182);
        assert!(key_slot([0xffu8, 0xfe, 0x00]) < SLOT_COUNT);
    }

    #[test]
    fn test_hash_tag_rules() {
        assert_eq!(hash_tag(b"foo{bar}"), b"bar");
        assert_eq!(hash_tag(b"prefix{tag}suffix"), b"tag");
        assert_eq!(hash_tag(b"simple_key"), b"simple_key");
    }

    #[test]
    fn test_hash_tag_empty_uses_whole_key() {
        assert_eq!(hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_tag(b"{}"), b"{}");
    }

    #[test]
    fn test_hash_tag_first_pair_wins() {
        assert_eq!(hash_tag(b"foo{bar}{baz}"), b"bar");
        assert_eq!(hash_tag(b"{a}{b}{c}"), b"a");
        assert_eq!(hash_tag(b"foo{{bar}}zap"), b"{bar");
    }

    #[test]
    fn test_hash_tag_unmatched() {
        assert_eq!(hash_tag(b"foo{bar"), b"foo{bar");
        assert_eq!(hash_tag(b"foo}bar"), b"foo}bar");
        assert_eq!(hash_tag(b"}{"), b"}{");
    }

    #[test]
    fn test_key_slot_distribution() {
        let mut slots = std::collections::HashSet::new();
        for i in 0..100 {
            slots.insert(key_slot(format!("key{i}")));
        }
        assert!(slots.len() >= 50, "keys should spread across slots");
    }
}
