//! Block identity hashing.
//!
//! A block's ID is MurmurHash3 (x86, 32-bit) of its key. The query path
//! recomputes IDs from a heading and a document name, so the output must stay
//! stable across platforms and restarts.

use std::io::Cursor;

/// Seed used for every block ID.
pub const DEFAULT_SEED: u32 = 42;

/// Hash a block key with the default seed.
pub fn block_id(key: &str) -> u32 {
    murmur3_32(key.as_bytes(), DEFAULT_SEED)
}

/// MurmurHash3 x86_32 over raw bytes.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    // reading from an in-memory slice cannot fail
    murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"", 0xffff_ffff), 0x81f1_6f39);
        assert_eq!(murmur3_32(b"test", 0), 0xba6b_d213);
        assert_eq!(murmur3_32(b"Hello, world!", 1234), 0xfaf6_cdb3);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn test_block_id_is_deterministic() {
        let key = "Introduction of notes.md";
        assert_eq!(block_id(key), block_id(key));
        assert_eq!(block_id(key), murmur3_32(key.as_bytes(), DEFAULT_SEED));
    }

    #[test]
    fn test_block_id_differs_for_different_keys() {
        assert_ne!(block_id("Intro of a.md"), block_id("Intro of b.md"));
        assert_ne!(block_id("prologue_of_a.md"), block_id("full_document_of_a.md"));
    }

    #[test]
    fn test_hashes_utf8_bytes() {
        let key = "회의록 of 노트.md";
        assert_eq!(block_id(key), murmur3_32(key.as_bytes(), 42));
        assert_ne!(block_id(key), block_id("회의록 of 노트2.md"));
    }

    #[test]
    fn test_tail_lengths() {
        // every remainder length goes through a different tail branch
        let ids: Vec<u32> = ["a", "ab", "abc", "abcd", "abcde"]
            .iter()
            .map(|s| block_id(s))
            .collect();
        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
