//! Shared digest utilities.
//!
//! SHA-256 is used for cache keys and strong asset checksums; CRC32 is the
//! fast checksum computed for every delivered asset.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Compute a CRC32 (IEEE) checksum as 8 lowercase hex characters.
pub fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn consistent_output() {
        let data = b"hello world";
        assert_eq!(sha256_hex(data), sha256_hex(data));
        assert_eq!(sha256_hex(data).len(), 64);
    }

    #[test]
    fn crc32_known_vector() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32_hex(b"123456789"), "cbf43926");
    }

    #[test]
    fn crc32_detects_single_byte_change() {
        assert_ne!(crc32_hex(b"frame-0001"), crc32_hex(b"frame-0002"));
    }
}
