//! Content hashing for correlation and replication.
//!
//! Provides deterministic SHA-256 hashing of serialized content for:
//! - Acknowledgement correlation (a message's hash is its ack id)
//! - Change detection between Master and Frontdesk (entity hashes)
//! - Replication reconciliation (per-entity hash dictionaries)
//!
//! Hashes travel on the wire, so they are rendered as lowercase hex strings
//! rather than raw bytes.

use sha2::{Digest, Sha256};

/// A SHA-256 digest rendered as lowercase hex (64 chars).
pub type ContentHash = String;

/// Hash arbitrary text.
pub fn hash_text(text: &str) -> ContentHash {
    hash_bytes(text.as_bytes())
}

/// Hash raw bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let a = hash_text("CUBEMSG|sender=Master|msgtype=HEARTBEAT");
        let b = hash_text("CUBEMSG|sender=Master|msgtype=HEARTBEAT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(hash_text("a"), hash_text("b"));
    }

    #[test]
    fn test_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hash_text(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
