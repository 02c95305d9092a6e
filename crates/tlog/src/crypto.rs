//! Domain-separated cryptographic operations (RFC 6962 §2.1)

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

use crate::Hash32;

const DOMAIN_LEAF: u8 = 0x00;
const DOMAIN_INTERNAL: u8 = 0x01;

/// Leaf hash
/// leaf = SHA-256(0x00 || data)
pub fn hash_leaf(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([DOMAIN_LEAF]);
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// Internal node hash
/// node = SHA-256(0x01 || left || right)
pub fn hash_internal(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([DOMAIN_INTERNAL]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash32(hasher.finalize().into())
}

/// Root of the empty tree: SHA-256 of the empty string.
pub fn empty_root() -> Hash32 {
    Hash32(Sha256::digest(b"").into())
}

/// Digest identifying a registered statement: SHA-256 over its envelope bytes.
///
/// The leaf committed to the tree is `hash_leaf(statement_digest(bytes))`, so a
/// registrant can recompute it from the statement alone.
pub fn statement_digest(envelope: &[u8]) -> Hash32 {
    Hash32(Sha256::digest(envelope).into())
}

/// Leaf hash for a statement digest.
pub fn statement_leaf(digest: &Hash32) -> Hash32 {
    hash_leaf(&digest.0)
}

/// COSE key identifier for a verifying key (BLAKE3 of the public key bytes).
pub fn key_id(key: &VerifyingKey) -> [u8; 32] {
    blake3::hash(key.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_node_domains_differ() {
        let a = Hash32([7u8; 32]);
        let b = Hash32([9u8; 32]);

        let mut concat = Vec::with_capacity(64);
        concat.extend_from_slice(&a.0);
        concat.extend_from_slice(&b.0);

        // Same input bytes, different prefix.
        assert_ne!(hash_leaf(&concat), hash_internal(&a, &b));
    }

    #[test]
    fn empty_root_matches_rfc6962() {
        assert_eq!(
            empty_root().to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn empty_leaf_matches_rfc6962() {
        assert_eq!(
            hash_leaf(&[]).to_hex(),
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d"
        );
    }
}
