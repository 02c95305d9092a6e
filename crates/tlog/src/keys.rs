//! Log signing key and the registry of trusted submitter keys.
//!
//! Custody lives outside the engine; callers hand in key material.

use std::collections::HashMap;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::crypto::key_id;

/// The log's own signing identity.
pub struct LogSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl LogSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Fresh random key (tests, demos and first boot).
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(seed))
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    pub fn key_id(&self) -> [u8; 32] {
        key_id(&self.verifying_key)
    }
}

/// Submitter keys accepted for registration, indexed by COSE key id.
#[derive(Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<[u8; 32], VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: VerifyingKey) {
        self.keys.insert(key_id(&key), key);
    }

    pub fn with(mut self, key: VerifyingKey) -> Self {
        self.insert(key);
        self
    }

    pub fn get(&self, kid: &[u8]) -> Option<&VerifyingKey> {
        let kid: [u8; 32] = kid.try_into().ok()?;
        self.keys.get(&kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<VerifyingKey> for TrustedKeys {
    fn from_iter<I: IntoIterator<Item = VerifyingKey>>(iter: I) -> Self {
        let mut keys = TrustedKeys::new();
        for key in iter {
            keys.insert(key);
        }
        keys
    }
}
