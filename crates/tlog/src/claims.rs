//! Payload schemas for the three envelope kinds.

use serde::{Deserialize, Serialize};

use crate::crypto::empty_root;
use crate::envelope::{Claims, PayloadKind};
use crate::types::{Hash32, InclusionProof};
use crate::{Result, TlogError};

/// Length of a statement's payload digest (SHA-256).
pub const PAYLOAD_DIGEST_LEN: usize = 32;

/// Largest audit path a tree of 2^64 leaves can need.
const MAX_PATH_LEN: usize = 64;

/// Claims a submitter signs into a statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementClaims {
    pub issuer: String,
    pub subject: String,
    pub issued_at: u64,
    /// Media type of the artifact the digest covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    #[serde(with = "serde_bytes")]
    pub payload_digest: Vec<u8>,
}

impl Claims for StatementClaims {
    const KIND: PayloadKind = PayloadKind::Statement;

    fn validate(&self) -> Result<()> {
        if self.issuer.trim().is_empty() {
            return Err(TlogError::MalformedClaims("statement has no issuer".into()));
        }
        if self.subject.trim().is_empty() {
            return Err(TlogError::MalformedClaims("statement has no subject".into()));
        }
        if self.payload_digest.len() != PAYLOAD_DIGEST_LEN {
            return Err(TlogError::MalformedClaims(format!(
                "payload digest is {} bytes, expected {PAYLOAD_DIGEST_LEN}",
                self.payload_digest.len()
            )));
        }
        Ok(())
    }
}

/// Log state the log signs as a tree head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHeadClaims {
    /// Identifies the log; tree heads of different logs are never compared
    pub origin: String,
    pub tree_size: u64,
    pub root_hash: Hash32,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Claims for TreeHeadClaims {
    const KIND: PayloadKind = PayloadKind::TreeHead;

    fn validate(&self) -> Result<()> {
        if self.origin.trim().is_empty() {
            return Err(TlogError::MalformedClaims("tree head has no origin".into()));
        }
        if self.tree_size == 0 && self.root_hash != empty_root() {
            return Err(TlogError::MalformedClaims(
                "empty tree head with a non-empty root".into(),
            ));
        }
        Ok(())
    }
}

/// Inclusion proof plus the signed tree head it resolves to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptClaims {
    pub leaf_index: u64,
    pub tree_size: u64,
    pub statement_digest: Hash32,
    pub audit_path: Vec<Hash32>,
    /// Signed tree head envelope for `tree_size`
    #[serde(with = "serde_bytes")]
    pub tree_head: Vec<u8>,
}

impl ReceiptClaims {
    pub fn inclusion_proof(&self) -> InclusionProof {
        InclusionProof {
            leaf_index: self.leaf_index,
            tree_size: self.tree_size,
            audit_path: self.audit_path.clone(),
        }
    }
}

impl Claims for ReceiptClaims {
    const KIND: PayloadKind = PayloadKind::Receipt;

    fn validate(&self) -> Result<()> {
        if self.leaf_index >= self.tree_size {
            return Err(TlogError::MalformedClaims(format!(
                "leaf index {} outside tree of size {}",
                self.leaf_index, self.tree_size
            )));
        }
        if self.audit_path.len() > MAX_PATH_LEN {
            return Err(TlogError::MalformedClaims(format!(
                "audit path of {} hashes",
                self.audit_path.len()
            )));
        }
        if self.tree_head.is_empty() {
            return Err(TlogError::MalformedClaims("receipt lacks a tree head".into()));
        }
        Ok(())
    }
}
