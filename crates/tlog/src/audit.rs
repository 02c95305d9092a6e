//! Offline verification of receipts and tree heads.
//!
//! Everything here is a pure function of log outputs and the log's public key.

use ed25519_dalek::VerifyingKey;
use tracing::{debug, error};

use crate::claims::{ReceiptClaims, TreeHeadClaims};
use crate::crypto::statement_leaf;
use crate::envelope;
use crate::merkle;
use crate::types::{ConsistencyProof, Hash32};
use crate::{Result, TlogError};

/// A receipt that checked out, with the tree head it resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedReceipt {
    pub leaf_index: u64,
    pub statement_digest: Hash32,
    pub tree_head: TreeHeadClaims,
}

/// Verifies a signed tree head envelope.
pub fn verify_tree_head(sth: &[u8], log_key: &VerifyingKey) -> Result<TreeHeadClaims> {
    envelope::verify(sth, log_key)
}

/// Verifies that `receipt` proves the statement with `expected_digest` is in the log.
///
/// Checks the receipt signature, the embedded tree head signature, and that
/// the audit path rebuilds the tree head's root from the statement's leaf.
pub fn verify_inclusion(
    receipt: &[u8],
    log_key: &VerifyingKey,
    expected_digest: &Hash32,
) -> Result<VerifiedReceipt> {
    let claims: ReceiptClaims = envelope::verify(receipt, log_key)?;
    let head = verify_tree_head(&claims.tree_head, log_key)?;

    if claims.statement_digest != *expected_digest {
        return Err(TlogError::ProofMismatch(format!(
            "receipt covers statement {}, expected {expected_digest}",
            claims.statement_digest
        )));
    }
    if claims.tree_size != head.tree_size {
        return Err(TlogError::ProofMismatch(format!(
            "receipt is for tree size {}, its tree head has size {}",
            claims.tree_size, head.tree_size
        )));
    }

    merkle::verify_inclusion_proof(
        &claims.inclusion_proof(),
        &statement_leaf(expected_digest),
        &head.root_hash,
    )?;

    Ok(VerifiedReceipt {
        leaf_index: claims.leaf_index,
        statement_digest: claims.statement_digest,
        tree_head: head,
    })
}

/// Verifies that `new_sth` extends `old_sth`.
///
/// A proof that fails to reproduce either root is a fork.
pub fn verify_consistency(
    old_sth: &[u8],
    new_sth: &[u8],
    proof: &ConsistencyProof,
    log_key: &VerifyingKey,
) -> Result<()> {
    let old = verify_tree_head(old_sth, log_key)?;
    let new = verify_tree_head(new_sth, log_key)?;
    check_consistency(&old, &new, proof)
}

/// Consistency between two tree heads whose signatures were already checked.
pub fn check_consistency(
    old: &TreeHeadClaims,
    new: &TreeHeadClaims,
    proof: &ConsistencyProof,
) -> Result<()> {
    if old.origin != new.origin {
        return Err(TlogError::ProofMismatch(format!(
            "tree heads from different logs: {} and {}",
            old.origin, new.origin
        )));
    }
    if old.tree_size > new.tree_size {
        return Err(TlogError::InvalidRange(format!(
            "old tree head size {} exceeds new size {}",
            old.tree_size, new.tree_size
        )));
    }
    if proof.old_size != old.tree_size || proof.new_size != new.tree_size {
        return Err(TlogError::ProofMismatch(format!(
            "proof spans {}..{}, tree heads span {}..{}",
            proof.old_size, proof.new_size, old.tree_size, new.tree_size
        )));
    }

    match merkle::verify_consistency_proof(proof, &old.root_hash, &new.root_hash) {
        Ok(()) => Ok(()),
        Err(TlogError::ProofMismatch(reason)) => Err(TlogError::ForkDetected(format!(
            "{}: sizes {} -> {}: {reason}",
            new.origin, old.tree_size, new.tree_size
        ))),
        Err(e) => Err(e),
    }
}

/// Tracks one log's tree heads over time.
///
/// Every newer tree head must come with a consistency proof from the last
/// trusted one. After a fork the auditor refuses everything.
pub struct Auditor {
    log_key: VerifyingKey,
    origin: String,
    trusted: Option<TreeHeadClaims>,
    halted: Option<String>,
}

impl Auditor {
    pub fn new(origin: impl Into<String>, log_key: VerifyingKey) -> Self {
        Self {
            log_key,
            origin: origin.into(),
            trusted: None,
            halted: None,
        }
    }

    pub fn trusted(&self) -> Option<&TreeHeadClaims> {
        self.trusted.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Checks `sth` against the last trusted tree head and adopts it.
    ///
    /// `proof` is required whenever the tree grew. A tree head smaller than
    /// the trusted one, or a second root for a known size, is a fork.
    pub fn observe(&mut self, sth: &[u8], proof: Option<&ConsistencyProof>) -> Result<TreeHeadClaims> {
        if let Some(reason) = &self.halted {
            return Err(TlogError::ForkDetected(format!("auditor halted: {reason}")));
        }

        let head = verify_tree_head(sth, &self.log_key)?;
        if head.origin != self.origin {
            return Err(TlogError::ProofMismatch(format!(
                "tree head for {}, auditing {}",
                head.origin, self.origin
            )));
        }

        let Some(trusted) = &self.trusted else {
            debug!(origin = %head.origin, tree_size = head.tree_size, "auditor: first tree head");
            self.trusted = Some(head.clone());
            return Ok(head);
        };

        let outcome = if head.tree_size < trusted.tree_size {
            Err(TlogError::ForkDetected(format!(
                "log went back from size {} to {}",
                trusted.tree_size, head.tree_size
            )))
        } else if head.tree_size == trusted.tree_size {
            if head.root_hash == trusted.root_hash {
                Ok(())
            } else {
                Err(TlogError::ForkDetected(format!(
                    "two roots for size {}: {} and {}",
                    head.tree_size, trusted.root_hash, head.root_hash
                )))
            }
        } else {
            match proof {
                Some(proof) => check_consistency(trusted, &head, proof),
                None => {
                    return Err(TlogError::InvalidRange(format!(
                        "growth from {} to {} needs a consistency proof",
                        trusted.tree_size, head.tree_size
                    )))
                }
            }
        };

        match outcome {
            Ok(()) => {
                debug!(origin = %head.origin, tree_size = head.tree_size, "auditor: tree head accepted");
                self.trusted = Some(head.clone());
                Ok(head)
            }
            Err(TlogError::ForkDetected(reason)) => {
                error!(origin = %self.origin, %reason, "auditor: fork detected, halting");
                self.halted = Some(reason.clone());
                Err(TlogError::ForkDetected(reason))
            }
            Err(e) => Err(e),
        }
    }
}
