//! Registration protocol: the transparency log service core.
//!
//! A statement moves through `Received → Verified → Appended → Signed →
//! Returned`. Nothing durable happens before `Appended`; after it, the leaf is
//! permanent and a failure to produce the receipt is reported as
//! [`TlogError::Unreceipted`], recoverable with [`TransparencyLog::issue_receipt`].

use std::fmt;

use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::accumulator::MerkleAccumulator;
use crate::claims::{ReceiptClaims, StatementClaims, TreeHeadClaims};
use crate::config::LogConfig;
use crate::crypto::{statement_digest, statement_leaf};
use crate::envelope::{self, CoseSign1};
use crate::keys::{LogSigner, TrustedKeys};
use crate::merkle;
use crate::storage::Storage;
use crate::tiles::Tile;
use crate::types::{ConsistencyProof, Hash32, InclusionProof, TreeState};
use crate::{Result, TlogError};

/// Decides whether a verified statement may be appended.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, claims: &StatementClaims) -> std::result::Result<(), String>;
}

/// Admits every verified statement.
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn admit(&self, _claims: &StatementClaims) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl<F> AdmissionPolicy for F
where
    F: Fn(&StatementClaims) -> std::result::Result<(), String> + Send + Sync,
{
    fn admit(&self, claims: &StatementClaims) -> std::result::Result<(), String> {
        self(claims)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    Verified,
    Appended,
    Signed,
    Returned,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Verified => "verified",
            Stage::Appended => "appended",
            Stage::Signed => "signed",
            Stage::Returned => "returned",
        };
        f.write_str(name)
    }
}

/// A tree head together with its signed envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTreeHead {
    pub claims: TreeHeadClaims,
    pub envelope: Vec<u8>,
}

/// Outcome of a successful registration.
#[derive(Clone, Debug)]
pub struct Registration {
    pub leaf_index: u64,
    pub statement_digest: Hash32,
    pub tree_head: SignedTreeHead,
    /// Receipt envelope bytes
    pub receipt: Vec<u8>,
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

pub struct TransparencyLog<S: Storage> {
    config: LogConfig,
    accumulator: MerkleAccumulator<S>,
    signer: LogSigner,
    submitters: TrustedKeys,
    policy: Box<dyn AdmissionPolicy>,
    latest: RwLock<Option<SignedTreeHead>>,
}

impl<S: Storage> TransparencyLog<S> {
    /// Opens (or creates) the log persisted in `storage`.
    ///
    /// A previously published checkpoint must still be consistent with the
    /// tiles: a checkpoint ahead of the recorded size, or one whose root no
    /// longer matches, is reported as corruption.
    pub fn open(
        storage: S,
        config: LogConfig,
        signer: LogSigner,
        submitters: TrustedKeys,
    ) -> Result<Self> {
        config.validate()?;
        let accumulator = MerkleAccumulator::open(storage, config.tile_height)?;
        let state = accumulator.state();

        let latest = match accumulator.tile_store().read_checkpoint()? {
            Some(bytes) => {
                match envelope::verify::<TreeHeadClaims>(&bytes, &signer.verifying_key()) {
                    Ok(claims) if claims.origin == config.origin => {
                        Self::check_checkpoint(&accumulator, &state, &claims)?;
                        (claims.tree_size == state.tree_size)
                            .then_some(SignedTreeHead { claims, envelope: bytes })
                    }
                    Ok(claims) => {
                        warn!(origin = %claims.origin, "log: checkpoint for another origin ignored");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "log: checkpoint not signed by the current key, ignored");
                        None
                    }
                }
            }
            None => None,
        };

        info!(
            origin = %config.origin,
            tree_size = state.tree_size,
            submitters = submitters.len(),
            "log: opened"
        );

        Ok(Self {
            config,
            accumulator,
            signer,
            submitters,
            policy: Box::new(AllowAll),
            latest: RwLock::new(latest),
        })
    }

    fn check_checkpoint(
        accumulator: &MerkleAccumulator<S>,
        state: &TreeState,
        published: &TreeHeadClaims,
    ) -> Result<()> {
        if published.tree_size > state.tree_size {
            return Err(TlogError::CorruptTile {
                path: "checkpoint".into(),
                reason: format!(
                    "published tree size {} is ahead of recorded size {}",
                    published.tree_size, state.tree_size
                ),
            });
        }
        let root = accumulator.root_at(published.tree_size)?;
        if root != published.root_hash {
            return Err(TlogError::CorruptTile {
                path: "checkpoint".into(),
                reason: format!(
                    "tiles yield root {root} at published size {}, checkpoint says {}",
                    published.tree_size, published.root_hash
                ),
            });
        }
        Ok(())
    }

    pub fn with_policy(mut self, policy: impl AdmissionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn origin(&self) -> &str {
        &self.config.origin
    }

    pub fn log_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    pub fn size(&self) -> u64 {
        self.accumulator.size()
    }

    pub fn accumulator(&self) -> &MerkleAccumulator<S> {
        &self.accumulator
    }

    /// Registers a signed statement and returns its receipt.
    pub fn register(&self, statement: &[u8]) -> Result<Registration> {
        let digest = statement_digest(statement);
        debug!(stage = %Stage::Received, %digest, bytes = statement.len(), "register");

        let claims = self.admit(statement, &digest)?;
        debug!(stage = %Stage::Verified, %digest, subject = %claims.subject, "register");

        let outcome = self.accumulator.append_batch(&[statement_leaf(&digest)])?;
        let leaf_index = outcome.first_index;
        info!(
            stage = %Stage::Appended,
            leaf_index,
            tree_size = outcome.state.tree_size,
            subject = %claims.subject,
            "register"
        );

        self.receipt_for(leaf_index, digest, outcome.state)
            .map_err(|e| Self::unreceipted(leaf_index, e))
    }

    /// Registers several statements as one append.
    ///
    /// Every statement is verified before anything is appended; one bad
    /// statement rejects the whole batch.
    pub fn register_batch(&self, statements: &[Vec<u8>]) -> Result<Vec<Registration>> {
        let mut digests = Vec::with_capacity(statements.len());
        for statement in statements {
            let digest = statement_digest(statement);
            self.admit(statement, &digest)?;
            digests.push(digest);
        }
        let leaves: Vec<Hash32> = digests.iter().map(statement_leaf).collect();

        let outcome = self.accumulator.append_batch(&leaves)?;
        info!(
            stage = %Stage::Appended,
            first_index = outcome.first_index,
            count = leaves.len(),
            tree_size = outcome.state.tree_size,
            "register_batch"
        );

        digests
            .into_iter()
            .enumerate()
            .map(|(i, digest)| {
                let leaf_index = outcome.first_index + i as u64;
                self.receipt_for(leaf_index, digest, outcome.state)
                    .map_err(|e| Self::unreceipted(leaf_index, e))
            })
            .collect()
    }

    /// Rebuilds the receipt for a statement that is already in the log.
    pub fn issue_receipt(&self, leaf_index: u64, statement: &[u8]) -> Result<Registration> {
        let digest = statement_digest(statement);
        let leaf = self.accumulator.leaf_hash(leaf_index)?;
        if leaf != statement_leaf(&digest) {
            return Err(TlogError::ProofMismatch(format!(
                "leaf {leaf_index} does not hold statement {digest}"
            )));
        }
        self.receipt_for(leaf_index, digest, self.accumulator.state())
    }

    fn admit(&self, statement: &[u8], digest: &Hash32) -> Result<StatementClaims> {
        let claims = self.verify_statement(statement).map_err(|e| {
            warn!(%digest, error = %e, "register: statement rejected");
            e
        })?;
        self.policy.admit(&claims).map_err(|reason| {
            warn!(%digest, subject = %claims.subject, %reason, "register: refused by policy");
            TlogError::PolicyRejected(reason)
        })?;
        Ok(claims)
    }

    fn verify_statement(&self, statement: &[u8]) -> Result<StatementClaims> {
        let envelope = CoseSign1::decode(statement)?;
        let key = self.submitters.get(envelope.key_id()).ok_or_else(|| {
            TlogError::Signature(format!(
                "statement signed by untrusted key {}",
                hex::encode(envelope.key_id())
            ))
        })?;
        envelope.verify_signature(key)?;
        envelope::decode_claims(&envelope)
    }

    fn unreceipted(leaf_index: u64, e: TlogError) -> TlogError {
        warn!(leaf_index, error = %e, "register: leaf appended but receipt not issued");
        TlogError::Unreceipted {
            leaf_index,
            reason: e.to_string(),
        }
    }

    fn receipt_for(&self, leaf_index: u64, digest: Hash32, state: TreeState) -> Result<Registration> {
        // The audit path comes from tiles; the root comes from the state record.
        // Never sign a path that does not lead to the root.
        let proof = self.accumulator.inclusion_proof(leaf_index, state.tree_size)?;
        let leaf = statement_leaf(&digest);
        if let Err(e) = merkle::verify_inclusion_proof(&proof, &leaf, &state.root_hash) {
            let tiles = self.accumulator.tile_store();
            let width = tiles.width();
            let index = leaf_index / width;
            let tile = Tile::new(
                tiles.height(),
                0,
                index,
                (state.tree_size - index * width).min(width) as u16,
            );
            error!(
                leaf_index,
                tree_size = state.tree_size,
                tile = %tile.path(),
                error = %e,
                "log: audit path does not reach the recorded root"
            );
            return Err(TlogError::CorruptTile {
                path: tile.path(),
                reason: format!("audit path for leaf {leaf_index} does not reach the recorded root: {e}"),
            });
        }

        let tree_head = self.sign_tree_head(state)?;
        debug!(stage = %Stage::Signed, leaf_index, tree_size = state.tree_size, "register");

        let claims = ReceiptClaims {
            leaf_index,
            tree_size: proof.tree_size,
            statement_digest: digest,
            audit_path: proof.audit_path,
            tree_head: tree_head.envelope.clone(),
        };
        let receipt = envelope::sign(&claims, self.signer.signing_key())?;
        debug!(stage = %Stage::Returned, leaf_index, receipt_bytes = receipt.len(), "register");

        Ok(Registration {
            leaf_index,
            statement_digest: digest,
            tree_head,
            receipt,
        })
    }

    /// Signed tree head for the current size.
    ///
    /// Re-signed only when the tree has grown since the last one.
    pub fn tree_head(&self) -> Result<SignedTreeHead> {
        self.sign_tree_head(self.accumulator.state())
    }

    fn sign_tree_head(&self, state: TreeState) -> Result<SignedTreeHead> {
        if let Some(head) = self.latest.read().as_ref() {
            if head.claims.tree_size == state.tree_size {
                return Ok(head.clone());
            }
        }

        let claims = TreeHeadClaims {
            origin: self.config.origin.clone(),
            tree_size: state.tree_size,
            root_hash: state.root_hash,
            timestamp: now_millis(),
        };
        let envelope = envelope::sign(&claims, self.signer.signing_key())?;
        let head = SignedTreeHead { claims, envelope };
        self.publish(&head)?;
        Ok(head)
    }

    /// Persists `head` as the checkpoint unless a larger one is already out.
    fn publish(&self, head: &SignedTreeHead) -> Result<()> {
        let mut latest = self.latest.write();
        let newer = latest
            .as_ref()
            .map_or(true, |l| l.claims.tree_size < head.claims.tree_size);
        if newer {
            self.accumulator
                .tile_store()
                .write_checkpoint(&head.envelope)?;
            *latest = Some(head.clone());
            debug!(tree_size = head.claims.tree_size, "log: checkpoint published");
        }
        Ok(())
    }

    pub fn root_at(&self, tree_size: u64) -> Result<Hash32> {
        self.accumulator.root_at(tree_size)
    }

    pub fn inclusion_proof(&self, leaf_index: u64, tree_size: u64) -> Result<InclusionProof> {
        self.accumulator.inclusion_proof(leaf_index, tree_size)
    }

    pub fn consistency_proof(&self, old_size: u64, new_size: u64) -> Result<ConsistencyProof> {
        self.accumulator.consistency_proof(old_size, new_size)
    }
}
