//! Transparency Log Engine
//!
//! Append-only Merkle log with C2SP tiles on disk, RFC 6962 inclusion and
//! consistency proofs, and COSE_Sign1 statements, tree heads and receipts.

mod accumulator;
mod audit;
mod claims;
mod config;
mod crypto;
mod envelope;
mod keys;
mod log;
mod merkle;
mod storage;
mod tiles;
mod types;

pub use accumulator::MerkleAccumulator;
pub use audit::{check_consistency, verify_consistency, verify_inclusion, verify_tree_head, Auditor, VerifiedReceipt};
pub use claims::{ReceiptClaims, StatementClaims, TreeHeadClaims, PAYLOAD_DIGEST_LEN};
pub use config::LogConfig;
pub use crypto::{empty_root, hash_internal, hash_leaf, key_id, statement_digest, statement_leaf};
pub use envelope::{sign, verify, Claims, CoseSign1, PayloadKind, COSE_ALG_EDDSA};
pub use keys::{LogSigner, TrustedKeys};
pub use log::{AdmissionPolicy, AllowAll, Registration, SignedTreeHead, Stage, TransparencyLog};
pub use merkle::{
    consistency_path, inclusion_path, root_from_inclusion_path, subtree_hash,
    verify_consistency_proof, verify_inclusion_proof, NodeReader,
};
pub use storage::{FileBackedStorage, InMemoryStorage, Storage};
pub use tiles::{Tile, TileStore, CHECKPOINT_PATH, DEFAULT_TILE_HEIGHT, MAX_TILE_HEIGHT, STATE_PATH};
pub use types::{AppendOutcome, ConsistencyProof, Hash32, InclusionProof, TreeState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlogError {
    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Malformed claims: {0}")]
    MalformedClaims(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Corrupt tile {path}: {reason}")]
    CorruptTile { path: String, reason: String },

    #[error("Fork detected: {0}")]
    ForkDetected(String),

    #[error("Proof mismatch: {0}")]
    ProofMismatch(String),

    #[error("Rejected by admission policy: {0}")]
    PolicyRejected(String),

    /// The leaf is durable but no receipt was produced; re-issue, never re-append.
    #[error("Leaf {leaf_index} appended without a receipt: {reason}")]
    Unreceipted { leaf_index: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TlogError>;
