//! RFC 6962 Merkle tree hashing, proof construction and proof verification.
//!
//! Nodes are addressed by `(level, index)`: the node at `level` and `index`
//! is the root of the complete subtree covering leaves
//! `[index << level, (index + 1) << level)`. Only complete subtrees exist in
//! that arena; hashes over ragged right edges are recomputed on demand from the
//! complete subtrees that tile them.
//!
//! Proof construction follows RFC 6962 §2.1.1 and §2.1.2. Verification follows
//! the iterative algorithms of RFC 9162 §2.1.3.2 and §2.1.4.2.

use crate::crypto::{empty_root, hash_internal};
use crate::types::{ConsistencyProof, Hash32, InclusionProof};
use crate::{Result, TlogError};

/// Source of complete-subtree hashes.
pub trait NodeReader {
    /// Hash of the complete subtree at `level` with position `index`.
    fn node(&self, level: u8, index: u64) -> Result<Hash32>;
}

/// Largest power of two strictly smaller than `n`, with its log2. Requires `n > 1`.
fn maxpow2(n: u64) -> (u64, u8) {
    let level = (n - 1).ilog2() as u8;
    (1 << level, level)
}

/// Root hash of the tree with `size` leaves.
pub fn root<R: NodeReader + ?Sized>(reader: &R, size: u64) -> Result<Hash32> {
    if size == 0 {
        return Ok(empty_root());
    }
    subtree_hash(reader, 0, size)
}

/// Hash of the (possibly incomplete) subtree over leaves `[lo, hi)`.
///
/// `lo` must be aligned to the largest power of two not exceeding `hi - lo`,
/// which holds for every range produced by the RFC 6962 recursive split.
/// Other ranges are `InvalidRange`.
pub fn subtree_hash<R: NodeReader + ?Sized>(reader: &R, lo: u64, hi: u64) -> Result<Hash32> {
    if lo >= hi {
        return Err(TlogError::InvalidRange(format!("empty subtree [{lo}, {hi})")));
    }
    let (first, _) = maxpow2(hi - lo + 1);
    if lo & (first - 1) != 0 {
        return Err(TlogError::InvalidRange(format!(
            "subtree [{lo}, {hi}) is not aligned to {first}"
        )));
    }

    // Left to right: the biggest complete subtree that fits, then the fringe.
    let mut nodes = Vec::new();
    let mut lo = lo;
    while lo < hi {
        let (k, level) = maxpow2(hi - lo + 1);
        nodes.push(reader.node(level, lo >> level)?);
        lo += k;
    }

    let mut iter = nodes.into_iter().rev();
    let mut hash = match iter.next() {
        Some(h) => h,
        None => return Err(TlogError::InvalidRange("empty subtree".into())),
    };
    for left in iter {
        hash = hash_internal(&left, &hash);
    }
    Ok(hash)
}

/// Audit path for leaf `index` in the tree of `size` leaves, leaf to root.
pub fn inclusion_path<R: NodeReader + ?Sized>(
    reader: &R,
    index: u64,
    size: u64,
) -> Result<Vec<Hash32>> {
    if index >= size {
        return Err(TlogError::InvalidRange(format!(
            "leaf index {index} not below tree size {size}"
        )));
    }
    let mut path = Vec::new();
    leaf_path(reader, 0, size, index, &mut path)?;
    Ok(path)
}

fn leaf_path<R: NodeReader + ?Sized>(
    reader: &R,
    lo: u64,
    hi: u64,
    n: u64,
    path: &mut Vec<Hash32>,
) -> Result<()> {
    if lo + 1 == hi {
        // The verifier already knows the leaf.
        return Ok(());
    }
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        leaf_path(reader, lo, lo + k, n, path)?;
        path.push(subtree_hash(reader, lo + k, hi)?);
    } else {
        leaf_path(reader, lo + k, hi, n, path)?;
        path.push(subtree_hash(reader, lo, lo + k)?);
    }
    Ok(())
}

/// Consistency proof between the trees of `old_size` and `new_size` leaves.
///
/// Empty when `old_size` is zero or equals `new_size`.
pub fn consistency_path<R: NodeReader + ?Sized>(
    reader: &R,
    old_size: u64,
    new_size: u64,
) -> Result<Vec<Hash32>> {
    if old_size > new_size {
        return Err(TlogError::InvalidRange(format!(
            "old size {old_size} exceeds new size {new_size}"
        )));
    }
    if old_size == 0 || old_size == new_size {
        return Ok(Vec::new());
    }
    let mut proof = Vec::new();
    subproof(reader, 0, new_size, old_size, &mut proof)?;
    Ok(proof)
}

fn subproof<R: NodeReader + ?Sized>(
    reader: &R,
    lo: u64,
    hi: u64,
    m: u64,
    proof: &mut Vec<Hash32>,
) -> Result<()> {
    if m == hi {
        // Common ground. The old root itself is known to the verifier.
        if lo != 0 {
            proof.push(subtree_hash(reader, lo, hi)?);
        }
        return Ok(());
    }
    let (k, _) = maxpow2(hi - lo);
    if m <= lo + k {
        subproof(reader, lo, lo + k, m, proof)?;
        proof.push(subtree_hash(reader, lo + k, hi)?);
    } else {
        subproof(reader, lo + k, hi, m, proof)?;
        proof.push(subtree_hash(reader, lo, lo + k)?);
    }
    Ok(())
}

/// Recomputes the root implied by an audit path.
pub fn root_from_inclusion_path(
    leaf: &Hash32,
    index: u64,
    size: u64,
    path: &[Hash32],
) -> Result<Hash32> {
    if index >= size {
        return Err(TlogError::InvalidRange(format!(
            "leaf index {index} not below tree size {size}"
        )));
    }

    let mut fnode = index;
    let mut snode = size - 1;
    let mut r = *leaf;

    for p in path {
        if snode == 0 {
            return Err(TlogError::ProofMismatch("audit path too long".into()));
        }
        if fnode & 1 == 1 || fnode == snode {
            r = hash_internal(p, &r);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            r = hash_internal(&r, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(TlogError::ProofMismatch("audit path too short".into()));
    }
    Ok(r)
}

/// Checks that `proof` shows `leaf` at `proof.leaf_index` in the tree with `root`.
pub fn verify_inclusion_proof(proof: &InclusionProof, leaf: &Hash32, root: &Hash32) -> Result<()> {
    let computed =
        root_from_inclusion_path(leaf, proof.leaf_index, proof.tree_size, &proof.audit_path)?;
    if computed != *root {
        return Err(TlogError::ProofMismatch(format!(
            "audit path for leaf {} yields {computed}, tree head of size {} has {root}",
            proof.leaf_index, proof.tree_size
        )));
    }
    Ok(())
}

/// Checks that `proof` shows the tree with `old_root` is a prefix of the tree with `new_root`.
pub fn verify_consistency_proof(
    proof: &ConsistencyProof,
    old_root: &Hash32,
    new_root: &Hash32,
) -> Result<()> {
    let (m, n) = (proof.old_size, proof.new_size);
    if m > n {
        return Err(TlogError::InvalidRange(format!(
            "old size {m} exceeds new size {n}"
        )));
    }

    if m == 0 {
        if !proof.proof_hashes.is_empty() {
            return Err(TlogError::ProofMismatch(
                "non-empty proof from the empty tree".into(),
            ));
        }
        if *old_root != empty_root() {
            return Err(TlogError::ProofMismatch(
                "empty tree with a non-empty root".into(),
            ));
        }
        return Ok(());
    }

    if m == n {
        if !proof.proof_hashes.is_empty() {
            return Err(TlogError::ProofMismatch(
                "non-empty proof between equal sizes".into(),
            ));
        }
        if old_root != new_root {
            return Err(TlogError::ProofMismatch(format!(
                "two roots for tree size {m}: {old_root} and {new_root}"
            )));
        }
        return Ok(());
    }

    if proof.proof_hashes.is_empty() {
        return Err(TlogError::ProofMismatch("empty consistency proof".into()));
    }

    let mut path = Vec::with_capacity(proof.proof_hashes.len() + 1);
    if m.is_power_of_two() {
        path.push(*old_root);
    }
    path.extend_from_slice(&proof.proof_hashes);

    let mut fnode = m - 1;
    let mut snode = n - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = path[0];
    let mut sr = path[0];
    for c in &path[1..] {
        if snode == 0 {
            return Err(TlogError::ProofMismatch("consistency proof too long".into()));
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = hash_internal(c, &fr);
            sr = hash_internal(c, &sr);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            sr = hash_internal(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(TlogError::ProofMismatch("consistency proof too short".into()));
    }
    if fr != *old_root {
        return Err(TlogError::ProofMismatch(format!(
            "proof yields {fr} for size {m}, expected {old_root}"
        )));
    }
    if sr != *new_root {
        return Err(TlogError::ProofMismatch(format!(
            "proof yields {sr} for size {n}, expected {new_root}"
        )));
    }
    Ok(())
}
