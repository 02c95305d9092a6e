use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tlog::{
    empty_root, hash_internal, hash_leaf, verify_consistency_proof, verify_inclusion_proof,
    FileBackedStorage, Hash32, InMemoryStorage, MerkleAccumulator, Storage, TlogError, STATE_PATH,
};

/// Leaf inputs of the RFC 6962 reference test vectors.
const RFC6962_LEAVES: [&str; 8] = [
    "",
    "00",
    "10",
    "2021",
    "3031",
    "40414243",
    "5051525354555657",
    "606162636465666768696a6b6c6d6e6f",
];

/// Tree roots for the first 1..=8 of those leaves.
const RFC6962_ROOTS: [&str; 8] = [
    "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d",
    "fac54203e7cc696cf0dfcb42c92a1d9dbaf70ad9e621f4bd8d98662f00e3c125",
    "aeb6bcfe274b70a14fb067a5e5578264db0fa9b51af5e0ba159158f329e06e77",
    "d37ee418976dd95753c1c73862b9398fa2a2cf9b4ff0fdfe8b30cd95209614b7",
    "4e3bbb1f7b478dcfe71fb631631519a3bca12c9aefca1612bfce4c13a86264d4",
    "76e67dadbcdf1e10e1b74ddc608abd2f98dfb16fbce75277b5232a127f2087ef",
    "ddb89be403809e325750d3d263cd78929c2942b7942a34b77e122c9594a74c8c",
    "5dc9da79a70659a9ad559cb701ded9a2ab9d823aad2f4960cfe370eff4604328",
];

fn rfc6962_leaves() -> Vec<Hash32> {
    RFC6962_LEAVES
        .iter()
        .map(|h| hash_leaf(&hex::decode(h).unwrap()))
        .collect()
}

fn numbered_leaves(n: u64) -> Vec<Hash32> {
    (0..n).map(|i| hash_leaf(&i.to_be_bytes())).collect()
}

/// Straight recursive RFC 6962 tree hash over leaf hashes.
fn reference_root(leaves: &[Hash32]) -> Hash32 {
    match leaves.len() {
        0 => empty_root(),
        1 => leaves[0],
        n => {
            let k = largest_power_of_two_below(n);
            hash_internal(&reference_root(&leaves[..k]), &reference_root(&leaves[k..]))
        }
    }
}

fn largest_power_of_two_below(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn open(storage: InMemoryStorage, height: u8) -> MerkleAccumulator<InMemoryStorage> {
    MerkleAccumulator::open(storage, height).unwrap()
}

/// Storage whose state record writes can be made to fail.
#[derive(Clone)]
struct FailingState {
    inner: InMemoryStorage,
    fail: Arc<AtomicBool>,
}

impl Storage for FailingState {
    fn get(&self, path: &str) -> tlog::Result<Option<Vec<u8>>> {
        self.inner.get(path)
    }

    fn put(&self, path: &str, value: &[u8]) -> tlog::Result<()> {
        if path == STATE_PATH && self.fail.load(Ordering::SeqCst) {
            return Err(TlogError::Storage("state volume unavailable".into()));
        }
        self.inner.put(path, value)
    }
}

#[test]
fn test_rfc6962_reference_roots() {
    for height in [1u8, 2, 8] {
        let acc = open(InMemoryStorage::new(), height);
        assert_eq!(acc.root_at(0).unwrap(), empty_root());

        for leaf in rfc6962_leaves() {
            acc.append(leaf).unwrap();
        }
        for (i, want) in RFC6962_ROOTS.iter().enumerate() {
            let size = i as u64 + 1;
            assert_eq!(acc.root_at(size).unwrap().to_hex(), *want, "height {height}, size {size}");
        }
        assert_eq!(acc.state().root_hash.to_hex(), RFC6962_ROOTS[7]);
    }
}

#[test]
fn test_single_leaf_root_is_leaf_hash() {
    let acc = open(InMemoryStorage::new(), 8);
    let leaf = hash_leaf(b"only");
    assert_eq!(acc.append(leaf).unwrap(), 0);
    assert_eq!(acc.root_at(1).unwrap(), leaf);
    assert!(acc.inclusion_proof(0, 1).unwrap().audit_path.is_empty());
}

#[test]
fn test_every_inclusion_and_consistency_proof() {
    let leaves = numbered_leaves(37);
    let acc = open(InMemoryStorage::new(), 2);
    for leaf in &leaves {
        acc.append(*leaf).unwrap();
    }

    let roots: Vec<Hash32> = (0..=37).map(|n| acc.root_at(n).unwrap()).collect();
    for n in 1..=37u64 {
        assert_eq!(roots[n as usize], reference_root(&leaves[..n as usize]), "size {n}");
        for i in 0..n {
            let proof = acc.inclusion_proof(i, n).unwrap();
            verify_inclusion_proof(&proof, &leaves[i as usize], &roots[n as usize])
                .unwrap_or_else(|e| panic!("inclusion {i} in {n}: {e}"));
        }
    }

    for n in 0..=37u64 {
        for m in 0..=n {
            let proof = acc.consistency_proof(m, n).unwrap();
            verify_consistency_proof(&proof, &roots[m as usize], &roots[n as usize])
                .unwrap_or_else(|e| panic!("consistency {m} -> {n}: {e}"));
        }
    }
}

#[test]
fn test_inclusion_of_leaf_3_in_tree_of_8() {
    let leaves = rfc6962_leaves();
    let acc = open(InMemoryStorage::new(), 8);
    for leaf in &leaves {
        acc.append(*leaf).unwrap();
    }

    let proof = acc.inclusion_proof(3, 8).unwrap();
    assert_eq!(proof.audit_path.len(), 3);

    let root8 = acc.root_at(8).unwrap();
    let root7 = acc.root_at(7).unwrap();
    assert_eq!(root8.to_hex(), RFC6962_ROOTS[7]);
    assert!(verify_inclusion_proof(&proof, &leaves[3], &root8).is_ok());
    assert!(matches!(
        verify_inclusion_proof(&proof, &leaves[3], &root7),
        Err(TlogError::ProofMismatch(_))
    ));
    assert!(verify_inclusion_proof(&proof, &leaves[4], &root8).is_err());
}

#[test]
fn test_last_leaf_of_ragged_tree() {
    let leaves = numbered_leaves(7);
    let acc = open(InMemoryStorage::new(), 8);
    for leaf in &leaves {
        acc.append(*leaf).unwrap();
    }
    let proof = acc.inclusion_proof(6, 7).unwrap();
    assert_eq!(proof.audit_path.len(), 2);
    verify_inclusion_proof(&proof, &leaves[6], &acc.root_at(7).unwrap()).unwrap();
}

#[test]
fn test_monotonic_prefix_across_canonical_sizes() {
    let sizes = [2u64, 4, 7, 8, 16];
    let leaves = numbered_leaves(16);
    let acc = open(InMemoryStorage::new(), 2);

    let mut roots = Vec::new();
    let mut prefix = Vec::new();
    for (i, leaf) in leaves.iter().enumerate() {
        acc.append(*leaf).unwrap();
        let size = i as u64 + 1;
        if sizes.contains(&size) {
            roots.push((size, acc.state().root_hash));
        }
        if size == 2 {
            prefix = (0..2).map(|j| acc.leaf_hash(j).unwrap()).collect();
        }
    }

    for j in 0..2u64 {
        assert_eq!(acc.leaf_hash(j).unwrap(), prefix[j as usize]);
    }
    for (a, &(m, old_root)) in roots.iter().enumerate() {
        for &(n, new_root) in &roots[a + 1..] {
            let proof = acc.consistency_proof(m, n).unwrap();
            verify_consistency_proof(&proof, &old_root, &new_root)
                .unwrap_or_else(|e| panic!("{m} -> {n}: {e}"));
        }
    }
}

#[test]
fn test_invalid_ranges() {
    let acc = open(InMemoryStorage::new(), 2);
    for leaf in numbered_leaves(5) {
        acc.append(leaf).unwrap();
    }

    assert!(matches!(acc.consistency_proof(4, 3), Err(TlogError::InvalidRange(_))));
    assert!(matches!(acc.consistency_proof(3, 6), Err(TlogError::InvalidRange(_))));
    assert!(matches!(acc.inclusion_proof(5, 5), Err(TlogError::InvalidRange(_))));
    assert!(matches!(acc.inclusion_proof(0, 9), Err(TlogError::InvalidRange(_))));
    assert!(matches!(acc.root_at(6), Err(TlogError::InvalidRange(_))));
    assert!(matches!(acc.leaf_hash(5), Err(TlogError::InvalidRange(_))));
    assert!(matches!(acc.append_batch(&[]), Err(TlogError::InvalidRange(_))));

    // Equal and empty ranges need no hashes.
    assert!(acc.consistency_proof(3, 3).unwrap().proof_hashes.is_empty());
    assert!(acc.consistency_proof(0, 5).unwrap().proof_hashes.is_empty());
}

#[test]
fn test_batch_append_matches_single_appends() {
    let leaves = numbered_leaves(70);
    let single = open(InMemoryStorage::new(), 3);
    for leaf in &leaves {
        single.append(*leaf).unwrap();
    }

    let batched = open(InMemoryStorage::new(), 3);
    let first = batched.append_batch(&leaves[..9]).unwrap();
    assert_eq!(first.first_index, 0);
    let second = batched.append_batch(&leaves[9..]).unwrap();
    assert_eq!(second.first_index, 9);
    assert_eq!(second.state.tree_size, 70);

    assert_eq!(batched.state(), single.state());
    for n in [1u64, 8, 9, 63, 64, 65, 70] {
        assert_eq!(batched.root_at(n).unwrap(), single.root_at(n).unwrap());
    }
}

#[test]
fn test_restart_idempotence_in_memory() {
    let storage = InMemoryStorage::new();
    let leaves = numbered_leaves(20);

    let before: Vec<Hash32> = {
        let acc = open(storage.clone(), 2);
        for leaf in &leaves[..13] {
            acc.append(*leaf).unwrap();
        }
        (0..=13).map(|n| acc.root_at(n).unwrap()).collect()
    };

    let reopened = open(storage.clone(), 2);
    assert_eq!(reopened.size(), 13);
    for (n, root) in before.iter().enumerate() {
        assert_eq!(reopened.root_at(n as u64).unwrap(), *root, "size {n}");
    }

    for leaf in &leaves[13..] {
        reopened.append(*leaf).unwrap();
    }
    assert_eq!(reopened.state().root_hash, reference_root(&leaves));
    let proof = reopened.consistency_proof(13, 20).unwrap();
    verify_consistency_proof(&proof, &before[13], &reopened.root_at(20).unwrap()).unwrap();
}

#[test]
fn test_failed_append_leaves_committed_tree_intact() {
    let inner = InMemoryStorage::new();
    let fail = Arc::new(AtomicBool::new(false));
    let storage = FailingState {
        inner: inner.clone(),
        fail: Arc::clone(&fail),
    };
    let acc = MerkleAccumulator::open(storage.clone(), 1).unwrap();
    let first = hash_leaf(b"first");
    let lost = hash_leaf(b"lost");
    let second = hash_leaf(b"second");
    acc.append(first).unwrap();

    // The full tile for [first, lost] lands, the state record does not.
    fail.store(true, Ordering::SeqCst);
    assert!(matches!(acc.append(lost), Err(TlogError::Storage(_))));
    assert_eq!(acc.size(), 1);
    assert_eq!(acc.root_at(1).unwrap(), first);
    assert!(inner.get("tile/0/000").unwrap().is_some());

    // The uncommitted coordinate is taken over by the next append.
    fail.store(false, Ordering::SeqCst);
    assert_eq!(acc.append(second).unwrap(), 1);
    let tile = inner.get("tile/0/000").unwrap().unwrap();
    assert_eq!(&tile[32..64], &second.0[..]);
    assert_eq!(acc.state().root_hash, reference_root(&[first, second]));
    let proof = acc.inclusion_proof(1, 2).unwrap();
    verify_inclusion_proof(&proof, &second, &acc.state().root_hash).unwrap();

    let reopened = MerkleAccumulator::open(storage, 1).unwrap();
    assert_eq!(reopened.size(), 2);
    assert_eq!(reopened.root_at(2).unwrap(), reference_root(&[first, second]));
    assert_eq!(reopened.leaf_hash(1).unwrap(), second);
}

#[test]
fn test_reopen_with_other_tile_height_fails() {
    let storage = InMemoryStorage::new();
    open(storage.clone(), 4).append(hash_leaf(b"x")).unwrap();
    assert!(matches!(
        MerkleAccumulator::open(storage, 8),
        Err(TlogError::Config(_))
    ));
}

#[test]
fn test_file_backed_tiles_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let leaves = numbered_leaves(300);

    let root = {
        let acc = MerkleAccumulator::open(FileBackedStorage::new(dir.path()).unwrap(), 8).unwrap();
        for leaf in &leaves {
            acc.append(*leaf).unwrap();
        }
        acc.state().root_hash
    };

    for path in ["state", "tile/0/000", "tile/0/001.p/44", "tile/1/000.p/1", "tile/0/000.p/5"] {
        assert!(dir.path().join(path).is_file(), "{path} missing");
    }

    let acc = MerkleAccumulator::open(FileBackedStorage::new(dir.path()).unwrap(), 8).unwrap();
    assert_eq!(acc.size(), 300);
    assert_eq!(acc.root_at(300).unwrap(), root);
    assert_eq!(root, reference_root(&leaves));
    assert_eq!(acc.root_at(256).unwrap(), reference_root(&leaves[..256]));

    let proof = acc.inclusion_proof(299, 300).unwrap();
    verify_inclusion_proof(&proof, &leaves[299], &root).unwrap();
}

#[test]
fn test_tampered_full_tile_breaks_dependent_roots() {
    let storage = InMemoryStorage::new();
    let leaves = numbered_leaves(16);
    let (root3, root16) = {
        let acc = open(storage.clone(), 2);
        for leaf in &leaves {
            acc.append(*leaf).unwrap();
        }
        (acc.root_at(3).unwrap(), acc.root_at(16).unwrap())
    };

    let mut tile = storage.get("tile/0/000").unwrap().unwrap();
    tile[0] ^= 0xff;
    storage.put("tile/0/000", &tile).unwrap();

    match MerkleAccumulator::open(storage, 2) {
        Err(TlogError::CorruptTile { .. }) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(acc) => {
            assert_ne!(acc.root_at(3).unwrap(), root3);
            let proof = acc.inclusion_proof(1, 16).unwrap();
            assert!(verify_inclusion_proof(&proof, &leaves[1], &root16).is_err());
        }
    }
}

#[test]
fn test_tampered_frontier_tile_detected_on_open() {
    let storage = InMemoryStorage::new();
    {
        let acc = open(storage.clone(), 2);
        for leaf in numbered_leaves(5) {
            acc.append(leaf).unwrap();
        }
    }

    let mut tile = storage.get("tile/0/001.p/1").unwrap().unwrap();
    tile[7] ^= 0x01;
    storage.put("tile/0/001.p/1", &tile).unwrap();

    assert!(matches!(
        MerkleAccumulator::open(storage, 2),
        Err(TlogError::CorruptTile { .. })
    ));
}

#[test]
fn test_truncated_tile_is_corrupt() {
    let storage = InMemoryStorage::new();
    let acc = open(storage.clone(), 2);
    for leaf in numbered_leaves(8) {
        acc.append(leaf).unwrap();
    }
    storage.put("tile/0/001", &[0u8; 7]).unwrap();

    assert!(matches!(acc.leaf_hash(5), Err(TlogError::CorruptTile { .. })));
}

#[test]
fn test_concurrent_readers_see_committed_sizes() {
    let leaves = numbered_leaves(200);
    let acc = Arc::new(open(InMemoryStorage::new(), 3));

    std::thread::scope(|s| {
        let writer = Arc::clone(&acc);
        let to_write = &leaves;
        s.spawn(move || {
            for leaf in to_write {
                writer.append(*leaf).unwrap();
            }
        });

        for _ in 0..4 {
            let reader = Arc::clone(&acc);
            let expected = &leaves;
            s.spawn(move || loop {
                let n = reader.size();
                if n > 0 {
                    let root = reader.root_at(n).unwrap();
                    let i = n - 1;
                    assert_eq!(reader.leaf_hash(i).unwrap(), expected[i as usize]);
                    let proof = reader.inclusion_proof(i, n).unwrap();
                    verify_inclusion_proof(&proof, &expected[i as usize], &root).unwrap();
                }
                if n == expected.len() as u64 {
                    break;
                }
            });
        }
    });

    assert_eq!(acc.state().root_hash, reference_root(&leaves));
}

#[test]
fn test_randomized_appends_match_reference() {
    let mut rng = rand::thread_rng();

    for _ in 0..10 {
        let height = rng.gen_range(1..=4u8);
        let count = rng.gen_range(1..=90u64);
        let leaves: Vec<Hash32> = (0..count).map(|_| hash_leaf(&rng.gen::<[u8; 16]>())).collect();

        let storage = InMemoryStorage::new();
        let acc = open(storage.clone(), height);
        let mut i = 0usize;
        while i < leaves.len() {
            let take = rng.gen_range(1..=5usize).min(leaves.len() - i);
            acc.append_batch(&leaves[i..i + take]).unwrap();
            i += take;
        }

        assert_eq!(acc.state().root_hash, reference_root(&leaves), "height {height}, count {count}");

        let n = rng.gen_range(1..=count);
        let m = rng.gen_range(0..=n);
        let idx = rng.gen_range(0..n);
        let root_n = acc.root_at(n).unwrap();
        assert_eq!(root_n, reference_root(&leaves[..n as usize]));

        let reopened = open(storage, height);
        let proof = reopened.inclusion_proof(idx, n).unwrap();
        verify_inclusion_proof(&proof, &leaves[idx as usize], &root_n).unwrap();
        let proof = reopened.consistency_proof(m, n).unwrap();
        verify_consistency_proof(&proof, &reopened.root_at(m).unwrap(), &root_n).unwrap();
    }
}
