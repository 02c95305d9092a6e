//! Append-only Merkle accumulator backed by tiles.
//!
//! The writer keeps the frontier in memory: the roots of the complete
//! subtrees ("peaks") that partition `[0, size)`, plus the contents of the
//! right-most partial tile at every tile level. Appends are staged on a copy
//! of the frontier, the touched tiles are written, and the tree state record
//! is written last. That record is the commit point; readers only ever see
//! committed sizes.
//!
//! Readers never touch the frontier. They capture the committed size and read
//! node hashes from tiles, so `root_at`, inclusion and consistency proofs run
//! concurrently with an append.

use std::mem;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::crypto::{empty_root, hash_internal};
use crate::merkle::{self, NodeReader};
use crate::storage::Storage;
use crate::tiles::{Tile, TileStore};
use crate::types::{AppendOutcome, ConsistencyProof, Hash32, InclusionProof, TreeState};
use crate::{Result, TlogError};

#[derive(Clone, Copy, Debug)]
struct Peak {
    level: u8,
    hash: Hash32,
}

#[derive(Clone, Debug)]
struct Frontier {
    size: u64,
    /// Complete subtree roots, left to right, strictly decreasing in level
    peaks: Vec<Peak>,
    /// Right-most partial tile contents per tile level
    partial: Vec<Vec<Hash32>>,
}

/// Tile writes produced by one staged append.
#[derive(Default)]
struct TileWrites {
    full: Vec<(Tile, Vec<Hash32>)>,
    dirty_levels: Vec<u8>,
}

impl Frontier {
    fn empty() -> Self {
        Self {
            size: 0,
            peaks: Vec::new(),
            partial: Vec::new(),
        }
    }

    fn root(&self) -> Hash32 {
        let mut iter = self.peaks.iter().rev();
        let Some(last) = iter.next() else {
            return empty_root();
        };
        let mut hash = last.hash;
        for peak in iter {
            hash = hash_internal(&peak.hash, &hash);
        }
        hash
    }

    fn push(&mut self, leaf: Hash32, height: u8, writes: &mut TileWrites) {
        let index = self.size;
        let mut level = 0u8;
        let mut hash = leaf;
        self.record(level, index, hash, height, writes);

        // Each trailing one bit of `index` completes a subtree.
        while let Some(peak) = self.peaks.last().copied() {
            if peak.level != level {
                break;
            }
            self.peaks.pop();
            hash = hash_internal(&peak.hash, &hash);
            level += 1;
            self.record(level, index >> level, hash, height, writes);
        }

        self.peaks.push(Peak { level, hash });
        self.size += 1;
    }

    /// Stores a newly sealed node if its level is a tile boundary.
    fn record(&mut self, level: u8, index: u64, hash: Hash32, height: u8, writes: &mut TileWrites) {
        if level % height != 0 {
            return;
        }
        let tile_level = level / height;
        let slot = usize::from(tile_level);
        if self.partial.len() <= slot {
            self.partial.resize_with(slot + 1, Vec::new);
        }

        let width = 1u64 << height;
        let buf = &mut self.partial[slot];
        debug_assert_eq!(buf.len() as u64, index % width, "tile buffer out of step");
        buf.push(hash);

        if !writes.dirty_levels.contains(&tile_level) {
            writes.dirty_levels.push(tile_level);
        }
        if buf.len() as u64 == width {
            let full = mem::take(buf);
            writes
                .full
                .push((Tile::full(height, tile_level, index / width), full));
        }
    }
}

/// Committed-size view used by every read path.
struct Snapshot<'a, S: Storage> {
    tiles: &'a TileStore<S>,
    committed: u64,
}

impl<S: Storage> NodeReader for Snapshot<'_, S> {
    fn node(&self, level: u8, index: u64) -> Result<Hash32> {
        let end = index
            .checked_add(1)
            .and_then(|n| n.checked_mul(1u64 << level));
        if end.map_or(true, |end| end > self.committed) {
            return Err(TlogError::InvalidRange(format!(
                "node ({level}, {index}) is not complete at tree size {}",
                self.committed
            )));
        }

        let height = self.tiles.height();
        let tile_level = level / height;
        let base = tile_level * height;
        let span = 1u64 << (level - base);
        let first = index * span;
        let width = self.tiles.width();

        let hashes = self
            .tiles
            .tile_at(tile_level, first / width, self.committed)?;
        let offset = (first % width) as usize;
        let mut row: Vec<Hash32> = hashes
            .get(offset..offset + span as usize)
            .ok_or_else(|| TlogError::CorruptTile {
                path: Tile::full(height, tile_level, first / width).path(),
                reason: format!("too short for node ({level}, {index})"),
            })?
            .to_vec();

        while row.len() > 1 {
            row = row
                .chunks_exact(2)
                .map(|pair| hash_internal(&pair[0], &pair[1]))
                .collect();
        }
        Ok(row[0])
    }
}

/// Merkle accumulator: exactly one writer, many concurrent readers.
pub struct MerkleAccumulator<S: Storage> {
    tiles: TileStore<S>,
    writer: Mutex<Frontier>,
    committed: RwLock<TreeState>,
}

impl<S: Storage> MerkleAccumulator<S> {
    /// Opens the accumulator persisted in `storage`, or starts an empty one.
    ///
    /// The frontier is rebuilt from the recorded tree size and the right-most
    /// tiles of each level. The recomputed root must match the recorded one.
    pub fn open(storage: S, tile_height: u8) -> Result<Self> {
        let tiles = TileStore::new(storage, tile_height)?;

        let Some(state) = tiles.read_state()? else {
            let state = TreeState {
                tree_size: 0,
                root_hash: empty_root(),
                tile_height,
            };
            tiles.write_state(&state)?;
            info!(tile_height, "accumulator: initialized empty tree");
            return Ok(Self {
                tiles,
                writer: Mutex::new(Frontier::empty()),
                committed: RwLock::new(state),
            });
        };

        if state.tile_height != tile_height {
            return Err(TlogError::Config(format!(
                "log was written with tile height {}, configured {tile_height}",
                state.tile_height
            )));
        }

        let frontier = Self::rebuild_frontier(&tiles, state.tree_size)?;
        let root = frontier.root();
        if root != state.root_hash {
            warn!(tree_size = state.tree_size, %root, recorded = %state.root_hash, "accumulator: root mismatch on open");
            return Err(TlogError::CorruptTile {
                path: "tile/".into(),
                reason: format!(
                    "tiles yield root {root} at size {}, recorded root is {}",
                    state.tree_size, state.root_hash
                ),
            });
        }

        info!(tree_size = state.tree_size, root = %root, "accumulator: reopened from tiles");
        Ok(Self {
            tiles,
            writer: Mutex::new(frontier),
            committed: RwLock::new(state),
        })
    }

    fn rebuild_frontier(tiles: &TileStore<S>, size: u64) -> Result<Frontier> {
        let snapshot = Snapshot { tiles, committed: size };

        let mut peaks = Vec::new();
        let mut start = 0u64;
        for level in (0..64u8).rev() {
            let span = 1u64 << level;
            if size & span != 0 {
                peaks.push(Peak {
                    level,
                    hash: snapshot.node(level, start >> level)?,
                });
                start += span;
            }
        }

        let height = tiles.height();
        let width = tiles.width();
        let mut partial = Vec::new();
        for tile_level in 0u8.. {
            let shift = u32::from(tile_level) * u32::from(height);
            let count = size.checked_shr(shift).unwrap_or(0);
            if count == 0 {
                break;
            }
            let used = count % width;
            if used == 0 {
                partial.push(Vec::new());
            } else {
                partial.push(tiles.tile_at(tile_level, count / width, size)?);
            }
        }

        Ok(Frontier { size, peaks, partial })
    }

    pub fn tile_store(&self) -> &TileStore<S> {
        &self.tiles
    }

    /// Latest committed state.
    pub fn state(&self) -> TreeState {
        *self.committed.read()
    }

    pub fn size(&self) -> u64 {
        self.committed.read().tree_size
    }

    /// Appends one leaf and returns its index.
    pub fn append(&self, leaf: Hash32) -> Result<u64> {
        Ok(self.append_batch(&[leaf])?.first_index)
    }

    /// Appends `leaves` in order under a single writer acquisition.
    ///
    /// Either every leaf is committed or none is: the state record is only
    /// written after all tiles are stored.
    ///
    /// A tile at a coordinate past the committed size is not part of the log
    /// until the state record covering it lands. If an append fails before
    /// that, the next append rewrites such tiles with its own leaves. Readers
    /// never address them, since every read is bounded by a committed size.
    pub fn append_batch(&self, leaves: &[Hash32]) -> Result<AppendOutcome> {
        if leaves.is_empty() {
            return Err(TlogError::InvalidRange("empty append batch".into()));
        }

        let mut writer = self.writer.lock();
        let height = self.tiles.height();
        let width = self.tiles.width();

        let mut staged = writer.clone();
        let mut writes = TileWrites::default();
        for leaf in leaves {
            staged.push(*leaf, height, &mut writes);
        }

        for (tile, hashes) in &writes.full {
            self.tiles.write_tile(tile, hashes)?;
        }
        for &tile_level in &writes.dirty_levels {
            let buf = &staged.partial[usize::from(tile_level)];
            if buf.is_empty() {
                continue;
            }
            let shift = u32::from(tile_level) * u32::from(height);
            let count = staged.size >> shift;
            let tile = Tile::new(height, tile_level, count / width, buf.len() as u16);
            self.tiles.write_tile(&tile, buf)?;
        }

        let state = TreeState {
            tree_size: staged.size,
            root_hash: staged.root(),
            tile_height: height,
        };
        self.tiles.write_state(&state)?;

        let first_index = writer.size;
        *writer = staged;
        *self.committed.write() = state;

        debug!(
            first_index,
            count = leaves.len(),
            tree_size = state.tree_size,
            full_tiles = writes.full.len(),
            "accumulator: committed"
        );
        Ok(AppendOutcome { first_index, state })
    }

    fn snapshot(&self) -> Snapshot<'_, S> {
        Snapshot {
            tiles: &self.tiles,
            committed: self.size(),
        }
    }

    fn check_size(&self, snapshot: &Snapshot<'_, S>, size: u64) -> Result<()> {
        if size > snapshot.committed {
            return Err(TlogError::InvalidRange(format!(
                "tree size {size} exceeds current size {}",
                snapshot.committed
            )));
        }
        Ok(())
    }

    /// Root hash of the tree at `size`, recomputed from tiles.
    pub fn root_at(&self, size: u64) -> Result<Hash32> {
        let snapshot = self.snapshot();
        self.check_size(&snapshot, size)?;
        merkle::root(&snapshot, size)
    }

    /// Committed leaf hash at `index`.
    pub fn leaf_hash(&self, index: u64) -> Result<Hash32> {
        self.snapshot().node(0, index)
    }

    pub fn inclusion_proof(&self, leaf_index: u64, tree_size: u64) -> Result<InclusionProof> {
        let snapshot = self.snapshot();
        self.check_size(&snapshot, tree_size)?;
        let audit_path = merkle::inclusion_path(&snapshot, leaf_index, tree_size)?;
        Ok(InclusionProof {
            leaf_index,
            tree_size,
            audit_path,
        })
    }

    pub fn consistency_proof(&self, old_size: u64, new_size: u64) -> Result<ConsistencyProof> {
        let snapshot = self.snapshot();
        self.check_size(&snapshot, new_size)?;
        let proof_hashes = merkle::consistency_path(&snapshot, old_size, new_size)?;
        Ok(ConsistencyProof {
            old_size,
            new_size,
            proof_hashes,
        })
    }
}
