//! Tile layout (C2SP tlog-tiles) over a byte [`Storage`].
//!
//! A tile at tile level `L` and index `N` holds up to `W = 2^H` consecutive
//! node hashes from tree level `L * H`, starting at node `N * W`. Full tiles
//! live at `tile/<L>/<N>` and never change once the committed tree covers
//! them. The right-most tile of each level is partial and lives at
//! `tile/<L>/<N>.p/<width>`; every extension writes a whole new partial tile.
//!
//! `<N>` is written in groups of three decimal digits, every group but the
//! last prefixed with `x`: index 1234067 is `x001/x234/067`.

use tracing::warn;

use crate::storage::Storage;
use crate::types::{Hash32, TreeState};
use crate::{Result, TlogError};

/// Tile height used when none is configured (256 hashes per tile).
pub const DEFAULT_TILE_HEIGHT: u8 = 8;
/// Largest supported tile height.
pub const MAX_TILE_HEIGHT: u8 = 8;

const HASH_SIZE: usize = 32;
pub const STATE_PATH: &str = "state";
pub const CHECKPOINT_PATH: &str = "checkpoint";

/// Coordinates of a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    height: u8,
    level: u8,
    index: u64,
    width: u16,
}

impl Tile {
    pub fn new(height: u8, level: u8, index: u64, width: u16) -> Self {
        debug_assert!(width >= 1 && u32::from(width) <= 1u32 << height);
        Self { height, level, index, width }
    }

    /// The full tile at `(level, index)`.
    pub fn full(height: u8, level: u8, index: u64) -> Self {
        Self::new(height, level, index, 1 << height)
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn is_full(&self) -> bool {
        u32::from(self.width) == 1u32 << self.height
    }

    /// Object path of this tile.
    pub fn path(&self) -> String {
        let mut path = format!("tile/{}/{}", self.level, encode_index(self.index));
        if !self.is_full() {
            path.push_str(&format!(".p/{}", self.width));
        }
        path
    }

    /// Parses a tile path for the given tile height. Only canonical paths are accepted.
    pub fn from_path(height: u8, path: &str) -> Option<Tile> {
        if height == 0 || height > MAX_TILE_HEIGHT {
            return None;
        }
        let rest = path.strip_prefix("tile/")?;
        let (level, rest) = rest.split_once('/')?;
        let level: u8 = level.parse().ok()?;

        let (index_part, width) = match rest.split_once(".p/") {
            Some((index_part, width)) => {
                let width: u16 = width.parse().ok()?;
                if width == 0 || u32::from(width) >= 1u32 << height {
                    return None;
                }
                (index_part, width)
            }
            None => (rest, 1u16 << height),
        };

        let mut index: u64 = 0;
        let groups: Vec<&str> = index_part.split('/').collect();
        for (i, group) in groups.iter().enumerate() {
            let digits = if i + 1 < groups.len() {
                group.strip_prefix('x')?
            } else {
                group
            };
            if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let value: u64 = digits.parse().ok()?;
            index = index.checked_mul(1000)?.checked_add(value)?;
        }

        let tile = Tile::new(height, level, index, width);
        // Rejects leading zero groups and non-canonical numbers.
        (tile.path() == path).then_some(tile)
    }
}

fn encode_index(mut n: u64) -> String {
    let mut path = format!("{:03}", n % 1000);
    n /= 1000;
    while n > 0 {
        path = format!("x{:03}/{}", n % 1000, path);
        n /= 1000;
    }
    path
}

fn decode_hashes(tile: &Tile, bytes: &[u8]) -> Result<Vec<Hash32>> {
    let expected = usize::from(tile.width) * HASH_SIZE;
    if bytes.len() != expected {
        return Err(TlogError::CorruptTile {
            path: tile.path(),
            reason: format!(
                "holds {} bytes, width {} requires {expected}",
                bytes.len(),
                tile.width
            ),
        });
    }
    Ok(bytes
        .chunks_exact(HASH_SIZE)
        .filter_map(Hash32::from_slice)
        .collect())
}

/// Tile-addressed view of a storage backend.
pub struct TileStore<S: Storage> {
    storage: S,
    height: u8,
}

impl<S: Storage> TileStore<S> {
    pub fn new(storage: S, height: u8) -> Result<Self> {
        if height == 0 || height > MAX_TILE_HEIGHT {
            return Err(TlogError::Config(format!(
                "tile height must be within 1..={MAX_TILE_HEIGHT}, got {height}"
            )));
        }
        Ok(Self { storage, height })
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// Hashes per full tile.
    pub fn width(&self) -> u64 {
        1 << self.height
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Full tile at `(level, index)`.
    pub fn read_tile(&self, level: u8, index: u64) -> Result<Option<Vec<Hash32>>> {
        self.read(&Tile::full(self.height, level, index))
    }

    /// Partial tile at `(level, index)` with exactly `width` hashes.
    pub fn read_partial_tile(
        &self,
        level: u8,
        index: u64,
        width: u16,
    ) -> Result<Option<Vec<Hash32>>> {
        if width == 0 || u64::from(width) >= self.width() {
            return Err(TlogError::InvalidRange(format!(
                "partial tile width {width} outside 1..{}",
                self.width()
            )));
        }
        self.read(&Tile::new(self.height, level, index, width))
    }

    /// Writes the whole tile. `hashes` must match the tile width.
    pub fn write_tile(&self, tile: &Tile, hashes: &[Hash32]) -> Result<()> {
        if hashes.len() != usize::from(tile.width) {
            return Err(TlogError::InvalidRange(format!(
                "{} hashes for tile {} of width {}",
                hashes.len(),
                tile.path(),
                tile.width
            )));
        }
        let mut bytes = Vec::with_capacity(hashes.len() * HASH_SIZE);
        for h in hashes {
            bytes.extend_from_slice(&h.0);
        }
        self.storage.put(&tile.path(), &bytes)
    }

    fn read(&self, tile: &Tile) -> Result<Option<Vec<Hash32>>> {
        match self.storage.get(&tile.path())? {
            Some(bytes) => decode_hashes(tile, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// The tile at `(level, index)` as it stands at a committed tree size.
    ///
    /// Returns exactly the hashes that tree size implies. A missing tile or a
    /// width mismatch means the store disagrees with the committed state.
    pub fn tile_at(&self, level: u8, index: u64, tree_size: u64) -> Result<Vec<Hash32>> {
        let shift = u32::from(level) * u32::from(self.height);
        let count = tree_size.checked_shr(shift).unwrap_or(0);
        let start = index.saturating_mul(self.width());
        if count <= start {
            return Err(TlogError::InvalidRange(format!(
                "tile ({level}, {index}) lies beyond tree size {tree_size}"
            )));
        }
        let width = (count - start).min(self.width()) as u16;
        let tile = Tile::new(self.height, level, index, width);

        match self.read(&tile)? {
            Some(hashes) => Ok(hashes),
            None => {
                warn!(path = %tile.path(), tree_size, "tile missing from store");
                Err(TlogError::CorruptTile {
                    path: tile.path(),
                    reason: format!("missing, but tree size {tree_size} requires it"),
                })
            }
        }
    }

    pub fn read_state(&self) -> Result<Option<TreeState>> {
        match self.storage.get(STATE_PATH)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TlogError::Serialization(format!("tree state: {e}"))),
            None => Ok(None),
        }
    }

    pub fn write_state(&self, state: &TreeState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| TlogError::Serialization(e.to_string()))?;
        self.storage.put(STATE_PATH, &bytes)
    }

    /// Latest published signed tree head, as envelope bytes.
    pub fn read_checkpoint(&self) -> Result<Option<Vec<u8>>> {
        self.storage.get(CHECKPOINT_PATH)
    }

    pub fn write_checkpoint(&self, envelope: &[u8]) -> Result<()> {
        self.storage.put(CHECKPOINT_PATH, envelope)
    }
}
