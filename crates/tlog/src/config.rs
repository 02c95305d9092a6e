use serde::Deserialize;

use crate::tiles::{DEFAULT_TILE_HEIGHT, MAX_TILE_HEIGHT};
use crate::{Result, TlogError};

/// Engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log identity embedded in every tree head
    pub origin: String,
    /// Tile height H; tiles hold 2^H hashes
    pub tile_height: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            origin: "localhost/tlog".to_string(),
            tile_height: DEFAULT_TILE_HEIGHT,
        }
    }
}

impl LogConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Self::default()
        }
    }

    pub fn with_tile_height(mut self, tile_height: u8) -> Self {
        self.tile_height = tile_height;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.origin.trim().is_empty() {
            return Err(TlogError::Config("origin must not be empty".into()));
        }
        if self.tile_height == 0 || self.tile_height > MAX_TILE_HEIGHT {
            return Err(TlogError::Config(format!(
                "tile_height must be within 1..={MAX_TILE_HEIGHT}, got {}",
                self.tile_height
            )));
        }
        Ok(())
    }
}
