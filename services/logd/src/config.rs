use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tlog::{LogConfig, DEFAULT_TILE_HEIGHT, MAX_TILE_HEIGHT};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub signing_key: PathBuf,
    pub trusted_keys: PathBuf,
    pub origin: String,
    pub tile_height: u8,
    pub inbox_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub poll_every: Duration,
    pub checkpoint_every: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key).with_context(|| format!("Missing required env var: {key}"))
        };

        let data_dir = PathBuf::from(get("TLOG_DATA_DIR")?);
        let signing_key = PathBuf::from(get("TLOG_SIGNING_KEY")?);
        let trusted_keys = PathBuf::from(get("TLOG_TRUSTED_KEYS")?);

        let origin = lookup("TLOG_ORIGIN").unwrap_or_else(|| LogConfig::default().origin);
        let tile_height = match lookup("TLOG_TILE_HEIGHT") {
            Some(v) => v
                .parse::<u8>()
                .with_context(|| format!("TLOG_TILE_HEIGHT is not a number: {v}"))?,
            None => DEFAULT_TILE_HEIGHT,
        };
        let inbox_dir = lookup("TLOG_INBOX_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("inbox"));
        let outbox_dir = lookup("TLOG_OUTBOX_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("outbox"));
        let poll_ms: u64 = lookup("TLOG_POLL_MS")
            .map(|v| v.parse().with_context(|| format!("TLOG_POLL_MS is not a number: {v}")))
            .transpose()?
            .unwrap_or(1000);
        let checkpoint_secs: u64 = lookup("TLOG_CHECKPOINT_SECS")
            .map(|v| {
                v.parse()
                    .with_context(|| format!("TLOG_CHECKPOINT_SECS is not a number: {v}"))
            })
            .transpose()?
            .unwrap_or(60);

        // Fail fast on values the engine would reject later
        if origin.trim().is_empty() {
            bail!("TLOG_ORIGIN must not be empty");
        }
        if tile_height == 0 || tile_height > MAX_TILE_HEIGHT {
            bail!("TLOG_TILE_HEIGHT must be within 1..={MAX_TILE_HEIGHT}");
        }
        if poll_ms == 0 {
            bail!("TLOG_POLL_MS must be positive");
        }
        if checkpoint_secs == 0 {
            bail!("TLOG_CHECKPOINT_SECS must be positive");
        }
        if inbox_dir == outbox_dir {
            bail!("TLOG_INBOX_DIR and TLOG_OUTBOX_DIR must differ");
        }

        Ok(Self {
            data_dir,
            signing_key,
            trusted_keys,
            origin,
            tile_height,
            inbox_dir,
            outbox_dir,
            poll_every: Duration::from_millis(poll_ms),
            checkpoint_every: Duration::from_secs(checkpoint_secs),
        })
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.origin.clone()).with_tile_height(self.tile_height)
    }

    /// Where handled inbox files are moved.
    pub fn processed_dir(&self) -> PathBuf {
        self.inbox_dir.join("processed")
    }

    /// Directory the engine persists tiles and state into.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }
}
