use std::sync::Arc;

use anyhow::{Context, Result};
use tlog::{FileBackedStorage, TransparencyLog};

use crate::config::AppConfig;
use crate::keys::{load_signer, load_trusted_keys};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub cfg: AppConfig,
    pub log: Arc<TransparencyLog<FileBackedStorage>>,
}

impl AppState {
    pub fn open(cfg: AppConfig) -> Result<Self> {
        for dir in [cfg.inbox_dir.clone(), cfg.outbox_dir.clone(), cfg.processed_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let signer = load_signer(&cfg.signing_key)?;
        let submitters = load_trusted_keys(&cfg.trusted_keys)?;
        let storage = FileBackedStorage::new(cfg.log_dir()).context("Failed to init storage")?;
        let log = TransparencyLog::open(storage, cfg.log_config(), signer, submitters)
            .context("Failed to open transparency log")?;

        Ok(Self {
            cfg,
            log: Arc::new(log),
        })
    }
}
