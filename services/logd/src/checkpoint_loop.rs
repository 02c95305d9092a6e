use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::log_exec::with_log_blocking;
use crate::state::SharedState;

/// Signed tree head copy for auditors polling the outbox.
pub const CHECKPOINT_FILE: &str = "checkpoint.sth";

pub async fn run_checkpoint_loop(state: SharedState, cancel: CancellationToken) {
    let mut ticker = interval(state.cfg.checkpoint_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(every_secs = state.cfg.checkpoint_every.as_secs(), "checkpoint_loop: started");

    let mut published = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match publish_checkpoint(&state).await {
            Ok(size) if published != Some(size) => {
                info!(tree_size = size, "checkpoint_loop: published");
                published = Some(size);
            }
            Ok(_) => {}
            Err(e) => warn!("checkpoint_loop: publish failed: {e:?}"),
        }
    }

    info!("checkpoint_loop: stopped");
}

/// Signs (if the tree grew) and exports the current tree head. Returns its size.
pub async fn publish_checkpoint(state: &SharedState) -> Result<u64> {
    let head = with_log_blocking(state.log.clone(), |log| log.tree_head())
        .await
        .context("checkpoint task panicked")?
        .context("Failed to sign tree head")?;

    let path = state.cfg.outbox_dir.join(CHECKPOINT_FILE);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, &head.envelope)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(head.claims.tree_size)
}
