mod checkpoint_loop;
mod config;
mod keys;
mod log_exec;
mod state;
mod worker_loop;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;
    let state = Arc::new(AppState::open(cfg)?);

    let head = state.log.tree_head().context("Failed to sign initial tree head")?;
    info!(
        origin = %state.log.origin(),
        tree_size = head.claims.tree_size,
        root = %head.claims.root_hash,
        log_key = %hex::encode(state.log.log_key().as_bytes()),
        "logd: ready"
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(worker_loop::run_worker_loop(state.clone(), cancel.clone()));
    let checkpoints = tokio::spawn(checkpoint_loop::run_checkpoint_loop(state.clone(), cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("logd: shutting down");
    cancel.cancel();

    let (w, c) = tokio::join!(worker, checkpoints);
    for res in [w, c] {
        if let Err(e) = res {
            error!("logd: task ended abnormally: {e:?}");
        }
    }

    // Leave a final checkpoint covering everything registered so far.
    checkpoint_loop::publish_checkpoint(&state).await?;
    info!(tree_size = state.log.size(), "logd: stopped");
    Ok(())
}
