use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tlog::{Hash32, Registration, Storage, TlogError, TransparencyLog};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::log_exec::with_log_blocking;
use crate::state::SharedState;

/// Statements are dropped into the inbox as `<name>.cose`.
const STATEMENT_EXT: &str = "cose";
/// `<name>.pending` next to a statement holds the leaf index it was appended at.
const PENDING_EXT: &str = "pending";
const REISSUE_ATTEMPTS: u32 = 3;
const REISSUE_BACKOFF: Duration = Duration::from_millis(200);

/// Human-readable companion to a `.receipt` file.
#[derive(Debug, Serialize)]
struct ReceiptSummary<'a> {
    leaf_index: u64,
    statement_digest: Hash32,
    tree_size: u64,
    root_hash: Hash32,
    origin: &'a str,
    timestamp: u64,
}

pub async fn run_worker_loop(state: SharedState, cancel: CancellationToken) {
    info!(inbox = %state.cfg.inbox_dir.display(), "worker_loop: started");

    loop {
        match drain_inbox(&state).await {
            Ok(0) => {}
            Ok(n) => info!(processed = n, tree_size = state.log.size(), "worker_loop: inbox drained"),
            Err(e) => warn!("worker_loop: inbox scan failed: {e:?}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(state.cfg.poll_every) => {}
        }
    }

    info!("worker_loop: stopped");
}

/// Handles every statement currently in the inbox, oldest name first.
///
/// Returns how many were looked at; statements held back for a retry count too.
pub async fn drain_inbox(state: &SharedState) -> Result<usize> {
    let mut pending = list_statements(&state.cfg.inbox_dir).await?;
    pending.sort();
    for path in &pending {
        process_one(state, path).await?;
    }
    Ok(pending.len())
}

async fn list_statements(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read inbox {}", dir.display()))?;

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_statement = path.extension().and_then(|e| e.to_str()) == Some(STATEMENT_EXT);
        if is_statement && entry.file_type().await?.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

/// What became of one inbox statement.
#[derive(Debug)]
enum Outcome {
    Registered(Registration),
    /// The leaf is in the log but has no receipt yet.
    Pending { leaf_index: u64, reason: String },
    /// Nothing was decided; try again on the next pass.
    Retry(TlogError),
    Rejected(TlogError),
}

/// Storage trouble says nothing about the statement itself.
fn is_retryable(e: &TlogError) -> bool {
    matches!(
        e,
        TlogError::Storage(_)
            | TlogError::Io(_)
            | TlogError::Serialization(_)
            | TlogError::CorruptTile { .. }
    )
}

fn pending_marker(path: &Path) -> PathBuf {
    path.with_extension(PENDING_EXT)
}

async fn read_pending(marker: &Path) -> Result<Option<u64>> {
    match tokio::fs::read_to_string(marker).await {
        Ok(text) => {
            let leaf_index = text
                .trim()
                .parse()
                .with_context(|| format!("Bad leaf index in {}", marker.display()))?;
            Ok(Some(leaf_index))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", marker.display())),
    }
}

async fn process_one(state: &SharedState, path: &Path) -> Result<()> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("statement file name is not valid UTF-8")?
        .to_string();
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let marker = pending_marker(path);
    let appended = read_pending(&marker).await?;

    let outcome = with_log_blocking(state.log.clone(), move |log| {
        register_or_reissue(log, &bytes, appended)
    })
    .await
    .context("registration task panicked")?;

    let outbox = &state.cfg.outbox_dir;
    match outcome {
        Outcome::Registered(reg) => {
            let summary = ReceiptSummary {
                leaf_index: reg.leaf_index,
                statement_digest: reg.statement_digest,
                tree_size: reg.tree_head.claims.tree_size,
                root_hash: reg.tree_head.claims.root_hash,
                origin: &reg.tree_head.claims.origin,
                timestamp: reg.tree_head.claims.timestamp,
            };
            let json = serde_json::to_vec_pretty(&summary)?;
            write_output(&outbox.join(format!("{name}.receipt")), &reg.receipt).await?;
            write_output(&outbox.join(format!("{name}.json")), &json).await?;
            info!(file = %name, leaf_index = reg.leaf_index, tree_size = summary.tree_size, "worker: registered");
        }
        Outcome::Pending { leaf_index, reason } => {
            // Keep the statement; the next pass re-issues instead of appending again.
            write_output(&marker, leaf_index.to_string().as_bytes()).await?;
            warn!(file = %name, leaf_index, reason = %reason, "worker: appended without receipt, will re-issue");
            return Ok(());
        }
        Outcome::Retry(e) => {
            if matches!(e, TlogError::CorruptTile { .. }) {
                error!(file = %name, error = %e, "worker: log storage is corrupt, operator action required");
            } else {
                warn!(file = %name, error = %e, "worker: storage failure, will retry");
            }
            return Ok(());
        }
        Outcome::Rejected(e) => {
            warn!(file = %name, error = %e, "worker: statement rejected");
            write_output(&outbox.join(format!("{name}.error")), e.to_string().as_bytes()).await?;
        }
    }

    let done = state.cfg.processed_dir().join(path.file_name().unwrap_or_default());
    tokio::fs::rename(path, &done)
        .await
        .with_context(|| format!("Failed to move {} to {}", path.display(), done.display()))?;
    if appended.is_some() {
        tokio::fs::remove_file(&marker)
            .await
            .with_context(|| format!("Failed to remove {}", marker.display()))?;
    }
    Ok(())
}

/// Registers `statement`, or re-issues the receipt for `appended` when an
/// earlier pass already put it in the log. A leaf that landed without a
/// receipt is never appended a second time.
fn register_or_reissue<S: Storage>(
    log: &TransparencyLog<S>,
    statement: &[u8],
    appended: Option<u64>,
) -> Outcome {
    let (leaf_index, mut reason) = match appended {
        Some(leaf_index) => (leaf_index, String::from("receipt pending from an earlier pass")),
        None => match log.register(statement) {
            Ok(reg) => return Outcome::Registered(reg),
            Err(TlogError::Unreceipted { leaf_index, reason }) => {
                warn!(leaf_index, reason = %reason, "worker: registered without receipt");
                (leaf_index, reason)
            }
            Err(e) if is_retryable(&e) => return Outcome::Retry(e),
            Err(e) => return Outcome::Rejected(e),
        },
    };

    for attempt in 1..=REISSUE_ATTEMPTS {
        if appended.is_none() || attempt > 1 {
            std::thread::sleep(REISSUE_BACKOFF * attempt);
        }
        match log.issue_receipt(leaf_index, statement) {
            Ok(reg) => {
                info!(leaf_index, attempt, "worker: receipt re-issued");
                return Outcome::Registered(reg);
            }
            Err(e) if is_retryable(&e) || matches!(e, TlogError::Unreceipted { .. }) => {
                warn!(leaf_index, attempt, error = %e, "worker: receipt re-issue failed");
                reason = e.to_string();
            }
            Err(e) => return Outcome::Rejected(e),
        }
    }
    Outcome::Pending { leaf_index, reason }
}

/// Write-then-rename so readers of the outbox never see partial files.
async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
