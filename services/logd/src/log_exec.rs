use std::sync::Arc;

/// Runs an engine call on the blocking pool; the engine does synchronous file I/O.
pub async fn with_log_blocking<L, R, F>(log: Arc<L>, f: F) -> Result<R, tokio::task::JoinError>
where
    L: Send + Sync + 'static,
    R: Send + 'static,
    F: FnOnce(&L) -> R + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&log)).await
}
