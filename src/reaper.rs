use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::calendar;
use crate::engine::{Engine, EngineError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that expires stale pending appointments every `period`.
pub async fn run_expiry_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = engine.expire_stale_appointments(calendar::now_ms()).await {
            // the next tick retries whatever was left pending
            warn!(error = %e, "expiry sweep failed");
        }
    }
}

/// Compact once the WAL has grown by `threshold` appends. Returns whether it did.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that keeps the WAL short.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!(error = %e, "WAL compaction failed");
        }
    }
}
