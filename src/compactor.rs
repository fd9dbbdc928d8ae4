use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Compact once at least `threshold` events were appended since the last
/// rewrite. Returns whether a compaction ran.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appended} appends");
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
        metrics::gauge!(crate::observability::LISTINGS_ACTIVE).set(engine.listing_count() as f64);
    }
}
