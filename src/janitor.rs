// =============================================================================
// TTL Janitor — periodic sweep of expired store rows and engine tables
// =============================================================================
//
// Runs on its own cadence, re-reading `ttl.cleanup_interval_seconds` from
// the live config each tick so a hot-reload takes effect on the next sweep
// without restarting the task. A failing sweep is logged and retried after
// a fixed cool-off rather than propagated — the janitor must never take the
// rest of the process down with it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::EdgeConfig;
use crate::decision::DecisionEngine;
use crate::store::StateStore;

const ERROR_COOLOFF: Duration = Duration::from_secs(10);
const DEBOUNCE_TABLE_MAX_AGE_MS: i64 = 3600 * 1000;

pub async fn run(
    config: Arc<RwLock<EdgeConfig>>,
    store: Arc<StateStore>,
    engine: Arc<DecisionEngine>,
) {
    info!("ttl janitor started");
    loop {
        let interval_secs = config.read().ttl.cleanup_interval_seconds.max(1);

        let now = chrono::Utc::now().timestamp();
        match store.cleanup(now).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "ttl cleanup removed expired tags"),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "ttl cleanup failed, retrying after cool-off");
                tokio::time::sleep(ERROR_COOLOFF).await;
                continue;
            }
        }

        engine.evict_older_than(DEBOUNCE_TABLE_MAX_AGE_MS);

        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
}
