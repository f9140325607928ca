//! Background retention sweeps for the quota governor's durable state.
//!
//! Runs on an interval, structured the same way this codebase's other
//! periodic-flush background tasks are: `tokio::select!` between the
//! interval tick and a shutdown signal, so the sweep task exits cleanly
//! instead of being aborted mid-run.

use crate::config::GovernorConfig;
use chrono::Utc;
use quotaguard_storage::QuotaStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Patterns below this confidence are pruned once they age past the
/// event retention horizon — they stopped being worth keeping around.
const LOW_CONFIDENCE_PATTERN_THRESHOLD: f64 = 0.3;

/// One sweep of every prune operation, using `config`'s retention horizons.
pub fn sweep_once(store: &dyn QuotaStore, config: &GovernorConfig) {
    let now = Utc::now();

    match store.prune_events(now - chrono::Duration::days(config.event_retention_days)) {
        Ok(n) => debug!(pruned = n, "pruned stale events"),
        Err(e) => warn!(error = %e, "failed to prune events"),
    }

    match store.prune_terminal_queue_entries(now - chrono::Duration::seconds(config.queue_retention_days * 86400)) {
        Ok(n) => debug!(pruned = n, "pruned terminal queue entries"),
        Err(e) => warn!(error = %e, "failed to prune queue entries"),
    }

    match store.prune_deactivated_windows(now - chrono::Duration::days(config.window_retention_days)) {
        Ok(n) => debug!(pruned = n, "pruned deactivated windows"),
        Err(e) => warn!(error = %e, "failed to prune deactivated windows"),
    }

    match store.prune_low_confidence_patterns(
        LOW_CONFIDENCE_PATTERN_THRESHOLD,
        now - chrono::Duration::days(config.event_retention_days),
    ) {
        Ok(n) => debug!(pruned = n, "pruned low-confidence patterns"),
        Err(e) => warn!(error = %e, "failed to prune patterns"),
    }
}

/// Runs `sweep_once` on `config.housekeeping_interval_secs` until `shutdown`
/// resolves. All prune failures are logged and swallowed — a failed sweep
/// never takes down the process, and the next tick tries again.
pub async fn run(
    store: Arc<dyn QuotaStore>,
    config: GovernorConfig,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(config.housekeeping_interval_secs));
    info!(interval_secs = config.housekeeping_interval_secs, "housekeeping task started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep_once(store.as_ref(), &config);
            }
            _ = &mut shutdown => {
                info!("housekeeping task shutting down");
                break;
            }
        }
    }
}
