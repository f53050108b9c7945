//! Background retention sweeps.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Hub;

/// Spawn the retention sweeper. Ticks are coalesced — at most one sweep is
/// in flight, and a sweep that overruns its slot delays the next tick
/// instead of bursting. Errors are logged and never affect live traffic.
pub fn spawn(hub: Arc<Hub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hub.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick fires immediately; skip it.

        loop {
            ticker.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            match hub.history.sweep(now_ms).await {
                Ok((ttl_deleted, cap_deleted)) => {
                    if ttl_deleted + cap_deleted > 0 {
                        tracing::debug!(ttl_deleted, cap_deleted, "retention sweep");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "retention sweep failed");
                }
            }
        }
    })
}
