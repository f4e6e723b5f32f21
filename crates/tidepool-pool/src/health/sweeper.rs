//! Background reaping of stale idle slots

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool_core::ConnectionFactory;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::HealthChecker;
use crate::pool::Shared;

/// What a single sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Idle slots retired because they outlived `recycle_after`
    pub recycled: usize,
    /// Idle slots retired because they sat unused past `idle_timeout`
    pub idle_expired: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.recycled + self.idle_expired
    }
}

/// Sweep every `interval` until cancelled or the pool is dropped.
pub(crate) async fn run_sweeper<F: ConnectionFactory>(
    shared: Weak<Shared<F>>,
    health: Arc<HealthChecker>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(interval_ms = interval.as_millis() as u64, "sweeper started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                let report = shared.sweep().await;
                if report.total() > 0 {
                    tracing::debug!(
                        recycled = report.recycled,
                        idle_expired = report.idle_expired,
                        "sweep retired idle slots"
                    );
                }
            }
        }
    }

    health.mark_stopped();
    tracing::debug!("sweeper stopped");
}
