//! Built-in observer that aggregates event counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::{PoolEvent, PoolEventKind, PoolObserver};

/// Point-in-time copy of `PoolMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connects: u64,
    pub checkouts: u64,
    pub checkins: u64,
    pub invalidations: u64,
    pub recycles: u64,
    pub closes: u64,
    /// Checkouts that had to queue
    pub waited_checkouts: u64,
    pub total_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl MetricsSnapshot {
    /// Mean queueing time of checkouts that had to wait, in milliseconds
    pub fn mean_wait_ms(&self) -> f64 {
        if self.waited_checkouts == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.waited_checkouts as f64
        }
    }
}

/// Lock-free event counters suitable for scraping by a metrics exporter
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connects: AtomicU64,
    checkouts: AtomicU64,
    checkins: AtomicU64,
    invalidations: AtomicU64,
    recycles: AtomicU64,
    closes: AtomicU64,
    waited_checkouts: AtomicU64,
    total_wait_ms: AtomicU64,
    max_wait_ms: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkins: self.checkins.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            waited_checkouts: self.waited_checkouts.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
            max_wait_ms: self.max_wait_ms.load(Ordering::Relaxed),
        }
    }

    fn record_wait(&self, wait_ms: u64) {
        self.waited_checkouts.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.max_wait_ms.fetch_max(wait_ms, Ordering::Relaxed);
    }
}

impl PoolObserver for PoolMetrics {
    fn on_event(&self, event: &PoolEvent) -> anyhow::Result<()> {
        let counter = match event.kind {
            PoolEventKind::Connect => &self.connects,
            PoolEventKind::Checkout => &self.checkouts,
            PoolEventKind::Checkin => &self.checkins,
            PoolEventKind::Invalidate => &self.invalidations,
            PoolEventKind::Recycle => &self.recycles,
            PoolEventKind::Close => &self.closes,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if event.kind == PoolEventKind::Checkout {
            if let Some(wait) = event.wait_duration.filter(|wait| !wait.is_zero()) {
                self.record_wait(wait.as_millis() as u64);
            }
        }
        Ok(())
    }
}
