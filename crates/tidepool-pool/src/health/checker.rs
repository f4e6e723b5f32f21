//! Pre-use validation with failure tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::ConnectionFactory;

use super::ping::ping_handle;
use super::sweeper::SweepReport;

/// Validates handles before they are lent out and records sweep activity.
///
/// Validation never fails loudly: a failed or timed-out probe is `false`.
pub struct HealthChecker {
    ping_timeout: Duration,
    sweep_interval: Duration,
    consecutive_failures: AtomicU64,
    total_failures: AtomicU64,
    last_latency: Mutex<Option<Duration>>,
    last_sweep: Mutex<Option<SweepReport>>,
    is_running: AtomicBool,
}

impl HealthChecker {
    /// Create a checker with the given probe timeout and sweep period.
    pub fn new(ping_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            ping_timeout,
            sweep_interval,
            consecutive_failures: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_latency: Mutex::new(None),
            last_sweep: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// Probe `handle`; `true` if it answered within the ping timeout.
    pub async fn validate<F: ConnectionFactory>(&self, factory: &F, handle: &mut F::Handle) -> bool {
        match ping_handle(factory, handle, self.ping_timeout).await {
            Ok(latency) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                *self.last_latency.lock() = Some(latency);
                true
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.total_failures.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(error = %err, consecutive_failures = failures, "connection failed validation");
                false
            }
        }
    }

    /// Get the number of validation failures since the last success.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Get the number of validation failures over the checker's lifetime.
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::SeqCst)
    }

    /// Get the round-trip time of the last successful probe.
    pub fn last_latency(&self) -> Option<Duration> {
        *self.last_latency.lock()
    }

    /// Get the report of the most recent sweep, if any ran.
    pub fn last_sweep(&self) -> Option<SweepReport> {
        *self.last_sweep.lock()
    }

    /// Check if the background sweeper is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub(crate) fn record_sweep(&self, report: SweepReport) {
        *self.last_sweep.lock() = Some(report);
    }

    /// Claim the sweeper slot. False if a sweeper is already running.
    pub(crate) fn try_start(&self) -> bool {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_stopped(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("ping_timeout", &self.ping_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("consecutive_failures", &self.consecutive_failures())
            .field("is_running", &self.is_running())
            .finish()
    }
}
