//! Tests for the health module

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tidepool_core::{ConnectError, ConnectionFactory};

use super::*;
use crate::pool::{ConnectionPool, PoolConfig};

/// Factory whose liveness probe can be made to fail or hang
#[derive(Default)]
struct PingFactory {
    opened: AtomicUsize,
    dead: AtomicBool,
    hang: AtomicBool,
}

#[async_trait]
impl ConnectionFactory for PingFactory {
    type Handle = usize;

    async fn open(&self) -> Result<usize, ConnectError> {
        Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn ping(&self, _handle: &mut usize) -> bool {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        !self.dead.load(Ordering::SeqCst)
    }
}

mod ping_tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_handle_success() {
        let factory = PingFactory::default();
        let mut handle = 1;
        let latency = ping_handle(&factory, &mut handle, Duration::from_secs(1)).await;
        assert!(latency.is_ok());
    }

    #[tokio::test]
    async fn test_ping_handle_failed() {
        let factory = PingFactory::default();
        factory.dead.store(true, Ordering::SeqCst);
        let mut handle = 1;
        let result = ping_handle(&factory, &mut handle, Duration::from_secs(1)).await;
        assert_eq!(result, Err(PingError::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_handle_timeout() {
        let factory = PingFactory::default();
        factory.hang.store(true, Ordering::SeqCst);
        let mut handle = 1;
        let result = ping_handle(&factory, &mut handle, Duration::from_millis(250)).await;
        assert_eq!(result, Err(PingError::Timeout(Duration::from_millis(250))));
    }

    #[test]
    fn test_ping_error_display() {
        assert_eq!(PingError::Failed.to_string(), "Ping failed");
        assert!(
            PingError::Timeout(Duration::from_secs(5))
                .to_string()
                .contains("timed out")
        );
    }
}

mod checker_tests {
    use super::*;

    fn checker() -> HealthChecker {
        HealthChecker::new(Duration::from_millis(100), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_validate_tracks_consecutive_failures() {
        let checker = checker();
        let factory = PingFactory::default();
        let mut handle = 1;

        assert!(checker.validate(&factory, &mut handle).await);
        assert!(checker.last_latency().is_some());
        assert_eq!(checker.consecutive_failures(), 0);

        factory.dead.store(true, Ordering::SeqCst);
        assert!(!checker.validate(&factory, &mut handle).await);
        assert!(!checker.validate(&factory, &mut handle).await);
        assert_eq!(checker.consecutive_failures(), 2);
        assert_eq!(checker.total_failures(), 2);

        factory.dead.store(false, Ordering::SeqCst);
        assert!(checker.validate(&factory, &mut handle).await);
        assert_eq!(checker.consecutive_failures(), 0);
        assert_eq!(checker.total_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_timeout_is_failure() {
        let checker = checker();
        let factory = PingFactory::default();
        factory.hang.store(true, Ordering::SeqCst);
        let mut handle = 1;

        assert!(!checker.validate(&factory, &mut handle).await);
        assert_eq!(checker.consecutive_failures(), 1);
    }

    #[test]
    fn test_checker_initial_state() {
        let checker = checker();
        assert_eq!(checker.ping_timeout(), Duration::from_millis(100));
        assert_eq!(checker.sweep_interval(), Duration::from_secs(30));
        assert!(!checker.is_running());
        assert!(checker.last_sweep().is_none());
        assert!(checker.last_latency().is_none());
    }
}

mod sweep_tests {
    use super::*;

    #[test]
    fn test_sweep_report_total() {
        let report = SweepReport {
            recycled: 2,
            idle_expired: 3,
        };
        assert_eq!(report.total(), 5);
        assert_eq!(SweepReport::default().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retires_aged_and_idle_slots() {
        let factory = Arc::new(PingFactory::default());
        let config = PoolConfig::new(3, 0)
            .with_recycle_after_ms(10_000)
            .with_idle_timeout_ms(1_000);
        let pool = ConnectionPool::new(config, factory.clone()).unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);

        // Keep one slot busy so only idle slots are eligible.
        let busy = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let report = pool.sweep().await;
        assert_eq!(report.idle_expired, 1);
        assert_eq!(report.recycled, 0);
        assert_eq!(pool.stats().active(), 1);
        assert_eq!(pool.health().last_sweep(), Some(report));
        drop(busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_stops_on_shutdown() {
        let factory = Arc::new(PingFactory::default());
        let config = PoolConfig::new(2, 0)
            .with_recycle_after_ms(500)
            .with_sweep_interval_ms(1_000);
        let pool = ConnectionPool::new(config, factory.clone()).unwrap();

        drop(pool.acquire().await.unwrap());
        let sweeper = pool.start_sweeper().expect("first sweeper starts");
        assert!(pool.health().is_running());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(pool.stats().idle(), 0);
        assert_eq!(pool.health().last_sweep().map(|r| r.recycled), Some(1));

        pool.shutdown(Duration::from_millis(10)).await;
        sweeper.await.unwrap();
        assert!(!pool.health().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_sweeper_is_not_started() {
        let pool = ConnectionPool::new(
            PoolConfig::new(1, 0).with_sweep_interval_ms(100),
            Arc::new(PingFactory::default()),
        )
        .unwrap();

        let sweeper = pool.start_sweeper().expect("first sweeper starts");
        assert!(pool.start_sweeper().is_none());
        assert!(pool.health().is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(pool.health().is_running());

        pool.shutdown(Duration::ZERO).await;
        sweeper.await.unwrap();
        assert!(!pool.health().is_running());
    }
}
