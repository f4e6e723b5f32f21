//! Shutdown tests
//!
//! Graceful shutdown: rejecting new and queued checkouts, closing idle
//! connections, waiting out the grace period for borrowed ones.

#[cfg(test)]
mod shutdown_tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use rstest::*;
    use tidepool_core::PoolError;
    use tidepool_pool::{PoolConfig, PoolEventKind, ShutdownReport};
    use tokio::time::Instant;

    use crate::fixtures::{settle, test_pool};

    /// Queued callers are woken with ShutdownInProgress instead of timing out.
    #[rstest]
    #[case(1)]
    #[case(4)]
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_waiters(#[case] waiters: usize) -> anyhow::Result<()> {
        let (pool, factory) = test_pool(PoolConfig::new(1, 0))?;
        let held = pool.acquire().await?;

        let queued: Vec<_> = (0..waiters)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().waiting(), waiters);

        let report = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(
            report,
            ShutdownReport {
                idle_closed: 0,
                waiters_rejected: waiters,
                abandoned: 1,
            }
        );
        for task in queued {
            assert!(matches!(task.await?, Err(PoolError::ShutdownInProgress)));
        }

        drop(held);
        settle().await;
        assert_eq!(factory.closed(), 1, "abandoned connection closes on return");
        assert_eq!(pool.stats().total(), 0);
        Ok(())
    }

    /// Idle connections are closed before shutdown returns.
    #[tokio::test]
    async fn test_shutdown_closes_idle() -> anyhow::Result<()> {
        let (pool, factory) = test_pool(PoolConfig::new(3, 2))?;
        pool.warm_up().await?;
        let mut stream = pool.events().stream();

        let report = pool.shutdown(Duration::ZERO).await;
        assert_eq!(report.idle_closed, 3);
        assert_eq!(report.abandoned, 0);
        assert_eq!(factory.closed(), 3);

        let mut closes = 0;
        while let Ok(event) = stream.try_recv() {
            assert_eq!(event.kind, PoolEventKind::Close);
            closes += 1;
        }
        assert_eq!(closes, 3);
        Ok(())
    }

    /// Borrowed connections returned within the grace period end the wait early.
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_returns() -> anyhow::Result<()> {
        let (pool, factory) = test_pool(PoolConfig::new(2, 0))?;
        let a = pool.acquire().await?;
        let b = pool.acquire().await?;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(a);
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(b);
        });

        let start = Instant::now();
        let report = pool.shutdown(Duration::from_secs(10)).await;
        let elapsed = start.elapsed();

        assert_eq!(report.abandoned, 0);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(1), "waited {elapsed:?}");
        settle().await;
        assert_eq!(factory.live(), 0);
        Ok(())
    }

    /// After shutdown every entry point refuses work.
    #[tokio::test]
    async fn test_operations_after_shutdown() -> anyhow::Result<()> {
        let (pool, _factory) = test_pool(PoolConfig::new(2, 1))?;
        pool.shutdown(Duration::ZERO).await;

        assert!(pool.is_shutting_down());
        assert!(matches!(pool.acquire().await, Err(PoolError::ShutdownInProgress)));
        assert!(matches!(pool.warm_up().await, Err(PoolError::ShutdownInProgress)));
        assert!(!PoolError::ShutdownInProgress.is_recoverable());

        let again = pool.shutdown(Duration::ZERO).await;
        assert_eq!(again, ShutdownReport::default());
        Ok(())
    }

    /// A connection whose open completes after shutdown began is closed, not lent.
    #[tokio::test(start_paused = true)]
    async fn test_open_in_flight_during_shutdown() -> anyhow::Result<()> {
        let (pool, factory) = test_pool(PoolConfig::new(1, 0))?;
        factory.set_open_delay(Duration::from_millis(100));

        let opening = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|conn| conn.id()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = pool.shutdown(Duration::ZERO).await;
        assert_eq!(report.abandoned, 0);

        assert!(matches!(opening.await?, Err(PoolError::ShutdownInProgress)));
        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.stats().total(), 0);
        Ok(())
    }
}
