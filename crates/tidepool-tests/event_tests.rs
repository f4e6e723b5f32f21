//! Event tests
//!
//! Lifecycle events as seen by observers, the broadcast stream and the
//! built-in metrics counters.

#[cfg(test)]
mod event_tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tidepool_pool::{MetricsSnapshot, PoolConfig, PoolEvent, PoolEventKind, PoolMetrics};

    use crate::fixtures::{settle, test_pool};

    /// PoolMetrics subscribed to a pool counts every lifecycle step.
    #[tokio::test]
    async fn test_metrics_track_lifecycle() -> anyhow::Result<()> {
        let (pool, _factory) = test_pool(PoolConfig::new(1, 1))?;
        let metrics = Arc::new(PoolMetrics::new());
        pool.events().subscribe(metrics.clone());

        let core = pool.acquire().await?;
        let overflow = pool.acquire().await?;
        drop(overflow);
        core.invalidate();
        drop(pool.acquire().await?);
        settle().await;

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                connects: 3,
                checkouts: 3,
                checkins: 3,
                invalidations: 1,
                recycles: 0,
                closes: 1,
                waited_checkouts: 0,
                total_wait_ms: 0,
                max_wait_ms: 0,
            }
        );
        Ok(())
    }

    /// A checkout that had to queue reports how long it waited.
    #[tokio::test(start_paused = true)]
    async fn test_queued_checkout_reports_wait() -> anyhow::Result<()> {
        let (pool, _factory) = test_pool(PoolConfig::new(1, 0))?;
        let metrics = Arc::new(PoolMetrics::new());
        pool.events().subscribe(metrics.clone());
        let held = pool.acquire().await?;
        let mut stream = pool.events().stream();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|conn| conn.waited()) }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(held);
        let waited = waiter.await??;
        assert!(waited >= Duration::from_millis(40), "waited {waited:?}");

        let checkout = loop {
            let event = stream.recv().await?;
            if event.kind == PoolEventKind::Checkout {
                break event;
            }
        };
        assert_eq!(checkout.wait_duration, Some(waited));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.waited_checkouts, 1);
        assert!(snapshot.max_wait_ms >= 40);
        assert!(snapshot.mean_wait_ms() >= 40.0);
        Ok(())
    }

    /// Failing and panicking observers are isolated from the pool and from
    /// each other.
    #[tokio::test]
    async fn test_faulty_observers_do_not_break_pool() -> anyhow::Result<()> {
        let (pool, _factory) = test_pool(PoolConfig::new(1, 0))?;
        let seen = Arc::new(AtomicUsize::new(0));

        let failing = pool.events().subscribe(Arc::new(|_: &PoolEvent| -> anyhow::Result<()> {
            anyhow::bail!("exporter unavailable")
        }));
        let panicking = pool.events().subscribe(Arc::new(|event: &PoolEvent| -> anyhow::Result<()> {
            if event.kind == PoolEventKind::Checkout {
                panic!("observer bug");
            }
            Ok(())
        }));
        pool.events().subscribe(Arc::new({
            let seen = seen.clone();
            move |_: &PoolEvent| -> anyhow::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        assert_eq!(pool.events().observer_count(), 3);

        for _ in 0..3 {
            let mut conn = pool.acquire().await?;
            conn.execute("SELECT 1");
        }
        // connect, then three checkout/checkin pairs
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        assert!(pool.events().unsubscribe(failing));
        assert!(pool.events().unsubscribe(panicking));
        assert!(!pool.events().unsubscribe(panicking));
        assert_eq!(pool.events().observer_count(), 1);
        Ok(())
    }

    /// Events serialize in the shape external exporters consume.
    #[tokio::test]
    async fn test_event_json_shape() -> anyhow::Result<()> {
        let (pool, _factory) = test_pool(PoolConfig::new(1, 0))?;
        let mut stream = pool.events().stream();
        drop(pool.acquire().await?);

        let connect = stream.recv().await?;
        let json = serde_json::to_value(&connect)?;
        assert_eq!(json["kind"], "connect");
        assert_eq!(json["slot_id"], 1);
        assert!(json["timestamp"].is_string());
        assert!(json.get("wait_duration").is_none());

        let round_trip: PoolEvent = serde_json::from_value(json)?;
        assert_eq!(round_trip, connect);
        Ok(())
    }
}
