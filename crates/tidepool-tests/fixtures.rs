//! Core test fixtures for driving the pool against an in-memory driver.
//!
//! `MockFactory` stands in for a database driver. It hands out numbered
//! `MockConnection`s, counts opens and closes, and exposes knobs to make
//! opens fail, hang for a while, or produce connections that fail their
//! liveness probe.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tidepool_tests::fixtures::{MockFactory, test_pool};
//! use tidepool_pool::PoolConfig;
//!
//! #[tokio::test]
//! async fn test_reuse() -> anyhow::Result<()> {
//!     let (pool, factory) = test_pool(PoolConfig::new(2, 1))?;
//!     drop(pool.acquire().await?);
//!     drop(pool.acquire().await?);
//!     assert_eq!(factory.opened(), 1);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tidepool_core::{ConnectError, ConnectionFactory};
use tidepool_pool::{ConnectionPool, PoolConfig};

/// Pool type used throughout the suite
pub type TestPool = ConnectionPool<Arc<MockFactory>>;

/// A fake physical connection
#[derive(Debug)]
pub struct MockConnection {
    /// Sequence number assigned by the factory, starting at 1
    pub id: u64,
    /// Number of queries run through this connection
    pub queries: u64,
}

impl MockConnection {
    /// Pretend to run a statement
    pub fn execute(&mut self, _sql: &str) {
        self.queries += 1;
    }
}

/// In-memory `ConnectionFactory` with failure injection
#[derive(Debug, Default)]
pub struct MockFactory {
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    refusals: AtomicUsize,
    transient_failures: AtomicUsize,
    ping_failures: AtomicUsize,
    dead: AtomicBool,
    open_delay_ms: AtomicU64,
}

impl MockFactory {
    /// Create a factory shared between the pool and the test
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of connections successfully opened
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of connections closed through the factory
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    /// Refuse the next `count` opens with a non-retryable error
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` opens with a retryable error
    pub fn fail_transient(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` liveness probes
    pub fn fail_next_pings(&self, count: usize) {
        self.ping_failures.store(count, Ordering::SeqCst);
    }

    /// Make every liveness probe fail (or pass again)
    pub fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::SeqCst);
    }

    /// Make each open take `delay` before completing
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Handle = MockConnection;

    async fn open(&self) -> Result<MockConnection, ConnectError> {
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if Self::take(&self.refusals) {
            tracing::debug!("mock driver refusing connection");
            return Err(ConnectError::Refused("too many clients".into()));
        }
        if Self::take(&self.transient_failures) {
            tracing::debug!("mock driver failing transiently");
            return Err(ConnectError::Transient("connection reset by peer".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection { id, queries: 0 })
    }

    async fn close(&self, handle: MockConnection) {
        tracing::trace!(id = handle.id, "mock driver closing connection");
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn ping(&self, _handle: &mut MockConnection) -> bool {
        !Self::take(&self.ping_failures) && !self.dead.load(Ordering::SeqCst)
    }
}

/// Build a pool over a fresh `MockFactory`
pub fn test_pool(config: PoolConfig) -> anyhow::Result<(TestPool, Arc<MockFactory>)> {
    initialize_logging();
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(config, factory.clone())?;
    Ok((pool, factory))
}

/// Yield enough times for background close tasks to finish
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Initialize logging for tests if not already initialized
///
/// This sets up tracing with appropriate filters for test output.
pub fn initialize_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tidepool_pool=debug,tidepool_tests=debug"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_factory_failure_knobs() {
        let factory = MockFactory::new();

        factory.refuse_next(1);
        assert!(matches!(factory.open().await, Err(ConnectError::Refused(_))));

        factory.fail_transient(1);
        let err = factory.open().await.unwrap_err();
        assert!(err.is_transient());

        let mut conn = factory.open().await.unwrap();
        assert_eq!(conn.id, 1);
        assert!(factory.ping(&mut conn).await);
        factory.set_dead(true);
        assert!(!factory.ping(&mut conn).await);

        factory.close(conn).await;
        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.live(), 0);
    }
}
