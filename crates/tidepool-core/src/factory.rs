//! Connection factory trait wrapping the external database driver

use std::sync::Arc;

use async_trait::async_trait;

use crate::ConnectError;

/// Factory trait for creating, probing and destroying physical connections
///
/// The pool calls `open` concurrently from several tasks, so implementations
/// must be safe to share. Handles themselves are never shared: the pool lends
/// each one to at most one borrower at a time.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The driver's connection type
    type Handle: Send + 'static;

    /// Open a new physical connection
    async fn open(&self) -> Result<Self::Handle, ConnectError>;

    /// Close a physical connection
    ///
    /// Default implementation drops the handle.
    async fn close(&self, handle: Self::Handle) {
        drop(handle);
    }

    /// Check that a connection is still alive
    ///
    /// Default implementation always returns true, for drivers without a
    /// cheap liveness probe.
    async fn ping(&self, handle: &mut Self::Handle) -> bool {
        let _ = handle;
        true
    }
}

#[async_trait]
impl<T: ConnectionFactory> ConnectionFactory for Arc<T> {
    type Handle = T::Handle;

    async fn open(&self) -> Result<Self::Handle, ConnectError> {
        (**self).open().await
    }

    async fn close(&self, handle: Self::Handle) {
        (**self).close(handle).await
    }

    async fn ping(&self, handle: &mut Self::Handle) -> bool {
        (**self).ping(handle).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Handle = usize;

        async fn open(&self) -> Result<usize, ConnectError> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_default_ping_and_close() {
        let factory = CountingFactory {
            opened: AtomicUsize::new(0),
        };
        let mut handle = factory.open().await.unwrap();
        assert!(factory.ping(&mut handle).await);
        factory.close(handle).await;
    }

    #[tokio::test]
    async fn test_arc_factory_delegates() {
        let factory = Arc::new(CountingFactory {
            opened: AtomicUsize::new(0),
        });
        assert_eq!(factory.open().await.unwrap(), 0);
        assert_eq!(factory.open().await.unwrap(), 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }
}
