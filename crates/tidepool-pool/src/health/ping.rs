//! Liveness probe with a deadline
//!
//! Calls the factory's `ping` and measures the round trip. A probe that
//! outlives its timeout is abandoned and reported as `PingError::Timeout`.

use std::time::Duration;

use tidepool_core::ConnectionFactory;
use tokio::time::Instant;

/// Result of a ping operation
pub type PingResult = Result<Duration, PingError>;

/// Error that can occur during a ping operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PingError {
    /// The driver reported the connection as dead
    #[error("Ping failed")]
    Failed,
    /// The probe did not finish in time
    #[error("Ping timed out after {0:?}")]
    Timeout(Duration),
}

/// Probe a handle through its factory, bounded by `timeout`.
///
/// Returns the round-trip time if the driver reports the connection alive.
pub async fn ping_handle<F: ConnectionFactory>(
    factory: &F,
    handle: &mut F::Handle,
    timeout: Duration,
) -> PingResult {
    let start = Instant::now();
    match tokio::time::timeout(timeout, factory.ping(handle)).await {
        Ok(true) => Ok(start.elapsed()),
        Ok(false) => Err(PingError::Failed),
        Err(_) => Err(PingError::Timeout(timeout)),
    }
}
