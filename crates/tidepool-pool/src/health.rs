//! Connection health: pre-use validation and idle reaping
//!
//! `HealthChecker` wraps the factory's liveness probe in a timeout and keeps
//! failure counters. The sweeper task periodically retires idle slots that
//! outlived `recycle_after` or sat unused past `idle_timeout`.
//!
//! # Example
//!
//! ```ignore
//! use tidepool_pool::{ConnectionPool, PoolConfig};
//!
//! let config = PoolConfig::new(5, 10)
//!     .with_recycle_after_ms(3_600_000)
//!     .with_sweep_interval_ms(30_000);
//!
//! let pool = ConnectionPool::new(config, factory)?;
//! let sweeper = pool.start_sweeper().expect("no sweeper running yet");
//!
//! // Or run a single pass by hand
//! let report = pool.sweep().await;
//! println!("recycled {}", report.recycled);
//! ```

mod checker;
mod ping;
mod sweeper;

#[cfg(test)]
mod tests;

pub use checker::HealthChecker;
pub use ping::{PingError, PingResult, ping_handle};
pub use sweeper::SweepReport;

pub(crate) use sweeper::run_sweeper;
