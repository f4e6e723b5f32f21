//! Connection pooling with overflow and fair queueing
//!
//! The pool keeps up to `base_size` core connections and opens up to
//! `max_overflow` temporary ones under load. Once both budgets are used up,
//! callers queue in arrival order until a connection or its capacity is
//! released, or their deadline passes.
//!
//! # Example
//!
//! ```ignore
//! use tidepool_pool::{ConnectionPool, PoolConfig};
//!
//! let config = PoolConfig::new(5, 10)
//!     .with_acquire_timeout_ms(5000)
//!     .with_validate_on_checkout(true);
//!
//! let pool = ConnectionPool::new(config, factory)?;
//! let conn = pool.acquire().await?;
//! // Use connection...
//! // Connection returned to pool on drop
//! ```

mod config;
mod pool;
mod slot;
mod state;
mod stats;


pub use config::{OverflowPolicy, PoolConfig};
pub use pool::{ConnectionPool, PooledConnection, ShutdownReport};
pub use slot::{ConnectionSlot, SlotState};
pub use stats::PoolStats;

pub(crate) use pool::Shared;
