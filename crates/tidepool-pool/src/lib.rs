//! Tidepool Pool - Connection pooling with overflow, fair queueing and health checks
//!
//! This crate manages the lifecycle of database connections produced by a
//! `ConnectionFactory`: lazy creation, bounded overflow, strict FIFO waiting,
//! validation, recycling and graceful shutdown.

pub mod events;
pub mod health;
pub mod pool;
pub mod retry;
mod wait_queue;

pub use events::{
    EventHub, MetricsSnapshot, PoolEvent, PoolEventKind, PoolMetrics, PoolObserver,
    SubscriptionId,
};
pub use health::{HealthChecker, PingError, PingResult, SweepReport, ping_handle};
pub use pool::{
    ConnectionPool, ConnectionSlot, OverflowPolicy, PoolConfig, PoolStats, PooledConnection,
    ShutdownReport, SlotState,
};
pub use retry::BackoffStrategy;
pub use tidepool_core::{
    ConnectError, ConnectionFactory, PoolError, RequestId, Result, SlotId, SlotKind,
};
