//! Tidepool Core - Core abstractions for the connection pool
//!
//! This crate provides the traits and types that the pool and its
//! consumers share:
//!
//! - `ConnectionFactory` - Trait wrapping the external database driver
//! - `PoolError` / `ConnectError` - Error taxonomy for pool operations
//! - `SlotId`, `RequestId`, `SlotKind` - Identifiers used across the pool

mod error;
mod factory;
mod types;

pub use error::*;
pub use factory::*;
pub use types::*;
