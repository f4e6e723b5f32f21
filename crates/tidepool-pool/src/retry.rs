//! Retry support for opening connections
//!
//! Transient connect failures are retried with exponential backoff before
//! the pool surfaces a factory error to the caller.
//!
//! # Example
//!
//! ```
//! use tidepool_pool::retry::BackoffStrategy;
//! use std::time::Duration;
//!
//! let backoff = BackoffStrategy::new(50, 2_000);
//! assert_eq!(backoff.calculate_delay(0), Duration::from_millis(50));
//! assert_eq!(backoff.calculate_delay(1), Duration::from_millis(100));
//! ```

mod backoff;


pub use backoff::BackoffStrategy;
