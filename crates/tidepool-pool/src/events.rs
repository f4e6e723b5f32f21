//! Lifecycle events emitted by the pool
//!
//! Every connect, checkout, checkin and destruction is published to the
//! pool's `EventHub`, which fans out to registered observers and to a
//! broadcast stream for metrics exporters.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidepool_pool::events::PoolMetrics;
//!
//! let metrics = Arc::new(PoolMetrics::new());
//! pool.events().subscribe(metrics.clone());
//!
//! let mut stream = pool.events().stream();
//! while let Ok(event) = stream.recv().await {
//!     println!("{:?} {}", event.kind, event.slot_id);
//! }
//! ```

mod hub;
mod metrics;


use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidepool_core::SlotId;

pub use hub::{EventHub, PoolObserver, SubscriptionId};
pub use metrics::{MetricsSnapshot, PoolMetrics};

/// Kind of lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEventKind {
    /// A new physical connection was opened
    Connect,
    /// A slot was handed to a caller
    Checkout,
    /// A caller returned a slot
    Checkin,
    /// A slot was destroyed because it failed validation or was flagged by its borrower
    Invalidate,
    /// A slot was retired because of its age or idle time
    Recycle,
    /// A healthy slot was closed (overflow shrink, shutdown, close_idle)
    Close,
}

/// A single lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub slot_id: SlotId,
    pub timestamp: DateTime<Utc>,
    /// Time spent queued before a checkout was fulfilled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_duration: Option<Duration>,
}

impl PoolEvent {
    pub fn new(kind: PoolEventKind, slot_id: SlotId) -> Self {
        Self {
            kind,
            slot_id,
            timestamp: Utc::now(),
            wait_duration: None,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_duration = Some(wait);
        self
    }
}
