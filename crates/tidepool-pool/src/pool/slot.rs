//! Slot wrapper around one physical connection

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool_core::{SlotId, SlotKind};
use tokio::time::Instant;

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Sitting in the idle set
    Idle,
    /// Lent to a borrower
    InUse,
    /// Flagged unusable; will be destroyed on release
    Invalid,
    /// Removed from the pool and handed to the factory for closing
    Closed,
}

/// The pool's wrapper around one physical connection with metadata
pub struct ConnectionSlot<H> {
    id: SlotId,
    handle: H,
    kind: SlotKind,
    created_at: Instant,
    last_used_at: Instant,
    state: SlotState,
}

impl<H> ConnectionSlot<H> {
    pub(crate) fn new(id: SlotId, handle: H, kind: SlotKind, state: SlotState) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            kind,
            created_at: now,
            last_used_at: now,
            state,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Time since the physical connection was opened
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the slot was last checked in or out
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Whether the slot has outlived `recycle_after`
    pub(crate) fn is_expired(&self, recycle_after: Option<Duration>, now: Instant) -> bool {
        recycle_after.is_some_and(|limit| self.age(now) > limit)
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub(crate) fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

impl<H> fmt::Debug for ConnectionSlot<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish_non_exhaustive()
    }
}
