//! Pool core state: idle set, in-use accounting, capacity credits and waiters
//!
//! Everything here runs under the pool mutex and never awaits. Work that has
//! to happen outside the lock (closing handles, notifying observers) is
//! collected into `Effects` and applied by the caller after unlocking.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tidepool_core::{PoolError, RequestId, Result, SlotId, SlotKind};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::config::{OverflowPolicy, PoolConfig};
use super::slot::{ConnectionSlot, SlotState};
use super::stats::PoolStats;
use crate::events::{PoolEvent, PoolEventKind};
use crate::health::SweepReport;
use crate::wait_queue::{Grant, Resolution, WaitQueue};

/// Bookkeeping for a checked-out slot
#[derive(Debug, Clone, Copy)]
pub(crate) struct Borrow {
    pub(crate) request_id: RequestId,
    pub(crate) kind: SlotKind,
    pub(crate) since: Instant,
}

/// Why a slot left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscardReason {
    Invalidated,
    Recycled,
    IdleTimeout,
    Burst,
    Shrink,
    ClosedIdle,
    Shutdown,
    Untracked,
}

impl DiscardReason {
    pub(crate) fn event_kind(self) -> PoolEventKind {
        match self {
            DiscardReason::Invalidated => PoolEventKind::Invalidate,
            DiscardReason::Recycled | DiscardReason::IdleTimeout => PoolEventKind::Recycle,
            _ => PoolEventKind::Close,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Invalidated => "invalidated",
            DiscardReason::Recycled => "recycled",
            DiscardReason::IdleTimeout => "idle_timeout",
            DiscardReason::Burst => "burst_overflow",
            DiscardReason::Shrink => "shrink",
            DiscardReason::ClosedIdle => "close_idle",
            DiscardReason::Shutdown => "shutdown",
            DiscardReason::Untracked => "untracked",
        }
    }
}

/// Side effects produced under the lock, applied after it is released
pub(crate) struct Effects<H> {
    pub(crate) discarded: Vec<(ConnectionSlot<H>, DiscardReason)>,
    pub(crate) events: Vec<PoolEvent>,
}

impl<H> Effects<H> {
    pub(crate) fn new() -> Self {
        Self {
            discarded: Vec::new(),
            events: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.discarded.is_empty() && self.events.is_empty()
    }
}

/// Outcome of the admission step of a checkout
pub(crate) enum Checkout<H> {
    /// An idle slot, now registered as in use
    Ready(ConnectionSlot<H>),
    /// A reserved credit; the caller opens a connection outside the lock
    Open(SlotKind),
    /// The pool is saturated; the caller waits on the receiver
    Wait(oneshot::Receiver<Resolution<H>>),
}

pub(crate) struct PoolState<H> {
    base_size: usize,
    max_overflow: usize,
    overflow_policy: OverflowPolicy,
    recycle_after: Option<Duration>,
    idle_timeout: Option<Duration>,
    idle: VecDeque<ConnectionSlot<H>>,
    in_use: HashMap<SlotId, Borrow>,
    /// Core slots alive or reserved for an in-flight open
    core_count: usize,
    /// Overflow slots alive or reserved for an in-flight open
    overflow_count: usize,
    waiters: WaitQueue<H>,
    shutting_down: bool,
    next_slot_id: u64,
    next_request_id: u64,
}

impl<H> PoolState<H> {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            base_size: config.base_size(),
            max_overflow: config.max_overflow(),
            overflow_policy: config.overflow_policy(),
            recycle_after: config.recycle_after(),
            idle_timeout: config.idle_timeout(),
            idle: VecDeque::new(),
            in_use: HashMap::new(),
            core_count: 0,
            overflow_count: 0,
            waiters: WaitQueue::new(),
            shutting_down: false,
            next_slot_id: 1,
            next_request_id: 1,
        }
    }

    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn allocate_slot_id(&mut self) -> SlotId {
        let id = SlotId::new(self.next_slot_id);
        self.next_slot_id += 1;
        id
    }

    /// Admission: idle slot, new core credit, new overflow credit, or queue.
    ///
    /// Once anyone is queued, newcomers queue behind them so that a saturated
    /// pool serves strictly in arrival order.
    pub(crate) fn begin_checkout(
        &mut self,
        request_id: RequestId,
        deadline: Instant,
        now: Instant,
        effects: &mut Effects<H>,
    ) -> Result<Checkout<H>> {
        if self.shutting_down {
            return Err(PoolError::ShutdownInProgress);
        }

        if self.waiters.is_empty() {
            while let Some(mut slot) = self.idle.pop_front() {
                if slot.is_expired(self.recycle_after, now) {
                    self.retire(slot, DiscardReason::Recycled, now, effects);
                    continue;
                }
                slot.set_state(SlotState::InUse);
                slot.touch();
                self.in_use.insert(
                    slot.id(),
                    Borrow {
                        request_id,
                        kind: slot.kind(),
                        since: now,
                    },
                );
                self.check_invariants();
                return Ok(Checkout::Ready(slot));
            }

            if self.core_count < self.base_size {
                self.core_count += 1;
                self.check_invariants();
                return Ok(Checkout::Open(SlotKind::Core));
            }

            if self.overflow_count < self.max_overflow {
                self.overflow_count += 1;
                self.check_invariants();
                return Ok(Checkout::Open(SlotKind::Overflow));
            }
        }

        tracing::debug!(
            request_id = %request_id,
            queued = self.waiters.len(),
            "pool saturated, queueing checkout"
        );
        Ok(Checkout::Wait(self.waiters.enqueue(request_id, deadline)))
    }

    /// Register a freshly opened connection for the borrower that reserved its credit.
    ///
    /// During shutdown the credit is released and the handle given back for closing.
    pub(crate) fn register_opened(
        &mut self,
        handle: H,
        kind: SlotKind,
        request_id: RequestId,
        now: Instant,
    ) -> std::result::Result<ConnectionSlot<H>, H> {
        if self.shutting_down {
            self.free_credit(kind, now);
            return Err(handle);
        }

        let id = self.allocate_slot_id();
        self.in_use.insert(
            id,
            Borrow {
                request_id,
                kind,
                since: now,
            },
        );
        self.check_invariants();
        Ok(ConnectionSlot::new(id, handle, kind, SlotState::InUse))
    }

    /// Reserve a core credit for warm-up, if the core budget is not yet used up
    pub(crate) fn reserve_core(&mut self) -> Result<Option<SlotKind>> {
        if self.shutting_down {
            return Err(PoolError::ShutdownInProgress);
        }
        if self.core_count < self.base_size {
            self.core_count += 1;
            return Ok(Some(SlotKind::Core));
        }
        Ok(None)
    }

    /// Add a freshly opened connection to the pool without a borrower.
    ///
    /// Goes to the oldest waiter if there is one, otherwise to the idle set.
    pub(crate) fn admit_idle(
        &mut self,
        handle: H,
        kind: SlotKind,
        now: Instant,
    ) -> std::result::Result<SlotId, H> {
        if self.shutting_down {
            self.free_credit(kind, now);
            return Err(handle);
        }

        let id = self.allocate_slot_id();
        let slot = ConnectionSlot::new(id, handle, kind, SlotState::Idle);
        if let Some(mut slot) = self.try_hand_off(slot, now) {
            slot.set_state(SlotState::Idle);
            self.idle.push_back(slot);
        }
        self.check_invariants();
        Ok(id)
    }

    /// Return a slot from its borrower
    pub(crate) fn check_in(
        &mut self,
        slot: ConnectionSlot<H>,
        valid: bool,
        now: Instant,
        effects: &mut Effects<H>,
    ) {
        let Some(borrow) = self.in_use.remove(&slot.id()) else {
            tracing::warn!(slot_id = %slot.id(), "ignoring release of a slot that is not checked out");
            let mut slot = slot;
            slot.set_state(SlotState::Closed);
            effects
                .events
                .push(PoolEvent::new(PoolEventKind::Close, slot.id()));
            effects.discarded.push((slot, DiscardReason::Untracked));
            return;
        };

        tracing::debug!(
            slot_id = %slot.id(),
            request_id = %borrow.request_id,
            kind = %borrow.kind,
            held_ms = now.saturating_duration_since(borrow.since).as_millis() as u64,
            valid,
            "checkin"
        );
        effects
            .events
            .push(PoolEvent::new(PoolEventKind::Checkin, slot.id()));
        self.put_back(slot, valid, now, effects);
    }

    /// Give back a grant that reached a waiter who stopped listening
    pub(crate) fn reclaim(&mut self, grant: Grant<H>, now: Instant, effects: &mut Effects<H>) {
        match grant {
            Grant::Slot(slot) => {
                if self.in_use.remove(&slot.id()).is_some() {
                    self.put_back(slot, true, now, effects);
                } else {
                    effects.discarded.push((slot, DiscardReason::Untracked));
                }
            }
            Grant::Credit(kind) => self.free_credit(kind, now),
        }
    }

    /// Drop a borrowed slot's accounting but keep its credit for the borrower
    pub(crate) fn abandon_borrow(&mut self, slot_id: SlotId) -> Option<SlotKind> {
        self.in_use.remove(&slot_id).map(|borrow| borrow.kind)
    }

    /// Give a reserved credit back to the pool (or straight to a waiter)
    pub(crate) fn free_credit(&mut self, kind: SlotKind, now: Instant) {
        match self.waiters.fulfill(Grant::Credit(kind), now) {
            Ok(fulfilled) => {
                tracing::debug!(
                    request_id = %fulfilled.request_id,
                    kind = %kind,
                    waited_ms = fulfilled.waited.as_millis() as u64,
                    "handed capacity credit to waiter"
                );
            }
            Err(_) => match kind {
                SlotKind::Core => self.core_count = self.core_count.saturating_sub(1),
                SlotKind::Overflow => self.overflow_count = self.overflow_count.saturating_sub(1),
            },
        }
        self.check_invariants();
    }

    fn put_back(
        &mut self,
        mut slot: ConnectionSlot<H>,
        valid: bool,
        now: Instant,
        effects: &mut Effects<H>,
    ) {
        if self.shutting_down {
            self.retire(slot, DiscardReason::Shutdown, now, effects);
            return;
        }
        if !valid {
            slot.set_state(SlotState::Invalid);
            self.retire(slot, DiscardReason::Invalidated, now, effects);
            return;
        }
        if slot.is_expired(self.recycle_after, now) {
            self.retire(slot, DiscardReason::Recycled, now, effects);
            return;
        }

        let burst = slot.kind() == SlotKind::Overflow && self.overflow_policy == OverflowPolicy::Burst;
        match self.try_hand_off(slot, now) {
            None => {}
            Some(slot) if burst => self.retire(slot, DiscardReason::Burst, now, effects),
            Some(mut slot) => {
                slot.set_state(SlotState::Idle);
                slot.touch();
                self.idle.push_back(slot);
            }
        }
        self.check_invariants();
    }

    /// Hand a live slot to the oldest waiter. Returns the slot if nobody took it.
    fn try_hand_off(
        &mut self,
        mut slot: ConnectionSlot<H>,
        now: Instant,
    ) -> Option<ConnectionSlot<H>> {
        if self.waiters.is_empty() {
            return Some(slot);
        }

        let (id, kind) = (slot.id(), slot.kind());
        slot.set_state(SlotState::InUse);
        slot.touch();
        match self.waiters.fulfill(Grant::Slot(slot), now) {
            Ok(fulfilled) => {
                self.in_use.insert(
                    id,
                    Borrow {
                        request_id: fulfilled.request_id,
                        kind,
                        since: now,
                    },
                );
                tracing::debug!(
                    slot_id = %id,
                    request_id = %fulfilled.request_id,
                    waited_ms = fulfilled.waited.as_millis() as u64,
                    "handed slot to waiter"
                );
                None
            }
            Err(Grant::Slot(slot)) => Some(slot),
            Err(Grant::Credit(_)) => unreachable!("fulfill returns the grant it was given"),
        }
    }

    /// Destroy a slot that is no longer tracked as idle or in use, freeing its credit
    fn retire(
        &mut self,
        mut slot: ConnectionSlot<H>,
        reason: DiscardReason,
        now: Instant,
        effects: &mut Effects<H>,
    ) {
        let kind = slot.kind();
        slot.set_state(SlotState::Closed);
        effects
            .events
            .push(PoolEvent::new(reason.event_kind(), slot.id()));
        effects.discarded.push((slot, reason));
        self.free_credit(kind, now);
    }

    /// Retire idle slots past `recycle_after` or idle longer than `idle_timeout`
    pub(crate) fn sweep(&mut self, now: Instant, effects: &mut Effects<H>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());

        for slot in self.idle.drain(..) {
            if slot.is_expired(self.recycle_after, now) {
                expired.push((slot, DiscardReason::Recycled));
            } else if self
                .idle_timeout
                .is_some_and(|timeout| slot.idle_for(now) > timeout)
            {
                expired.push((slot, DiscardReason::IdleTimeout));
            } else {
                kept.push_back(slot);
            }
        }
        self.idle = kept;

        for (slot, reason) in expired {
            match reason {
                DiscardReason::Recycled => report.recycled += 1,
                _ => report.idle_expired += 1,
            }
            self.retire(slot, reason, now, effects);
        }
        report
    }

    /// Close idle slots; with `overflow_only`, only overflow slots
    pub(crate) fn drain_idle(
        &mut self,
        reason: DiscardReason,
        overflow_only: bool,
        now: Instant,
        effects: &mut Effects<H>,
    ) -> usize {
        let (drained, kept): (VecDeque<_>, VecDeque<_>) = self
            .idle
            .drain(..)
            .partition(|slot| !overflow_only || slot.kind() == SlotKind::Overflow);
        self.idle = kept;

        let count = drained.len();
        for slot in drained {
            self.retire(slot, reason, now, effects);
        }
        count
    }

    /// Stop admitting checkouts, reject waiters and drain the idle set.
    ///
    /// Returns the number of waiters rejected.
    pub(crate) fn begin_shutdown(&mut self, now: Instant, effects: &mut Effects<H>) -> usize {
        self.shutting_down = true;
        let rejected = self.waiters.close_all(|| PoolError::ShutdownInProgress);
        self.drain_idle(DiscardReason::Shutdown, false, now, effects);
        rejected
    }

    pub(crate) fn expire_waiter(&mut self, request_id: RequestId, now: Instant) -> bool {
        self.waiters.expire(request_id, now)
    }

    pub(crate) fn cancel_waiter(&mut self, request_id: RequestId) -> bool {
        self.waiters.cancel(request_id)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats::new(
            self.idle.len() + self.in_use.len(),
            self.idle.len(),
            self.in_use.len(),
            self.waiters.len(),
            self.overflow_count,
        )
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    #[cfg(test)]
    pub(crate) fn core_count(&self) -> usize {
        self.core_count
    }

    #[cfg(test)]
    pub(crate) fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    fn check_invariants(&self) {
        debug_assert!(self.core_count <= self.base_size);
        debug_assert!(self.overflow_count <= self.max_overflow);
        debug_assert!(
            self.idle.len() + self.in_use.len() <= self.core_count + self.overflow_count,
            "idle {} + in_use {} exceeds credits {} + {}",
            self.idle.len(),
            self.in_use.len(),
            self.core_count,
            self.overflow_count
        );
    }
}
