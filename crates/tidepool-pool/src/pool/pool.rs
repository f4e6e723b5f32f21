//! Connection pool implementation

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidepool_core::{ConnectionFactory, PoolError, RequestId, Result, SlotId, SlotKind};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::PoolConfig;
use super::slot::{ConnectionSlot, SlotState};
use super::state::{Checkout, DiscardReason, Effects, PoolState};
use super::stats::PoolStats;
use crate::events::{EventHub, PoolEvent, PoolEventKind};
use crate::health::{HealthChecker, SweepReport, run_sweeper};
use crate::wait_queue::{Grant, Resolution};

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Idle connections closed immediately
    pub idle_closed: usize,
    /// Queued callers woken with `ShutdownInProgress`
    pub waiters_rejected: usize,
    /// Connections still checked out when the grace period ended; closed on return
    pub abandoned: usize,
}

/// State shared by every handle to one pool and by its borrowed connections
pub(crate) struct Shared<F: ConnectionFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    state: Mutex<PoolState<F::Handle>>,
    events: EventHub,
    health: Arc<HealthChecker>,
    /// Signalled when the last borrowed slot comes back during shutdown
    drained: Notify,
    sweeper: CancellationToken,
}

impl<F: ConnectionFactory> Shared<F> {
    /// Run `f` under the pool lock and hand back the effects it produced
    fn locked<R>(
        &self,
        f: impl FnOnce(&mut PoolState<F::Handle>, Instant, &mut Effects<F::Handle>) -> R,
    ) -> (R, Effects<F::Handle>) {
        let mut effects = Effects::new();
        let (result, drained) = {
            let mut state = self.state.lock();
            let result = f(&mut state, Instant::now(), &mut effects);
            (result, state.is_shutting_down() && state.in_use_count() == 0)
        };
        if drained {
            self.drained.notify_waiters();
        }
        (result, effects)
    }

    /// Run `f` under the pool lock, then apply its effects without awaiting
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut PoolState<F::Handle>, Instant, &mut Effects<F::Handle>) -> R,
    ) -> R {
        let (result, effects) = self.locked(f);
        self.apply(effects);
        result
    }

    /// Emit events and close discarded handles in a background task.
    ///
    /// Used from synchronous paths such as `Drop`. Without a runtime the
    /// handles are dropped instead of closed.
    fn apply(&self, effects: Effects<F::Handle>) {
        if effects.is_empty() {
            return;
        }
        let Effects { discarded, events } = effects;
        self.events.emit_all(events);
        if discarded.is_empty() {
            return;
        }

        let handles = log_discarded(discarded);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let factory = self.factory.clone();
                runtime.spawn(async move {
                    for handle in handles {
                        factory.close(handle).await;
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    count = handles.len(),
                    "no async runtime to close discarded connections, dropping them"
                );
            }
        }
    }

    /// Emit events and close discarded handles before returning
    async fn apply_now(&self, effects: Effects<F::Handle>) {
        let Effects { discarded, events } = effects;
        self.events.emit_all(events);
        for handle in log_discarded(discarded) {
            self.factory.close(handle).await;
        }
    }

    fn check_in(&self, slot: ConnectionSlot<F::Handle>, valid: bool) {
        self.mutate(move |state, now, effects| {
            state.check_in(slot, valid, now, effects)
        });
    }

    fn return_credit(&self, kind: SlotKind) {
        self.mutate(move |state, now, _| state.free_credit(kind, now));
    }

    /// Open a physical connection, retrying transient failures with backoff.
    ///
    /// Neither the open nor the retries run past `deadline`. An open cut
    /// short by the deadline is `PoolExhausted`, measured from `started`.
    async fn open_with_retry(&self, started: Instant, deadline: Instant) -> Result<F::Handle> {
        let mut attempt = 0u32;
        loop {
            let Ok(result) = tokio::time::timeout_at(deadline, self.factory.open()).await else {
                tracing::warn!(attempts = attempt + 1, "deadline reached while opening connection");
                return Err(PoolError::PoolExhausted(
                    deadline.saturating_duration_since(started),
                ));
            };
            let err = match result {
                Ok(handle) => return Ok(handle),
                Err(err) => err,
            };

            let delay = self.config.connect_backoff().calculate_delay(attempt);
            let retry = err.is_transient()
                && attempt < self.config.connect_retries()
                && Instant::now() + delay < deadline;
            if !retry {
                tracing::warn!(error = %err, attempts = attempt + 1, "failed to open connection");
                return Err(PoolError::Factory(err));
            }

            tracing::debug!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying connection open"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub(crate) async fn sweep(&self) -> SweepReport {
        let (report, effects) = self.locked(|state, now, effects| state.sweep(now, effects));
        self.apply_now(effects).await;
        self.health.record_sweep(report);
        report
    }
}

impl<F: ConnectionFactory> Drop for Shared<F> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

fn log_discarded<H>(discarded: Vec<(ConnectionSlot<H>, DiscardReason)>) -> Vec<H> {
    discarded
        .into_iter()
        .map(|(slot, reason)| {
            match reason {
                DiscardReason::Invalidated | DiscardReason::Untracked => {
                    tracing::warn!(slot_id = %slot.id(), kind = %slot.kind(), reason = reason.as_str(), "discarding connection");
                }
                _ => {
                    tracing::debug!(slot_id = %slot.id(), kind = %slot.kind(), reason = reason.as_str(), "closing connection");
                }
            }
            slot.into_handle()
        })
        .collect()
}

/// Returns a reserved credit to the pool unless the open it guards succeeded
struct CreditGuard<'a, F: ConnectionFactory> {
    shared: &'a Shared<F>,
    kind: SlotKind,
    armed: bool,
}

impl<'a, F: ConnectionFactory> CreditGuard<'a, F> {
    fn new(shared: &'a Shared<F>, kind: SlotKind) -> Self {
        Self {
            shared,
            kind,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for CreditGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.return_credit(self.kind);
        }
    }
}

/// A queued checkout. Dropping it before resolution leaves the queue cleanly.
struct Waiting<'a, F: ConnectionFactory> {
    shared: &'a Shared<F>,
    request_id: RequestId,
    enqueued_at: Instant,
    rx: oneshot::Receiver<Resolution<F::Handle>>,
    resolved: bool,
}

impl<F: ConnectionFactory> Waiting<'_, F> {
    async fn resolve(mut self, deadline: Instant) -> Result<Grant<F::Handle>> {
        let resolution = match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(PoolError::Cancelled),
            Err(_) => {
                // Whoever gets the lock first decides: a grant sent before
                // this point wins over the timeout.
                self.shared
                    .state
                    .lock()
                    .expire_waiter(self.request_id, Instant::now());
                match self.rx.try_recv() {
                    Ok(resolution) => resolution,
                    Err(_) => Err(PoolError::PoolExhausted(
                        deadline.saturating_duration_since(self.enqueued_at),
                    )),
                }
            }
        };
        self.resolved = true;
        resolution
    }
}

impl<F: ConnectionFactory> Drop for Waiting<'_, F> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let request_id = self.request_id;
        let rx = &mut self.rx;
        self.shared.mutate(move |state, now, effects| {
            if state.cancel_waiter(request_id) {
                return;
            }
            if let Ok(Ok(grant)) = rx.try_recv() {
                tracing::debug!(request_id = %request_id, "returning grant from abandoned checkout");
                state.reclaim(grant, now, effects);
            }
        });
    }
}

/// A connection pool with a core budget, an overflow budget and a FIFO wait queue
///
/// `ConnectionPool` is a cheap, cloneable handle; clones share one pool.
/// Connections are handed out as `PooledConnection` guards and go back to
/// the pool when the guard is dropped.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a new pool. No connection is opened until first use or `warm_up`.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self> {
        config.validate()?;
        let health = Arc::new(HealthChecker::new(
            config.ping_timeout(),
            config.sweep_interval(),
        ));
        Ok(Self {
            shared: Arc::new(Shared {
                factory: Arc::new(factory),
                state: Mutex::new(PoolState::new(&config)),
                events: EventHub::new(),
                health,
                drained: Notify::new(),
                sweeper: CancellationToken::new(),
                config,
            }),
        })
    }

    /// Get a connection, waiting at most the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        self.acquire_timeout(self.shared.config.acquire_timeout())
            .await
    }

    /// Get a connection, waiting at most `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<F>> {
        self.acquire_until(Instant::now() + timeout).await
    }

    /// Get a connection, waiting until `deadline` at the latest
    ///
    /// This will:
    /// 1. Queue behind earlier callers if anyone is already waiting
    /// 2. Reuse an idle connection, retiring any past `recycle_after`
    /// 3. Open a core connection while under `base_size`
    /// 4. Open an overflow connection while under `max_overflow`
    /// 5. Otherwise wait for a released connection or freed capacity
    ///
    /// With `validate_on_checkout`, a connection that fails its probe is
    /// destroyed and a fresh one opened in its place, up to
    /// `checkout_attempts` times.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<PooledConnection<F>> {
        let shared = &self.shared;
        let started = Instant::now();
        let (admission, request_id) = shared.mutate(move |state, now, effects| {
            let request_id = state.next_request_id();
            (
                state.begin_checkout(request_id, deadline, now, effects),
                request_id,
            )
        });

        let (mut grant, waited) = match admission? {
            Checkout::Ready(slot) => (Grant::Slot(slot), Duration::ZERO),
            Checkout::Open(kind) => (Grant::Credit(kind), Duration::ZERO),
            Checkout::Wait(rx) => {
                let waiting = Waiting {
                    shared,
                    request_id,
                    enqueued_at: started,
                    rx,
                    resolved: false,
                };
                let grant = waiting.resolve(deadline).await?;
                (grant, started.elapsed())
            }
        };

        let mut attempts = 0u32;
        loop {
            let slot = match grant {
                Grant::Slot(slot) => slot,
                Grant::Credit(kind) => {
                    self.open_slot(kind, request_id, started, deadline).await?
                }
            };
            let mut conn = PooledConnection::new(shared.clone(), slot, waited);

            if !shared.config.validate_on_checkout() {
                return Ok(self.hand_out(conn));
            }

            // A probe abandoned midway leaves the handle in an unknown state.
            conn.valid = false;
            if shared.health.validate(&*shared.factory, &mut *conn).await {
                conn.valid = true;
                return Ok(self.hand_out(conn));
            }

            attempts += 1;
            let kind = self.discard_failed(conn)?;
            if attempts >= shared.config.checkout_attempts() {
                shared.return_credit(kind);
                return Err(PoolError::InvalidSlot(format!(
                    "no connection passed validation after {attempts} attempts"
                )));
            }
            grant = Grant::Credit(kind);
        }
    }

    fn hand_out(&self, conn: PooledConnection<F>) -> PooledConnection<F> {
        tracing::debug!(
            slot_id = %conn.id(),
            kind = %conn.kind(),
            waited_ms = conn.waited.as_millis() as u64,
            "checkout"
        );
        self.shared
            .events
            .emit(PoolEvent::new(PoolEventKind::Checkout, conn.id()).with_wait(conn.waited));
        conn
    }

    /// Turn a reserved credit into a registered, in-use slot
    async fn open_slot(
        &self,
        kind: SlotKind,
        request_id: RequestId,
        started: Instant,
        deadline: Instant,
    ) -> Result<ConnectionSlot<F::Handle>> {
        let shared = &self.shared;
        let credit = CreditGuard::new(shared, kind);
        let handle = shared.open_with_retry(started, deadline).await?;
        credit.disarm();

        let registered = shared.mutate(move |state, now, _| {
            state.register_opened(handle, kind, request_id, now)
        });
        match registered {
            Ok(slot) => {
                tracing::debug!(slot_id = %slot.id(), kind = %kind, "opened connection");
                shared
                    .events
                    .emit(PoolEvent::new(PoolEventKind::Connect, slot.id()));
                Ok(slot)
            }
            Err(handle) => {
                shared.factory.close(handle).await;
                Err(PoolError::ShutdownInProgress)
            }
        }
    }

    /// Destroy a borrowed slot that failed validation, keeping its credit
    fn discard_failed(&self, mut conn: PooledConnection<F>) -> Result<SlotKind> {
        let Some(mut slot) = conn.slot.take() else {
            return Err(PoolError::InvalidSlot("connection already taken".to_string()));
        };
        slot.set_state(SlotState::Invalid);
        self.shared
            .mutate(move |state, _, effects| {
                let kind = state.abandon_borrow(slot.id());
                effects
                    .events
                    .push(PoolEvent::new(PoolEventKind::Invalidate, slot.id()));
                effects.discarded.push((slot, DiscardReason::Invalidated));
                kind
            })
            .ok_or_else(|| PoolError::InvalidSlot("slot is no longer checked out".to_string()))
    }

    /// Return a connection, flagging whether it is still usable.
    ///
    /// Equivalent to dropping the guard, after `mark_invalid` when `valid`
    /// is false.
    pub fn release(&self, mut conn: PooledConnection<F>, valid: bool) {
        if !valid {
            conn.mark_invalid();
        }
        drop(conn);
    }

    /// Open core connections until `base_size` exist. Returns how many were opened.
    #[tracing::instrument(skip(self), fields(base_size = self.shared.config.base_size()))]
    pub async fn warm_up(&self) -> Result<usize> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + shared.config.acquire_timeout();
        let mut opened = 0;

        while let Some(kind) = shared.mutate(|state, _, _| state.reserve_core())? {
            let credit = CreditGuard::new(shared, kind);
            let handle = shared.open_with_retry(started, deadline).await?;
            credit.disarm();

            let admitted =
                shared.mutate(move |state, now, _| state.admit_idle(handle, kind, now));
            match admitted {
                Ok(slot_id) => {
                    shared
                        .events
                        .emit(PoolEvent::new(PoolEventKind::Connect, slot_id));
                    opened += 1;
                }
                Err(handle) => {
                    shared.factory.close(handle).await;
                    return Err(PoolError::ShutdownInProgress);
                }
            }
        }

        tracing::debug!(opened, "pool warmed up");
        Ok(opened)
    }

    /// Close idle overflow connections. Returns how many were closed.
    pub async fn shrink(&self) -> usize {
        self.drain_idle(DiscardReason::Shrink, true).await
    }

    /// Close all idle connections in the pool. Returns how many were closed.
    pub async fn close_idle(&self) -> usize {
        self.drain_idle(DiscardReason::ClosedIdle, false).await
    }

    async fn drain_idle(&self, reason: DiscardReason, overflow_only: bool) -> usize {
        let (count, effects) = self.shared.locked(move |state, now, effects| {
            state.drain_idle(reason, overflow_only, now, effects)
        });
        self.shared.apply_now(effects).await;
        count
    }

    /// Retire stale idle connections now
    pub async fn sweep(&self) -> SweepReport {
        self.shared.sweep().await
    }

    /// Spawn the background sweeper.
    ///
    /// It runs every `sweep_interval` until shutdown or until the last
    /// handle to the pool is dropped. Returns `None` if a sweeper is
    /// already running for this pool.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        let shared = &self.shared;
        if !shared.health.try_start() {
            tracing::debug!("sweeper already running");
            return None;
        }
        Some(tokio::spawn(run_sweeper(
            Arc::downgrade(shared),
            shared.health.clone(),
            shared.config.sweep_interval(),
            shared.sweeper.child_token(),
        )))
    }

    /// Stop the pool.
    ///
    /// New checkouts fail with `ShutdownInProgress`, queued callers are woken
    /// with the same error, and idle connections are closed. Borrowed
    /// connections get `grace` to come back; any still out after that are
    /// closed whenever they are returned.
    #[tracing::instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let shared = &self.shared;
        shared.sweeper.cancel();

        let ((waiters_rejected, idle_closed), effects) =
            shared.locked(|state, now, effects| {
                let rejected = state.begin_shutdown(now, effects);
                (rejected, effects.discarded.len())
            });
        shared.apply_now(effects).await;

        let deadline = Instant::now() + grace;
        loop {
            let notified = shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shared.state.lock().in_use_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let abandoned = shared.state.lock().in_use_count();
        if abandoned > 0 {
            tracing::warn!(
                abandoned,
                "grace period elapsed, remaining connections will close on return"
            );
        }
        tracing::debug!(idle_closed, waiters_rejected, "pool shut down");

        ShutdownReport {
            idle_closed,
            waiters_rejected,
            abandoned,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().is_shutting_down()
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        self.shared.state.lock().stats()
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Get the event hub for subscribing to lifecycle events
    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    /// Get the health checker used for validation and sweeping
    pub fn health(&self) -> &HealthChecker {
        &self.shared.health
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    #[cfg(test)]
    pub(crate) fn credits(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.core_count(), state.overflow_count())
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A connection borrowed from the pool
///
/// When dropped, the connection is automatically returned to the pool.
/// Call `mark_invalid` first if the connection should be destroyed instead.
pub struct PooledConnection<F: ConnectionFactory> {
    slot: Option<ConnectionSlot<F::Handle>>,
    shared: Arc<Shared<F>>,
    waited: Duration,
    valid: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(shared: Arc<Shared<F>>, slot: ConnectionSlot<F::Handle>, waited: Duration) -> Self {
        Self {
            slot: Some(slot),
            shared,
            waited,
            valid: true,
        }
    }

    fn slot(&self) -> &ConnectionSlot<F::Handle> {
        self.slot.as_ref().expect("connection taken")
    }

    pub fn id(&self) -> SlotId {
        self.slot().id()
    }

    pub fn kind(&self) -> SlotKind {
        self.slot().kind()
    }

    pub fn created_at(&self) -> Instant {
        self.slot().created_at()
    }

    /// Get how long the checkout spent queued
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Flag the connection as broken so it is destroyed on release
    pub fn mark_invalid(&mut self) {
        self.valid = false;
        if let Some(slot) = self.slot.as_mut() {
            slot.set_state(SlotState::Invalid);
        }
    }

    /// Return the connection to the pool
    pub fn release(self) {
        drop(self);
    }

    /// Destroy the connection instead of returning it for reuse
    pub fn invalidate(mut self) {
        self.mark_invalid();
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Handle;

    fn deref(&self) -> &Self::Target {
        self.slot().handle()
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slot.as_mut().expect("connection taken").handle_mut()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.shared.check_in(slot, self.valid);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PooledConnection");
        if let Some(slot) = &self.slot {
            debug.field("id", &slot.id()).field("kind", &slot.kind());
        }
        debug
            .field("waited", &self.waited)
            .field("valid", &self.valid)
            .finish()
    }
}
