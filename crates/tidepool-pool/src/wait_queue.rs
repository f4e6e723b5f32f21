//! FIFO queue of callers blocked on a saturated pool
//!
//! Each entry owns the sending half of a oneshot channel, so it resolves
//! exactly once: with a grant from `fulfill`, with `PoolExhausted` from
//! `expire`, with an error from `close_all`, or by being dropped in `cancel`
//! when its receiver is already gone.

use std::collections::VecDeque;
use std::time::Duration;

use tidepool_core::{PoolError, RequestId, SlotKind};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::pool::ConnectionSlot;

/// Capacity handed to a waiter
pub(crate) enum Grant<H> {
    /// A live slot, already registered as in use by the waiter
    Slot(ConnectionSlot<H>),
    /// A reserved credit the waiter turns into a new connection
    Credit(SlotKind),
}

pub(crate) type Resolution<H> = Result<Grant<H>, PoolError>;

struct Waiter<H> {
    request_id: RequestId,
    enqueued_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Resolution<H>>,
}

/// Who received a grant from `WaitQueue::fulfill`
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fulfilled {
    pub(crate) request_id: RequestId,
    pub(crate) waited: Duration,
}

pub(crate) struct WaitQueue<H> {
    entries: VecDeque<Waiter<H>>,
}

impl<H> WaitQueue<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a waiter at the back of the queue
    pub(crate) fn enqueue(
        &mut self,
        request_id: RequestId,
        deadline: Instant,
    ) -> oneshot::Receiver<Resolution<H>> {
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Waiter {
            request_id,
            enqueued_at: Instant::now(),
            deadline,
            tx,
        });
        rx
    }

    /// Hand `grant` to the longest-waiting caller that is still listening.
    ///
    /// Entries whose receiver was dropped are discarded. Entries whose deadline
    /// has already passed are resolved with `PoolExhausted` and skipped. If no
    /// one takes the grant it is given back.
    pub(crate) fn fulfill(
        &mut self,
        mut grant: Grant<H>,
        now: Instant,
    ) -> Result<Fulfilled, Grant<H>> {
        while let Some(waiter) = self.entries.pop_front() {
            let waited = now.saturating_duration_since(waiter.enqueued_at);

            if now >= waiter.deadline {
                let _ = waiter.tx.send(Err(PoolError::PoolExhausted(waited)));
                continue;
            }

            match waiter.tx.send(Ok(grant)) {
                Ok(()) => {
                    return Ok(Fulfilled {
                        request_id: waiter.request_id,
                        waited,
                    });
                }
                Err(returned) => {
                    tracing::trace!(request_id = %waiter.request_id, "skipping cancelled waiter");
                    // We only ever send Ok, so the returned value is our grant.
                    grant = match returned {
                        Ok(grant) => grant,
                        Err(_) => unreachable!("waiter channel returned a value we never sent"),
                    };
                }
            }
        }
        Err(grant)
    }

    /// Remove a waiter whose deadline elapsed and resolve it with `PoolExhausted`.
    ///
    /// Returns false if the entry was already resolved by `fulfill`.
    pub(crate) fn expire(&mut self, request_id: RequestId, now: Instant) -> bool {
        match self.remove(request_id) {
            Some(waiter) => {
                let waited = now.saturating_duration_since(waiter.enqueued_at);
                let _ = waiter.tx.send(Err(PoolError::PoolExhausted(waited)));
                true
            }
            None => false,
        }
    }

    /// Remove a waiter that gave up. Returns false if it was already resolved.
    pub(crate) fn cancel(&mut self, request_id: RequestId) -> bool {
        self.remove(request_id).is_some()
    }

    /// Resolve every waiter with an error, e.g. on shutdown
    pub(crate) fn close_all(&mut self, make_error: impl Fn() -> PoolError) -> usize {
        let count = self.entries.len();
        for waiter in self.entries.drain(..) {
            let _ = waiter.tx.send(Err(make_error()));
        }
        count
    }

    fn remove(&mut self, request_id: RequestId) -> Option<Waiter<H>> {
        // Timed-out waiters are usually near the front.
        let index = self
            .entries
            .iter()
            .position(|waiter| waiter.request_id == request_id)?;
        self.entries.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use tidepool_core::SlotId;

    use super::*;
    use crate::pool::SlotState;

    fn slot(id: u64) -> ConnectionSlot<u64> {
        ConnectionSlot::new(SlotId::new(id), id, SlotKind::Core, SlotState::InUse)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_fulfill_serves_oldest_first() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let mut first = queue.enqueue(RequestId::new(1), far_deadline());
        let mut second = queue.enqueue(RequestId::new(2), far_deadline());
        assert_eq!(queue.len(), 2);

        let served = queue.fulfill(Grant::Slot(slot(10)), Instant::now()).ok().unwrap();
        assert_eq!(served.request_id, RequestId::new(1));
        assert!(matches!(first.try_recv(), Ok(Ok(Grant::Slot(s))) if s.id() == SlotId::new(10)));
        assert!(second.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_fulfill_skips_cancelled_receivers() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let dropped = queue.enqueue(RequestId::new(1), far_deadline());
        let mut live = queue.enqueue(RequestId::new(2), far_deadline());
        drop(dropped);

        let served = queue
            .fulfill(Grant::Credit(SlotKind::Overflow), Instant::now())
            .ok()
            .unwrap();
        assert_eq!(served.request_id, RequestId::new(2));
        assert!(matches!(live.try_recv(), Ok(Ok(Grant::Credit(SlotKind::Overflow)))));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fulfill_returns_grant_when_nobody_listens() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        drop(queue.enqueue(RequestId::new(1), far_deadline()));

        let returned = queue.fulfill(Grant::Slot(slot(3)), Instant::now());
        assert!(matches!(returned, Err(Grant::Slot(s)) if s.id() == SlotId::new(3)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fulfill_resolves_past_deadline_waiters_as_exhausted() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let now = Instant::now();
        let mut late = queue.enqueue(RequestId::new(1), now);
        let mut on_time = queue.enqueue(RequestId::new(2), far_deadline());

        let served = queue.fulfill(Grant::Credit(SlotKind::Core), now).ok().unwrap();
        assert_eq!(served.request_id, RequestId::new(2));
        assert!(matches!(late.try_recv(), Ok(Err(PoolError::PoolExhausted(_)))));
        assert!(matches!(on_time.try_recv(), Ok(Ok(Grant::Credit(SlotKind::Core)))));
    }

    #[tokio::test]
    async fn test_expire_resolves_exactly_once() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let mut rx = queue.enqueue(RequestId::new(7), far_deadline());

        assert!(queue.expire(RequestId::new(7), Instant::now()));
        assert!(!queue.expire(RequestId::new(7), Instant::now()));
        assert!(matches!(rx.try_recv(), Ok(Err(PoolError::PoolExhausted(_)))));

        // Nothing left to fulfill.
        assert!(queue.fulfill(Grant::Credit(SlotKind::Core), Instant::now()).is_err());
    }

    #[tokio::test]
    async fn test_expire_after_fulfill_is_a_no_op() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let mut rx = queue.enqueue(RequestId::new(1), far_deadline());
        assert!(queue.fulfill(Grant::Slot(slot(1)), Instant::now()).is_ok());

        assert!(!queue.expire(RequestId::new(1), Instant::now()));
        assert!(matches!(rx.try_recv(), Ok(Ok(Grant::Slot(_)))));
    }

    #[tokio::test]
    async fn test_cancel_from_middle_preserves_order() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let mut a = queue.enqueue(RequestId::new(1), far_deadline());
        let _b = queue.enqueue(RequestId::new(2), far_deadline());
        let mut c = queue.enqueue(RequestId::new(3), far_deadline());

        assert!(queue.cancel(RequestId::new(2)));
        assert!(!queue.cancel(RequestId::new(2)));

        let now = Instant::now();
        assert_eq!(
            queue.fulfill(Grant::Slot(slot(1)), now).ok().unwrap().request_id,
            RequestId::new(1)
        );
        assert_eq!(
            queue.fulfill(Grant::Slot(slot(2)), now).ok().unwrap().request_id,
            RequestId::new(3)
        );
        assert!(a.try_recv().is_ok());
        assert!(c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_all_resolves_everyone() {
        let mut queue: WaitQueue<u64> = WaitQueue::new();
        let mut a = queue.enqueue(RequestId::new(1), far_deadline());
        let mut b = queue.enqueue(RequestId::new(2), far_deadline());

        assert_eq!(queue.close_all(|| PoolError::ShutdownInProgress), 2);
        assert!(queue.is_empty());
        assert!(matches!(a.try_recv(), Ok(Err(PoolError::ShutdownInProgress))));
        assert!(matches!(b.try_recv(), Ok(Err(PoolError::ShutdownInProgress))));
    }
}
