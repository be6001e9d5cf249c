//! Out-of-band completion path between a camera backend and the device.
//!
//! Backends report finished buffers from their own threads through a
//! [`CompletionHandler`]. The handler only touches the [`CompletionQueue`],
//! never the device state lock, so completions may arrive while an ioctl
//! handler is running. The device drains the queue into its buffer table on
//! the next query or dequeue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::backend::{CompletedBuffer, CompletionHandler, FrameStatus};

/// Counting readiness signal owned by an open handle.
///
/// Behaves like an `eventfd` in semaphore mode: every completed buffer adds
/// one, every successful dequeue consumes one, and the handle is readable
/// while the count is non-zero.
#[derive(Debug, Default)]
pub struct EventCounter {
    count: Mutex<u64>,
    readable: Condvar,
}

impl EventCounter {
    /// Create a counter with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one pending event.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_add(1);
        self.readable.notify_all();
    }

    /// Consume one pending event. Returns `false` if none was pending.
    pub fn consume(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Number of pending events.
    pub fn pending(&self) -> u64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether at least one event is pending.
    pub fn is_readable(&self) -> bool {
        self.pending() > 0
    }

    /// Wait up to `timeout` for an event. Returns readiness after the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .readable
            .wait_timeout_while(count, timeout, |count| *count == 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count > 0
    }

    /// Drop every pending event.
    pub fn reset(&self) {
        self.set(0);
    }

    /// Replace the pending count.
    pub fn set(&self, pending: u64) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = pending;
        if pending > 0 {
            self.readable.notify_all();
        }
    }
}

#[derive(Default)]
struct Pending {
    buffers: VecDeque<CompletedBuffer>,
    generation: u64,
    waiters: usize,
    listener: Option<Arc<EventCounter>>,
}

/// Queue of completed buffers waiting to be drained into the buffer table.
///
/// Every push or wake-up bumps a generation counter; a blocked dequeue
/// records the generation before releasing the device lock and sleeps until
/// it changes, so no completion between the check and the wait is lost.
#[derive(Default)]
pub struct CompletionQueue {
    pending: Mutex<Pending>,
    changed: Condvar,
}

impl CompletionQueue {
    /// Create an empty queue with no listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completion. Cancelled buffers are dropped here.
    pub fn push(&self, completion: CompletedBuffer) {
        if completion.status == FrameStatus::Cancelled {
            trace!(index = completion.index, "dropping cancelled completion");
            return;
        }

        let mut pending = self.lock();
        pending.buffers.push_back(completion);
        pending.generation = pending.generation.wrapping_add(1);
        if let Some(listener) = &pending.listener {
            listener.signal();
        }
        drop(pending);
        self.changed.notify_all();
    }

    /// Take every pending completion, together with the generation observed
    /// under the same lock.
    pub fn drain(&self) -> (Vec<CompletedBuffer>, u64) {
        let mut pending = self.lock();
        let buffers = pending.buffers.drain(..).collect();
        (buffers, pending.generation)
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether completions are waiting to be drained.
    pub fn has_pending(&self) -> bool {
        !self.lock().buffers.is_empty()
    }

    /// Block until the generation differs from `since`.
    pub fn wait_for_completion(&self, since: u64) {
        let mut pending = self.lock();
        pending.waiters += 1;
        let mut pending = self
            .changed
            .wait_while(pending, |pending| pending.generation == since)
            .unwrap_or_else(PoisonError::into_inner);
        pending.waiters -= 1;
    }

    /// Number of callers blocked in [`wait_for_completion`](Self::wait_for_completion).
    pub fn waiters(&self) -> usize {
        self.lock().waiters
    }

    /// Wake every blocked waiter without delivering a completion.
    pub fn wake_all(&self) {
        let mut pending = self.lock();
        pending.generation = pending.generation.wrapping_add(1);
        drop(pending);
        self.changed.notify_all();
    }

    /// Drop every pending completion.
    pub fn discard(&self) {
        self.lock().buffers.clear();
    }

    /// Reset the listener's count to `ready` buffers plus the completions
    /// still waiting to be drained.
    pub fn rearm(&self, ready: u64) {
        let pending = self.lock();
        if let Some(listener) = &pending.listener {
            let queued = u64::try_from(pending.buffers.len()).unwrap_or(u64::MAX);
            listener.set(ready.saturating_add(queued));
        }
    }

    /// Route readiness signals to `listener`, replacing any previous one.
    pub fn bind(&self, listener: Arc<EventCounter>) {
        self.lock().listener = Some(listener);
    }

    /// Stop routing readiness signals.
    pub fn unbind(&self) {
        self.lock().listener = None;
    }

    /// Callback a backend invokes for every finished buffer.
    pub fn handler(self: &Arc<Self>) -> CompletionHandler {
        let queue = Arc::clone(self);
        Arc::new(move |completion| queue.push(completion))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
