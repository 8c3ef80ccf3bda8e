//! Wait Queues - Prepare/Sleep/Wakeup
//!
//! A context that wants to wait for a condition first registers a
//! [`Waiter`] on a [`WaitQueue`] with `prepare`, then checks the
//! condition, then calls `sleep`. Registration happens under the queue
//! lock, so a wakeup that lands between the check and the sleep marks the
//! waiter done and `sleep` returns at once instead of losing it.
//!
//! A waker only calls into the scheduler for waiters that actually reached
//! `sleep`. Waiters that were woken while still checking their condition
//! never see a spurious scheduler wakeup.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use core::time::Duration;

use crate::kern::lock::SpinLock;
use crate::kern::sched::{self, ContextId};

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitResult {
    /// Woken normally
    Normal = 0,
    /// Woken by an interrupt request
    Interrupted = 1,
    /// Timeout expired first
    TimedOut = 2,
}

impl WaitResult {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Interrupted,
            2 => Self::TimedOut,
            _ => Self::Normal,
        }
    }
}

// ============================================================================
// Wait Event
// ============================================================================

/// Namespace of a wait event key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSpace {
    /// Plain wait queue, no key
    None,
    /// A kernel word, keyed by its address
    Kernel,
    /// A VM object, keyed by object id
    Object(u64),
    /// An address space, keyed by its id
    AddressSpace(u64),
}

/// Logical identity a waiter is parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitEvent {
    pub space: EventSpace,
    pub addr: u64,
}

/// Special value indicating no event
pub const EVENT_NULL: WaitEvent = WaitEvent {
    space: EventSpace::None,
    addr: 0,
};

impl WaitEvent {
    /// Key for a kernel word
    pub fn kernel<T>(word: &T) -> Self {
        Self {
            space: EventSpace::Kernel,
            addr: word as *const T as usize as u64,
        }
    }

    /// Key for an offset inside a VM object
    pub fn object(object: u64, offset: u64) -> Self {
        Self {
            space: EventSpace::Object(object),
            addr: offset,
        }
    }

    /// Key for an address inside an address space
    pub fn address_space(space: u64, addr: u64) -> Self {
        Self {
            space: EventSpace::AddressSpace(space),
            addr,
        }
    }
}

// ============================================================================
// Waiter Entry
// ============================================================================

/// Scheduler wakeups issued per queue-lock hold
const WAKE_BATCH: usize = 16;

/// Waiter has been woken (or aborted)
pub const WAIT_DONE: u32 = 0x1;
/// Waiter reached `sleep` and may be blocked in the scheduler
pub const WAIT_SLEEP: u32 = 0x2;

/// A context waiting on a queue
#[derive(Debug)]
pub struct Waiter {
    /// The waiting context
    pub ctx: ContextId,
    /// The event being waited on
    pub event: WaitEvent,
    /// WAIT_DONE / WAIT_SLEEP, changed under the queue lock
    flags: AtomicU32,
    /// WaitResult set by the waker
    result: AtomicU8,
}

impl Waiter {
    fn new(ctx: ContextId, event: WaitEvent) -> Self {
        Self {
            ctx,
            event,
            flags: AtomicU32::new(0),
            result: AtomicU8::new(WaitResult::Normal as u8),
        }
    }

    /// Has this waiter been woken?
    pub fn is_done(&self) -> bool {
        self.flags.load(Ordering::Acquire) & WAIT_DONE != 0
    }

    fn result(&self) -> WaitResult {
        WaitResult::from_u8(self.result.load(Ordering::Acquire))
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Queue of contexts waiting for a condition
#[derive(Debug)]
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl WaitQueue {
    /// Create a new wait queue
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Register the calling context before checking the wait condition
    pub fn prepare(&self) -> Arc<Waiter> {
        self.prepare_event(EVENT_NULL)
    }

    /// Register the calling context for a keyed event
    pub fn prepare_event(&self, event: WaitEvent) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter::new(sched::current(), event));
        self.waiters.lock().push_back(waiter.clone());
        waiter
    }

    /// Unregister a waiter that decided not to sleep
    pub fn abort(&self, waiter: &Arc<Waiter>) {
        let mut q = self.waiters.lock();
        if let Some(pos) = q.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            q.remove(pos);
        }
        waiter.flags.fetch_or(WAIT_DONE, Ordering::AcqRel);
    }

    /// Sleep until woken or until `timeout` expires
    ///
    /// Returns immediately if a wakeup already reached the waiter.
    pub fn sleep(&self, waiter: &Arc<Waiter>, timeout: Option<Duration>) -> WaitResult {
        sched::assert_sleepable();

        {
            let _q = self.waiters.lock();
            if waiter.is_done() {
                return waiter.result();
            }
            waiter.flags.fetch_or(WAIT_SLEEP, Ordering::AcqRel);
        }

        let scheduler = sched::scheduler();
        let deadline = timeout.map(|t| scheduler.now() + t);

        loop {
            if waiter.is_done() {
                return waiter.result();
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = scheduler.now();
                    if now >= deadline {
                        let mut q = self.waiters.lock();
                        if waiter.is_done() {
                            return waiter.result();
                        }
                        if let Some(pos) = q.iter().position(|w| Arc::ptr_eq(w, waiter)) {
                            q.remove(pos);
                        }
                        waiter.flags.fetch_or(WAIT_DONE, Ordering::AcqRel);
                        return WaitResult::TimedOut;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            scheduler.block(remaining);
        }
    }

    /// Mark a dequeued waiter done; returns the context to wake, if any
    fn finish(waiter: &Waiter, result: WaitResult) -> Option<ContextId> {
        waiter.result.store(result as u8, Ordering::Release);
        let prev = waiter.flags.fetch_or(WAIT_DONE, Ordering::AcqRel);
        if prev & WAIT_SLEEP != 0 {
            Some(waiter.ctx)
        } else {
            None
        }
    }

    /// Wake up to `num` waiters matching `pred`, oldest first
    ///
    /// Scheduler wakeups are issued after the queue lock is dropped, in
    /// batches of `WAKE_BATCH`.
    pub fn wakeup_matching<F>(&self, num: usize, result: WaitResult, pred: F) -> usize
    where
        F: Fn(&Waiter) -> bool,
    {
        let scheduler = sched::scheduler();
        let mut woken = 0;

        loop {
            let mut batch: heapless::Vec<ContextId, WAKE_BATCH> = heapless::Vec::new();
            let mut more = false;

            {
                let mut q = self.waiters.lock();
                let mut i = 0;
                while i < q.len() && woken < num {
                    if !pred(&q[i]) {
                        i += 1;
                        continue;
                    }
                    if batch.is_full() {
                        more = true;
                        break;
                    }
                    if let Some(waiter) = q.remove(i) {
                        if let Some(ctx) = Self::finish(&waiter, result) {
                            // Capacity checked above.
                            let _ = batch.push(ctx);
                        }
                        woken += 1;
                    }
                }
            }

            for ctx in batch {
                scheduler.wake(ctx);
            }
            if !more {
                return woken;
            }
        }
    }

    /// Wake up to `num` waiters; returns how many were woken
    pub fn wakeup_num(&self, num: usize) -> usize {
        self.wakeup_matching(num, WaitResult::Normal, |_| true)
    }

    /// Wake the oldest waiter
    pub fn wakeup_one(&self) -> bool {
        self.wakeup_num(1) == 1
    }

    /// Wake every waiter
    pub fn wakeup_all(&self) -> usize {
        self.wakeup_num(usize::MAX)
    }

    /// Wake every waiter with `WaitResult::Interrupted`
    pub fn interrupt_all(&self) -> usize {
        self.wakeup_matching(usize::MAX, WaitResult::Interrupted, |_| true)
    }

    /// Get count of waiters
    pub fn count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Convenience Functions
// ============================================================================

/// Wait on `queue` until `cond` holds
///
/// The condition is checked after registration, so a wakeup issued by a
/// context that made it true cannot be missed.
pub fn wait_until<F>(queue: &WaitQueue, timeout: Option<Duration>, cond: F) -> WaitResult
where
    F: FnMut() -> bool,
{
    wait_event_until(queue, EVENT_NULL, timeout, cond)
}

/// Like [`wait_until`], registering the waiter under `event` so wakers
/// can select it with [`WaitQueue::wakeup_matching`]
pub fn wait_event_until<F>(
    queue: &WaitQueue,
    event: WaitEvent,
    timeout: Option<Duration>,
    mut cond: F,
) -> WaitResult
where
    F: FnMut() -> bool,
{
    let scheduler = sched::scheduler();
    let deadline = timeout.map(|t| scheduler.now() + t);

    loop {
        let waiter = queue.prepare_event(event);
        if cond() {
            queue.abort(&waiter);
            return WaitResult::Normal;
        }

        let remaining = match deadline {
            Some(deadline) => {
                let now = scheduler.now();
                if now >= deadline {
                    queue.abort(&waiter);
                    return WaitResult::TimedOut;
                }
                Some(deadline - now)
            }
            None => None,
        };

        match queue.sleep(&waiter, remaining) {
            WaitResult::Normal => {}
            WaitResult::TimedOut if cond() => return WaitResult::Normal,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_wakeup_before_sleep() {
        testing::setup();
        let queue = WaitQueue::new();
        let waiter = queue.prepare();
        assert_eq!(queue.count(), 1);

        assert!(queue.wakeup_one());
        assert!(waiter.is_done());
        assert_eq!(queue.count(), 0);

        // Already done: sleep must not block.
        assert_eq!(queue.sleep(&waiter, None), WaitResult::Normal);
    }

    #[test]
    fn test_sleep_timeout() {
        testing::setup();
        let queue = WaitQueue::new();
        let waiter = queue.prepare();
        let result = queue.sleep(&waiter, Some(Duration::from_millis(10)));
        assert_eq!(result, WaitResult::TimedOut);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wakeup_sleeping_thread() {
        testing::setup();
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let queue = queue.clone();
            let flag = flag.clone();
            thread::spawn(move || wait_until(&queue, None, || flag.load(Ordering::SeqCst)))
        };

        while queue.count() == 0 {
            thread::yield_now();
        }
        flag.store(true, Ordering::SeqCst);
        queue.wakeup_all();

        assert_eq!(handle.join().unwrap(), WaitResult::Normal);
    }

    #[test]
    fn test_wakeup_num() {
        testing::setup();
        let queue = WaitQueue::new();
        let waiters: Vec<_> = (0..4).map(|_| queue.prepare()).collect();

        assert_eq!(queue.wakeup_num(3), 3);
        assert_eq!(waiters.iter().filter(|w| w.is_done()).count(), 3);
        assert!(!waiters[3].is_done());
        assert_eq!(queue.wakeup_num(3), 1);
        assert_eq!(queue.wakeup_num(3), 0);
    }

    #[test]
    fn test_interrupt_all() {
        testing::setup();
        let queue = WaitQueue::new();
        let waiter = queue.prepare();
        assert_eq!(queue.interrupt_all(), 1);
        assert_eq!(queue.sleep(&waiter, None), WaitResult::Interrupted);
    }
}
