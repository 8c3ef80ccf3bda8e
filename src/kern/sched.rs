//! Scheduler Interface and Critical Sections
//!
//! The VM core does not own a scheduler. It consumes one through the
//! [`Scheduler`] trait: the identity of the current execution context,
//! a blocking primitive, a wakeup, a clock, and the preemption-disable
//! counter that spin locks rely on.
//!
//! ## Critical sections
//!
//! A critical section is a region where the holder must not be preempted
//! or put to sleep. Spin-kind locks enter one for as long as they are
//! held. Interrupt and trap handlers may run in such a region and must
//! never wait on the scheduler, so every sleeping primitive in this crate
//! asserts it is called outside of one.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

// ============================================================================
// Context Identity
// ============================================================================

/// Identity of an execution context (a kernel thread)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub usize);

impl ContextId {
    /// No context. Never returned by [`Scheduler::current`].
    pub const NONE: Self = Self(0);

    /// The context that runs before a scheduler is installed
    pub const BOOT: Self = Self(1);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

// ============================================================================
// Scheduler Trait
// ============================================================================

/// Scheduler services consumed by the sync and wait core
///
/// `block` may return early for any reason; callers always re-check their
/// condition. A `wake` delivered to a context that has not blocked yet must
/// make its next `block` return immediately.
pub trait Scheduler: Send + Sync {
    /// The calling context
    fn current(&self) -> ContextId;

    /// Suspend the calling context until woken or until `timeout` elapses
    fn block(&self, timeout: Option<Duration>);

    /// Make `ctx` runnable
    fn wake(&self, ctx: ContextId);

    /// Monotonic clock
    fn now(&self) -> Duration;

    /// Suspend the calling context for `duration`
    fn sleep(&self, duration: Duration);

    /// Disable preemption for the calling context (nests)
    fn critical_enter(&self);

    /// Re-enable preemption once the outermost section is left
    fn critical_leave(&self);

    /// Current critical section nesting of the calling context
    fn critical_depth(&self) -> u32;
}

// ============================================================================
// Boot Scheduler
// ============================================================================

/// Single-context scheduler used until the real one is installed
///
/// During early boot there is exactly one context, so blocking degrades to
/// a spin hint and the caller's re-check loop does the waiting.
struct BootScheduler {
    depth: AtomicU32,
}

impl Scheduler for BootScheduler {
    fn current(&self) -> ContextId {
        ContextId::BOOT
    }

    fn block(&self, _timeout: Option<Duration>) {
        core::hint::spin_loop();
    }

    fn wake(&self, _ctx: ContextId) {}

    fn now(&self) -> Duration {
        Duration::ZERO
    }

    fn sleep(&self, _duration: Duration) {
        core::hint::spin_loop();
    }

    fn critical_enter(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    fn critical_leave(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            panic!("sched: critical_leave without critical_enter");
        }
    }

    fn critical_depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }
}

static BOOT_SCHEDULER: BootScheduler = BootScheduler {
    depth: AtomicU32::new(0),
};

// ============================================================================
// Global Scheduler
// ============================================================================

static SCHEDULER: spin::Once<&'static dyn Scheduler> = spin::Once::new();

/// Install the kernel scheduler
///
/// Called once during boot, before any second context exists. Later calls
/// are ignored.
pub fn install(scheduler: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| scheduler);
}

/// Get the active scheduler
pub fn scheduler() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(sched) => *sched,
        None => &BOOT_SCHEDULER,
    }
}

/// Identity of the calling context
pub fn current() -> ContextId {
    scheduler().current()
}

/// Current time from the scheduler clock
pub fn now() -> Duration {
    scheduler().now()
}

/// Sleep without a wait queue
pub fn sleep(duration: Duration) {
    assert_sleepable();
    scheduler().sleep(duration);
}

// ============================================================================
// Critical Sections
// ============================================================================

/// Enter a critical section
pub fn critical_enter() {
    scheduler().critical_enter();
}

/// Leave a critical section
pub fn critical_leave() {
    scheduler().critical_leave();
}

/// Is the calling context inside a critical section?
pub fn in_critical() -> bool {
    scheduler().critical_depth() > 0
}

/// Panic if the calling context may not sleep
pub fn assert_sleepable() {
    if in_critical() {
        panic!(
            "sched: context {:?} would sleep inside a critical section",
            current()
        );
    }
}

/// RAII critical section
#[must_use]
pub struct CriticalSection {
    _private: (),
}

impl CriticalSection {
    pub fn enter() -> Self {
        critical_enter();
        Self { _private: () }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        critical_leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_critical_nesting() {
        testing::setup();
        assert!(!in_critical());
        {
            let _outer = CriticalSection::enter();
            assert!(in_critical());
            {
                let _inner = CriticalSection::enter();
                assert_eq!(scheduler().critical_depth(), 2);
            }
            assert!(in_critical());
        }
        assert!(!in_critical());
    }

    #[test]
    fn test_contexts_are_distinct() {
        testing::setup();
        let me = current();
        let other = std::thread::spawn(current).join().unwrap();
        assert_ne!(me, other);
        assert!(!me.is_none());
    }

    #[test]
    #[should_panic(expected = "inside a critical section")]
    fn test_sleep_in_critical_panics() {
        testing::setup();
        let _cs = CriticalSection::enter();
        sleep(Duration::from_millis(1));
    }
}
