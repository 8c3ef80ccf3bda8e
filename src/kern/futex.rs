//! Keyed Wait/Wake
//!
//! Futex-style blocking on an opaque key. A waiter names a key and the
//! value it expects to find there; the value is re-read after the waiter
//! is registered, and a mismatch fails fast with
//! [`WaitError::ValueChanged`]. Wakers name the same key and wake up to
//! N waiters.
//!
//! Waiters are spread over a fixed table of hashed wait queues. Every
//! blocking lock in the crate, and the page busy/lock bits, are built on
//! the kernel-word form of this primitive.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use crate::error::WaitError;
use crate::kern::sched_prim::{EventSpace, WaitEvent, WaitQueue, WaitResult};

// ============================================================================
// Hash Table
// ============================================================================

/// Number of hashed queues (power of two)
pub const FUTEX_BUCKETS: usize = 256;

static FUTEX_TABLE: [WaitQueue; FUTEX_BUCKETS] = [const { WaitQueue::new() }; FUTEX_BUCKETS];

fn bucket(key: &WaitEvent) -> &'static WaitQueue {
    let space = match key.space {
        EventSpace::None => 0,
        EventSpace::Kernel => 0x9e37_79b9,
        EventSpace::Object(id) => id.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        EventSpace::AddressSpace(id) => id.wrapping_mul(0xc2b2_ae3d_27d4_eb4f),
    };
    let hash = (key.addr >> 8) ^ key.addr ^ space;
    &FUTEX_TABLE[(hash as usize) & (FUTEX_BUCKETS - 1)]
}

// ============================================================================
// Keyed Wait / Wake
// ============================================================================

/// Wait on `key` while `load()` returns `expected`
///
/// `load` reads the current value behind the key. It returns
/// `Err(WaitError::Fault)` when the key does not name valid memory.
pub fn futex_wait<F>(
    key: WaitEvent,
    load: F,
    expected: u64,
    timeout: Option<Duration>,
) -> Result<(), WaitError>
where
    F: Fn() -> Result<u64, WaitError>,
{
    if key.addr % 4 != 0 {
        return Err(WaitError::Fault);
    }

    let queue = bucket(&key);
    let waiter = queue.prepare_event(key);

    match load() {
        Err(err) => {
            queue.abort(&waiter);
            return Err(err);
        }
        Ok(value) if value != expected => {
            queue.abort(&waiter);
            return Err(WaitError::ValueChanged);
        }
        Ok(_) => {}
    }

    match queue.sleep(&waiter, timeout) {
        WaitResult::Normal => Ok(()),
        WaitResult::TimedOut => Err(WaitError::TimedOut),
        WaitResult::Interrupted => Err(WaitError::Interrupted),
    }
}

/// Wake up to `num` waiters parked on `key`; returns how many were woken
pub fn futex_wake(key: WaitEvent, num: usize) -> Result<usize, WaitError> {
    if key.addr % 4 != 0 {
        return Err(WaitError::Fault);
    }
    Ok(bucket(&key).wakeup_matching(num, WaitResult::Normal, |w| w.event == key))
}

// ============================================================================
// Kernel Words
// ============================================================================

/// Atomic word that kernel code can wait on
pub trait FutexWord {
    fn load_word(&self) -> u64;
}

impl FutexWord for AtomicU32 {
    fn load_word(&self) -> u64 {
        self.load(Ordering::SeqCst) as u64
    }
}

impl FutexWord for AtomicU64 {
    fn load_word(&self) -> u64 {
        self.load(Ordering::SeqCst)
    }
}

impl FutexWord for AtomicUsize {
    fn load_word(&self) -> u64 {
        self.load(Ordering::SeqCst) as u64
    }
}

/// Wait while `word` still holds `expected`
///
/// `ValueChanged` is an ordinary outcome here; callers loop on their own
/// condition.
pub fn kern_wait<W: FutexWord>(
    word: &W,
    expected: u64,
    timeout: Option<Duration>,
) -> Result<(), WaitError> {
    futex_wait(
        WaitEvent::kernel(word),
        || Ok(word.load_word()),
        expected,
        timeout,
    )
}

/// Wake up to `num` waiters on `word`
pub fn kern_wake<W: FutexWord>(word: &W, num: usize) -> usize {
    futex_wake(WaitEvent::kernel(word), num).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn test_value_changed_fails_fast() {
        testing::setup();
        let word = AtomicU32::new(5);
        assert_eq!(kern_wait(&word, 4, None), Err(WaitError::ValueChanged));
    }

    #[test]
    fn test_bad_key_faults() {
        testing::setup();
        let key = WaitEvent::address_space(7, 0x1001);
        assert_eq!(futex_wait(key, || Ok(0), 0, None), Err(WaitError::Fault));
        assert_eq!(futex_wake(key, 1), Err(WaitError::Fault));

        let key = WaitEvent::address_space(7, 0x1000);
        assert_eq!(
            futex_wait(key, || Err(WaitError::Fault), 0, None),
            Err(WaitError::Fault)
        );
    }

    #[test]
    fn test_wait_timeout() {
        testing::setup();
        let word = AtomicU32::new(0);
        assert_eq!(
            kern_wait(&word, 0, Some(Duration::from_millis(5))),
            Err(WaitError::TimedOut)
        );
    }

    #[test]
    fn test_wake_by_key() {
        testing::setup();
        let word = Arc::new(AtomicU32::new(0));
        let other = AtomicU32::new(0);

        let handle = {
            let word = word.clone();
            thread::spawn(move || {
                while word.load(Ordering::SeqCst) == 0 {
                    let _ = kern_wait(&*word, 0, None);
                }
            })
        };

        // Waking a different key must not release the waiter.
        assert_eq!(kern_wake(&other, 1), 0);

        word.store(1, Ordering::SeqCst);
        kern_wake(&*word, usize::MAX);
        handle.join().unwrap();
    }

    #[test]
    fn test_object_keys_are_distinct() {
        testing::setup();
        let a = WaitEvent::object(1, 0x1000);
        let b = WaitEvent::object(2, 0x1000);
        assert_ne!(a, b);
        assert_eq!(futex_wake(a, 1), Ok(0));
    }
}
