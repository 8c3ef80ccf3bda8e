//! Locking Primitives
//!
//! Provides:
//! - [`SyncLock`]: the raw lock, spin or blocking kind, with an owner
//! - [`Mutex`] and [`SpinLock`]: data-carrying wrappers with RAII guards
//! - [`RawRwLock`] and [`RwLock`]: reader/writer locks with writer preference
//!
//! Spin-kind locks enter a critical section for as long as they are held
//! and busy-wait under contention. Blocking-kind locks put contending
//! contexts to sleep on the owner word through the keyed wait primitive,
//! and must never be taken inside a critical section.
//!
//! Recursive acquisition, releasing a lock that the caller does not hold,
//! and sleeping on a lock from a critical section are fatal.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::kern::futex::{kern_wait, kern_wake};
use crate::kern::sched::{self, ContextId};
use crate::kern::sched_prim::WaitQueue;

// ============================================================================
// Sync Lock
// ============================================================================

/// Lock kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockKind {
    /// Busy-waits inside a critical section
    Spin = 1,
    /// Sleeps under contention
    Blocking = 2,
}

/// Raw mutual-exclusion lock with an owner
pub struct SyncLock {
    /// Owning context, or 0
    owner: AtomicUsize,
    /// Contexts sleeping on `owner`
    waiting: AtomicU32,
    kind: LockKind,
}

impl fmt::Debug for SyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncLock")
            .field("kind", &self.kind)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncLock {
    /// Create a new unlocked lock
    pub const fn new(kind: LockKind) -> Self {
        Self {
            owner: AtomicUsize::new(0),
            waiting: AtomicU32::new(0),
            kind,
        }
    }

    pub const fn new_spin() -> Self {
        Self::new(LockKind::Spin)
    }

    pub const fn new_blocking() -> Self {
        Self::new(LockKind::Blocking)
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    fn check_recursion(&self, me: ContextId) {
        if self.owner.load(Ordering::SeqCst) == me.0 {
            panic!("lock: {:?} acquired twice by {:?}", self as *const _, me);
        }
    }

    /// Acquire the lock
    pub fn acquire(&self) {
        let me = sched::current();
        self.check_recursion(me);

        match self.kind {
            LockKind::Spin => {
                sched::critical_enter();
                while self
                    .owner
                    .compare_exchange_weak(0, me.0, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    sched::critical_leave();
                    while self.owner.load(Ordering::Relaxed) != 0 {
                        core::hint::spin_loop();
                    }
                    sched::critical_enter();
                }
            }
            LockKind::Blocking => {
                if sched::in_critical() {
                    panic!(
                        "lock: blocking lock {:?} taken inside a critical section",
                        self as *const _
                    );
                }
                loop {
                    if self
                        .owner
                        .compare_exchange(0, me.0, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                    self.waiting.fetch_add(1, Ordering::SeqCst);
                    let owner = self.owner.load(Ordering::SeqCst);
                    if owner != 0 {
                        // ValueChanged just means the owner moved; retry.
                        let _ = kern_wait(&self.owner, owner as u64, None);
                    }
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Try to acquire the lock without blocking
    pub fn try_acquire(&self) -> bool {
        let me = sched::current();
        self.check_recursion(me);

        if self.kind == LockKind::Spin {
            sched::critical_enter();
        }
        let ok = self
            .owner
            .compare_exchange(0, me.0, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        if !ok && self.kind == LockKind::Spin {
            sched::critical_leave();
        }
        ok
    }

    /// Release the lock
    pub fn release(&self) {
        let me = sched::current();
        if self
            .owner
            .compare_exchange(me.0, 0, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            panic!(
                "lock: {:?} released by {:?} but owned by {}",
                self as *const _,
                me,
                self.owner.load(Ordering::SeqCst)
            );
        }

        match self.kind {
            LockKind::Spin => sched::critical_leave(),
            LockKind::Blocking => {
                if self.waiting.load(Ordering::SeqCst) > 0 {
                    kern_wake(&self.owner, 1);
                }
            }
        }
    }

    /// Is the lock held by anyone?
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    /// Is the lock held by the calling context?
    pub fn is_owned(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == sched::current().0
    }

    /// Panic unless the calling context holds the lock
    pub fn assert_owned(&self) {
        if !self.is_owned() {
            panic!("lock: {:?} not held by {:?}", self as *const _, sched::current());
        }
    }
}

unsafe impl Send for SyncLock {}
unsafe impl Sync for SyncLock {}

// ============================================================================
// Mutex with Data
// ============================================================================

/// A lock that protects data
///
/// `Mutex::new` builds a blocking lock; [`SpinLock`] wraps the spin kind.
pub struct Mutex<T: ?Sized> {
    lock: SyncLock,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self::with_kind(LockKind::Blocking, data)
    }

    pub const fn with_kind(kind: LockKind, data: T) -> Self {
        Self {
            lock: SyncLock::new(kind),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.lock.try_acquire() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn is_owned(&self) -> bool {
        self.lock.is_owned()
    }

    /// The raw lock, for callers that release and re-acquire by hand
    pub fn raw(&self) -> &SyncLock {
        &self.lock
    }

    /// Access the data with the lock held by the caller
    ///
    /// # Safety
    ///
    /// The calling context must hold `self.raw()` and must not create a
    /// second live reference through a guard.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("lock", &self.lock).finish_non_exhaustive()
    }
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

/// RAII guard for [`Mutex`] and [`SpinLock`]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

// ============================================================================
// Spin Lock with Data
// ============================================================================

/// A spin lock that protects data
///
/// Holding the guard keeps the caller inside a critical section.
pub struct SpinLock<T> {
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::with_kind(LockKind::Spin, data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Read/Write Lock
// ============================================================================

/// Reader/writer state, guarded by the interlock
#[derive(Debug, Default)]
struct RwState {
    /// Active readers
    readers: u32,
    /// Writer owner, or NONE
    writer: usize,
    /// Writers waiting for the lock
    write_waiting: u32,
    /// Readers waiting for the lock
    read_waiting: u32,
}

/// A read/write lock
///
/// Allows multiple concurrent readers or a single writer. Once a writer is
/// waiting, new readers wait too, so writers are not starved.
pub struct RawRwLock {
    state: SpinLock<RwState>,
    writers: WaitQueue,
    readers: WaitQueue,
}

impl RawRwLock {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(RwState {
                readers: 0,
                writer: 0,
                write_waiting: 0,
                read_waiting: 0,
            }),
            writers: WaitQueue::new(),
            readers: WaitQueue::new(),
        }
    }

    /// Acquire the lock for writing (exclusive access)
    pub fn write(&self) {
        sched::assert_sleepable();
        let me = sched::current();
        let mut queued = false;

        loop {
            let waiter = {
                let mut st = self.state.lock();
                if queued {
                    st.write_waiting -= 1;
                }
                if st.writer == me.0 {
                    panic!("rwlock: {:?} write-locked twice by {:?}", self as *const _, me);
                }
                if st.readers == 0 && st.writer == 0 {
                    st.writer = me.0;
                    return;
                }
                st.write_waiting += 1;
                self.writers.prepare()
            };
            queued = true;
            self.writers.sleep(&waiter, None);
        }
    }

    /// Acquire the lock for reading (shared access)
    pub fn read(&self) {
        sched::assert_sleepable();
        let mut queued = false;

        loop {
            let waiter = {
                let mut st = self.state.lock();
                if queued {
                    st.read_waiting -= 1;
                }
                if st.writer == 0 && st.write_waiting == 0 {
                    st.readers += 1;
                    return;
                }
                st.read_waiting += 1;
                self.readers.prepare()
            };
            queued = true;
            self.readers.sleep(&waiter, None);
        }
    }

    /// Try to acquire the lock for writing without blocking
    pub fn try_write(&self) -> bool {
        let mut st = self.state.lock();
        if st.readers == 0 && st.writer == 0 {
            st.writer = sched::current().0;
            true
        } else {
            false
        }
    }

    /// Try to acquire the lock for reading without blocking
    pub fn try_read(&self) -> bool {
        let mut st = self.state.lock();
        if st.writer == 0 && st.write_waiting == 0 {
            st.readers += 1;
            true
        } else {
            false
        }
    }

    /// Release the lock (works for both read and write)
    pub fn done(&self) {
        let mut st = self.state.lock();

        if st.writer != 0 {
            let me = sched::current();
            if st.writer != me.0 {
                panic!(
                    "rwlock: {:?} released by {:?} but written by {}",
                    self as *const _, me, st.writer
                );
            }
            st.writer = 0;
        } else {
            if st.readers == 0 {
                panic!("rwlock: {:?} released while not held", self as *const _);
            }
            st.readers -= 1;
            if st.readers > 0 {
                return;
            }
        }

        let woke_writer = st.write_waiting > 0 && self.writers.wakeup_one();
        if !woke_writer && st.read_waiting > 0 {
            self.readers.wakeup_all();
        }
    }

    /// Get the current reader count
    pub fn read_count(&self) -> u32 {
        self.state.lock().readers
    }

    /// Writers currently waiting
    pub fn writers_waiting(&self) -> u32 {
        self.state.lock().write_waiting
    }

    /// Check if the lock is held for writing
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer != 0
    }

    /// Check if the lock is held for reading
    pub fn is_read_locked(&self) -> bool {
        self.state.lock().readers != 0
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRwLock").finish_non_exhaustive()
    }
}

/// A read/write lock that protects data
pub struct RwLock<T> {
    lock: RawRwLock,
    data: UnsafeCell<T>,
}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: RawRwLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> ReadLockGuard<'_, T> {
        self.lock.read();
        ReadLockGuard { rw: self }
    }

    pub fn write(&self) -> WriteLockGuard<'_, T> {
        self.lock.write();
        WriteLockGuard { rw: self }
    }

    pub fn try_read(&self) -> Option<ReadLockGuard<'_, T>> {
        self.lock.try_read().then(|| ReadLockGuard { rw: self })
    }

    pub fn try_write(&self) -> Option<WriteLockGuard<'_, T>> {
        self.lock.try_write().then(|| WriteLockGuard { rw: self })
    }

    pub fn raw(&self) -> &RawRwLock {
        &self.lock
    }
}

impl<T> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").finish_non_exhaustive()
    }
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

/// RAII guard for read lock
pub struct ReadLockGuard<'a, T> {
    rw: &'a RwLock<T>,
}

impl<'a, T> Deref for ReadLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.rw.data.get() }
    }
}

impl<'a, T> Drop for ReadLockGuard<'a, T> {
    fn drop(&mut self) {
        self.rw.lock.done();
    }
}

/// RAII guard for write lock
pub struct WriteLockGuard<'a, T> {
    rw: &'a RwLock<T>,
}

impl<'a, T> Deref for WriteLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.rw.data.get() }
    }
}

impl<'a, T> DerefMut for WriteLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.rw.data.get() }
    }
}

impl<'a, T> Drop for WriteLockGuard<'a, T> {
    fn drop(&mut self) {
        self.rw.lock.done();
    }
}
