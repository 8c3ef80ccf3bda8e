//! Kern subsystem - Core kernel primitives
//!
//! Contains the scheduler seam, wait queues, keyed wait/wake, locks, and
//! the kernel heap.

pub mod futex;
pub mod kalloc;
pub mod lock;
pub mod sched;
pub mod sched_prim;
pub mod slab;

pub use futex::{futex_wait, futex_wake, kern_wait, kern_wake};
pub use kalloc::{Kalloc, KallocStats};
pub use lock::{LockKind, Mutex, RwLock, SpinLock, SyncLock};
pub use sched::{ContextId, CriticalSection, Scheduler};
pub use sched_prim::{WaitEvent, WaitQueue, WaitResult};
pub use slab::{SlabPool, SlabStats};
