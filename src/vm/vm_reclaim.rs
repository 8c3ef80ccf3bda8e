//! Generic Reclaim Registry
//!
//! Caches that can give memory back (slab pools, name caches) register a
//! named callback. Under pressure the reclaim daemon calls them in turn,
//! one object per call, until pressure falls.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;

use crate::error::{VmError, VmResult};
use crate::kern::lock::SpinLock;
use crate::kern::sched;
use crate::vm::vm_pressure::{PoolSet, PressureLevel};
use crate::vm::Vm;

/// Longest callback name
pub const RECLAIM_NAME_LEN: usize = 32;

/// Callback name
pub type ReclaimName = heapless::String<RECLAIM_NAME_LEN>;

/// Free one object; returns false if there was nothing to free
pub type ReclaimFn = Arc<dyn Fn(&Vm) -> bool + Send + Sync>;

struct Reclaimer {
    name: ReclaimName,
    callback: ReclaimFn,
}

struct Registry {
    entries: Vec<Reclaimer>,
    /// Next entry to try
    cursor: usize,
}

/// Registered reclaim callbacks
pub struct ReclaimRegistry {
    registry: SpinLock<Registry>,
    stop: AtomicBool,
    backoff: Duration,
    /// Objects freed by callbacks
    pub freed: AtomicU64,
}

impl ReclaimRegistry {
    pub fn new(backoff: Duration) -> Self {
        Self {
            registry: SpinLock::new(Registry {
                entries: Vec::new(),
                cursor: 0,
            }),
            stop: AtomicBool::new(false),
            backoff,
            freed: AtomicU64::new(0),
        }
    }

    /// Register a callback under `name`
    pub fn add(&self, name: &str, callback: ReclaimFn) -> VmResult<()> {
        let mut name_buf = ReclaimName::new();
        name_buf.push_str(name).map_err(|_| VmError::InvalidArgument)?;
        let name = name_buf;
        let mut reg = self.registry.lock();
        if reg.entries.iter().any(|r| r.name == name) {
            return Err(VmError::InvalidArgument);
        }
        log::debug!("reclaim: registered {}", name);
        reg.entries.push(Reclaimer { name, callback });
        Ok(())
    }

    /// Unregister the callback named `name`
    pub fn remove(&self, name: &str) -> VmResult<()> {
        let mut reg = self.registry.lock();
        let pos = reg
            .entries
            .iter()
            .position(|r| r.name.as_str() == name)
            .ok_or(VmError::NotFound)?;
        reg.entries.remove(pos);
        if reg.cursor > pos {
            reg.cursor -= 1;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try each callback once, starting after the last one that was used,
    /// until one frees something
    ///
    /// Callbacks run without the registry lock held.
    pub fn reclaim_once(&self, vm: &Vm) -> bool {
        let n = self.len();
        for _ in 0..n {
            let picked = {
                let mut reg = self.registry.lock();
                if reg.entries.is_empty() {
                    return false;
                }
                let i = reg.cursor % reg.entries.len();
                reg.cursor = i + 1;
                let entry = &reg.entries[i];
                (entry.name.clone(), entry.callback.clone())
            };
            let (name, callback) = picked;
            if callback(vm) {
                self.freed.fetch_add(1, Ordering::Relaxed);
                log::info!("reclaim: freed an object from {}", name);
                return true;
            }
        }
        false
    }

    /// Ask a running daemon to return from `run`
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Daemon loop; returns after [`ReclaimRegistry::stop`]
    pub fn run(&self, vm: &Vm) {
        self.stop.store(false, Ordering::Release);
        log::info!("reclaim: daemon started");
        let pools = PoolSet::KERN | PoolSet::PHYS;

        while !self.stop.load(Ordering::Acquire) {
            vm.pressure
                .wait_for_pressure(pools, PressureLevel::Moderate, Some(self.backoff * 20));
            if vm.pressure.pressure(pools) < PressureLevel::Moderate {
                continue;
            }
            let freed = self.reclaim_once(vm);
            // Let allocators catch up once the worst is over
            if !freed || vm.pressure.pressure(pools) <= PressureLevel::Moderate {
                sched::sleep(self.backoff);
            }
        }
        log::info!("reclaim: daemon stopped");
    }
}

impl core::fmt::Debug for ReclaimRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReclaimRegistry")
            .field("callbacks", &self.len())
            .field("freed", &self.freed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::vm::vm_page::{AllocFlags, VmPage};
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    fn counter(budget: usize) -> (Arc<AtomicUsize>, ReclaimFn) {
        let left = Arc::new(AtomicUsize::new(budget));
        let cb_left = left.clone();
        let cb: ReclaimFn = Arc::new(move |_vm: &Vm| {
            cb_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        });
        (left, cb)
    }

    #[test]
    fn test_add_and_remove() {
        testing::setup();
        let reg = ReclaimRegistry::new(Duration::from_millis(1));
        let (_, a) = counter(0);
        reg.add("dentry", a.clone()).unwrap();
        assert_eq!(reg.add("dentry", a.clone()), Err(VmError::InvalidArgument));
        assert_eq!(
            reg.add("a-name-that-is-far-too-long-for-the-table", a),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(reg.len(), 1);
        reg.remove("dentry").unwrap();
        assert_eq!(reg.remove("dentry"), Err(VmError::NotFound));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_round_robin() {
        let vm = testing::test_vm(2);
        let reg = ReclaimRegistry::new(Duration::from_millis(1));
        let (a_left, a) = counter(2);
        let (b_left, b) = counter(2);
        reg.add("a", a).unwrap();
        reg.add("b", b).unwrap();

        assert!(reg.reclaim_once(&vm));
        assert!(reg.reclaim_once(&vm));
        assert_eq!(a_left.load(Ordering::SeqCst), 1);
        assert_eq!(b_left.load(Ordering::SeqCst), 1);

        assert!(reg.reclaim_once(&vm));
        assert!(reg.reclaim_once(&vm));
        // Both exhausted
        assert!(!reg.reclaim_once(&vm));
        assert_eq!(reg.freed.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_empty_callbacks_are_skipped() {
        let vm = testing::test_vm(2);
        let reg = ReclaimRegistry::new(Duration::from_millis(1));
        let (_, empty) = counter(0);
        let (left, full) = counter(1);
        reg.add("empty", empty).unwrap();
        reg.add("full", full).unwrap();
        assert!(reg.reclaim_once(&vm));
        assert_eq!(left.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_daemon_runs_under_pressure() {
        let vm = Arc::new(testing::test_vm(4));
        let (left, cb) = counter(3);
        vm.reclaim.add("cache", cb).unwrap();

        let held: Vec<&VmPage> = (0..3)
            .map(|_| vm.alloc_page(AllocFlags::empty()).unwrap())
            .collect();
        let runner = {
            let vm = vm.clone();
            thread::spawn(move || vm.reclaim.run(&vm))
        };
        while left.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
        vm.reclaim.stop();
        runner.join().unwrap();
        for page in held {
            vm.free_page(page);
        }
        vm.reclaim.remove("cache").unwrap();
    }
}
