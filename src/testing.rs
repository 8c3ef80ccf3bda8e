//! Host test harness: a scheduler on std threads, a recording pmap, an
//! in-memory backing store, and private VM instances.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Mutex, OnceLock};
use std::thread::{self, Thread};
use std::time::Instant;

use crate::config::VmConfig;
use crate::error::PagerError;
use crate::kern::sched::{self, ContextId, Scheduler};
use crate::vm::pmap::{Pmap, PmapError, SpaceId, VmProt};
use crate::vm::vm_page::PAGE_SIZE;
use crate::vm::vm_pager::BackingStore;
use crate::vm::Vm;

// ============================================================================
// Scheduler
// ============================================================================

/// Scheduler on std threads: contexts are threads, blocking is parking
struct StdScheduler {
    threads: Mutex<BTreeMap<usize, Thread>>,
    epoch: Instant,
}

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(2);

thread_local! {
    static CONTEXT: Cell<usize> = const { Cell::new(0) };
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

impl StdScheduler {
    fn context(&self) -> usize {
        CONTEXT.with(|ctx| {
            if ctx.get() == 0 {
                let id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
                ctx.set(id);
                if let Ok(mut threads) = self.threads.lock() {
                    threads.insert(id, thread::current());
                }
            }
            ctx.get()
        })
    }
}

impl Scheduler for StdScheduler {
    fn current(&self) -> ContextId {
        ContextId(self.context())
    }

    fn block(&self, timeout: Option<Duration>) {
        self.context();
        match timeout {
            Some(t) => thread::park_timeout(t),
            None => thread::park(),
        }
    }

    fn wake(&self, ctx: ContextId) {
        let thread = self
            .threads
            .lock()
            .ok()
            .and_then(|threads| threads.get(&ctx.0).cloned());
        if let Some(thread) = thread {
            thread.unpark();
        }
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn critical_enter(&self) {
        DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn critical_leave(&self) {
        DEPTH.with(|d| {
            if d.get() == 0 {
                panic!("sched: critical_leave without critical_enter");
            }
            d.set(d.get() - 1)
        });
    }

    fn critical_depth(&self) -> u32 {
        DEPTH.with(Cell::get)
    }
}

/// Install the std-thread scheduler; every test touching locks calls this
pub fn setup() {
    static SCHED: OnceLock<StdScheduler> = OnceLock::new();
    let scheduler = SCHED.get_or_init(|| StdScheduler {
        threads: Mutex::new(BTreeMap::new()),
        epoch: Instant::now(),
    });
    sched::install(scheduler);
}

// ============================================================================
// Recording Pmap
// ============================================================================

/// Pmap that keeps translations in a map and remembers every unmap
#[derive(Default)]
pub struct RecordingPmap {
    entries: Mutex<BTreeMap<(SpaceId, u64), (u64, VmProt)>>,
    unmapped: Mutex<Vec<(SpaceId, u64)>>,
}

impl RecordingPmap {
    /// (space, vaddr) of every page unmapped so far
    pub fn unmapped(&self) -> Vec<(SpaceId, u64)> {
        self.unmapped.lock().map(|u| u.clone()).unwrap_or_default()
    }

    /// Protection of the translation at `vaddr`
    pub fn prot_of(&self, space: SpaceId, vaddr: u64) -> Option<VmProt> {
        let entries = self.entries.lock().ok()?;
        entries.get(&(space, vaddr & !(PAGE_SIZE as u64 - 1))).map(|e| e.1)
    }
}

impl Pmap for RecordingPmap {
    fn map(&self, space: SpaceId, vaddr: u64, paddr: u64, prot: VmProt) -> Result<(), PmapError> {
        let mut entries = self.entries.lock().map_err(|_| PmapError::NoMemory)?;
        entries.insert((space, vaddr), (paddr, prot));
        Ok(())
    }

    fn unmap(&self, space: SpaceId, vaddr: u64, size: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            let keys: Vec<_> = entries
                .range((space, vaddr)..(space, vaddr + size))
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                entries.remove(&key);
            }
        }
        if let Ok(mut unmapped) = self.unmapped.lock() {
            let mut va = vaddr;
            while va < vaddr + size {
                unmapped.push((space, va));
                va += PAGE_SIZE as u64;
            }
        }
    }

    fn translate(&self, space: SpaceId, vaddr: u64) -> Option<u64> {
        let page = vaddr & !(PAGE_SIZE as u64 - 1);
        let entries = self.entries.lock().ok()?;
        entries
            .get(&(space, page))
            .map(|(paddr, _)| paddr + (vaddr - page))
    }
}

// ============================================================================
// In-memory Backing Store
// ============================================================================

/// A file held in memory, with switches for failures and slow writes
#[derive(Default)]
pub struct MemStore {
    data: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delay: Mutex<Duration>,
}

impl MemStore {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BackingStore for MemStore {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PagerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PagerError::Io);
        }
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, PagerError> {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PagerError::Io);
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
}

// ============================================================================
// VM Instances
// ============================================================================

/// A private VM over `npages` leaked, page-aligned host pages
pub fn test_vm(npages: usize) -> Vm {
    test_vm_with_pmap(npages).0
}

/// Like [`test_vm`], also handing back the pmap
pub fn test_vm_with_pmap(npages: usize) -> (Vm, Arc<RecordingPmap>) {
    setup();
    let layout = std::alloc::Layout::from_size_align(npages.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap();
    let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
    let pmap = Arc::new(RecordingPmap::default());
    let vm = unsafe { Vm::new(base, 0x8000_0000, npages, pmap.clone(), VmConfig::default()) };
    (vm, pmap)
}

// ============================================================================
// Random Numbers
// ============================================================================

/// Deterministic xorshift64 generator
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}
