//! Page Daemon (Pageout)
//!
//! Pages of pageout-managed objects live on one of three kinds of queue:
//!
//! - the active list (state PGOUT);
//! - the inactive list (INACTIVE), refreshed from the active list every
//!   few generations;
//! - a ring of sync queues (SYNCQ) holding dirty pages until their timed
//!   write-back is due.
//!
//! A pinned page is on no queue (PINNED) and goes back on one at its last
//! unpin. A page chosen for eviction is LAUNDRY; one chosen from a sync
//! queue is SYNC.
//!
//! Candidates are taken in this order: the due sync queue at any pressure,
//! inactive pages at MODERATE, active pages at HIGH.
//!
//! The daemon locks page then object, trying the object lock and backing
//! off (see `Vm::page_lock_object`), because the fault path locks object
//! then page.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;

use crate::config::{VmConfig, PAGEOUT_SYNC_QUEUES};
use crate::error::PagerError;
use crate::kern::lock::SpinLock;
use crate::kern::sched;
use crate::vm::vm_object::{ObjectGuard, VmObjectId};
use crate::vm::vm_page::{PageFrames, PageId, PageMeta, PageState, VmPage};
use crate::vm::vm_pressure::{PoolSet, PressureLevel};
use crate::vm::Vm;

// ============================================================================
// Pageout Statistics
// ============================================================================

/// Pageout statistics
#[derive(Debug, Default)]
pub struct PageoutStats {
    /// Candidates taken off a queue
    pub scanned: AtomicU64,
    /// Pages written to their pager
    pub cleaned: AtomicU64,
    /// Pages freed
    pub reclaimed: AtomicU64,
    /// Pages put back after a write-back or because they were pinned
    pub kept: AtomicU64,
    /// Pages moved to the inactive list
    pub deactivated: AtomicU64,
    /// Failed write-backs
    pub write_errors: AtomicU64,
    /// Candidates whose object was already gone
    pub orphaned: AtomicU64,
}

/// Snapshot of pageout daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageoutSnapshot {
    pub state: DaemonState,
    pub active: usize,
    pub inactive: usize,
    pub syncq: usize,
    pub scanned: u64,
    pub cleaned: u64,
    pub reclaimed: u64,
    pub kept: u64,
    pub deactivated: u64,
    pub write_errors: u64,
}

// ============================================================================
// Pageout Daemon State
// ============================================================================

/// Pageout daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DaemonState {
    /// Daemon not started
    Stopped = 0,
    /// Daemon sleeping (waiting for work)
    Sleeping = 1,
    /// Daemon running (scanning pages)
    Running = 2,
}

impl DaemonState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Sleeping,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// How soon a dirty page should be written back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWhen {
    /// After the sync interval
    Normal,
    /// On the next pass
    Now,
}

struct Queues {
    active: VecDeque<PageId>,
    inactive: VecDeque<PageId>,
    syncq: [VecDeque<PageId>; PAGEOUT_SYNC_QUEUES],
    /// Sync queue that is due
    cur: usize,
    /// When `cur` became due
    slot_start: Duration,
}

impl Queues {
    fn slot(&self, when: SyncWhen) -> usize {
        match when {
            SyncWhen::Now => self.cur,
            SyncWhen::Normal => (self.cur + PAGEOUT_SYNC_QUEUES - 1) % PAGEOUT_SYNC_QUEUES,
        }
    }

    /// Take `page` off whatever queue its state says it is on
    fn unlink(&mut self, page: &VmPage) {
        let queue = match page.state() {
            PageState::Pgout => &mut self.active,
            PageState::Inactive => &mut self.inactive,
            PageState::Syncq => match page.meta() {
                PageMeta::Syncq(slot) => &mut self.syncq[slot as usize],
                other => panic!("pageout: page {} on sync queue with {:?}", page.id().0, other),
            },
            _ => return,
        };
        let pos = queue
            .iter()
            .position(|id| *id == page.id())
            .unwrap_or_else(|| panic!("pageout: page {} not on its {:?} queue", page.id().0, page.state()));
        queue.remove(pos);
    }

    /// Put an unpinned page back: on its pending sync queue, else active
    fn enqueue(&mut self, page: &VmPage) {
        match page.meta() {
            PageMeta::Syncq(slot) => {
                self.syncq[slot as usize].push_back(page.id());
                page.set_state(PageState::Syncq);
            }
            _ => {
                self.active.push_back(page.id());
                page.set_state(PageState::Pgout);
            }
        }
    }
}

// ============================================================================
// Pageout Daemon
// ============================================================================

/// The pageout daemon
pub struct PageoutDaemon {
    queues: SpinLock<Queues>,
    state: AtomicU32,
    stop: AtomicBool,
    generation: AtomicU32,
    pub stats: PageoutStats,
    sync_slot: Duration,
    inactive_period: u32,
    delay_moderate: Duration,
    delay_low: Duration,
}

impl PageoutDaemon {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            queues: SpinLock::new(Queues {
                active: VecDeque::new(),
                inactive: VecDeque::new(),
                syncq: core::array::from_fn(|_| VecDeque::new()),
                cur: 0,
                slot_start: sched::now(),
            }),
            state: AtomicU32::new(DaemonState::Stopped as u32),
            stop: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            stats: PageoutStats::default(),
            sync_slot: config.sync_slot(),
            inactive_period: config.pageout_inactive_period.max(1),
            delay_moderate: config.pageout_delay_moderate,
            delay_low: config.pageout_delay_low,
        }
    }

    /// Start tracking a page
    pub fn add(&self, page: &VmPage) {
        let mut q = self.queues.lock();
        page.set_meta(PageMeta::None);
        if page.pincnt() > 0 {
            page.set_state(PageState::Pinned);
        } else {
            q.enqueue(page);
        }
    }

    /// First pin on a tracked page: take it off its queue
    ///
    /// A pending sync slot is kept in the page metadata.
    pub fn pin(&self, page: &VmPage) {
        let mut q = self.queues.lock();
        match page.state() {
            PageState::Pgout | PageState::Inactive | PageState::Syncq => {
                q.unlink(page);
                page.set_state(PageState::Pinned);
            }
            _ => {}
        }
    }

    /// Last unpin on a tracked page: queue it again
    pub fn unpin(&self, page: &VmPage) {
        let mut q = self.queues.lock();
        if page.pincnt() == 0 && page.state() == PageState::Pinned {
            q.enqueue(page);
        }
    }

    /// Schedule write-back of a dirty page
    pub fn sync_needed(&self, page: &VmPage, when: SyncWhen) {
        let mut q = self.queues.lock();
        let slot = q.slot(when);
        match page.state() {
            PageState::Pgout | PageState::Inactive => {
                q.unlink(page);
                page.set_meta(PageMeta::Syncq(slot as u8));
                q.enqueue(page);
            }
            PageState::Syncq if when == SyncWhen::Now => {
                q.unlink(page);
                page.set_meta(PageMeta::Syncq(slot as u8));
                q.enqueue(page);
            }
            PageState::Pinned => {
                if when == SyncWhen::Now || page.meta() == PageMeta::None {
                    page.set_meta(PageMeta::Syncq(slot as u8));
                }
            }
            _ => {}
        }
    }

    /// Stop tracking a page that is not in flight
    ///
    /// Returns false, leaving the page alone, while it is being written.
    fn untrack(&self, page: &VmPage) -> bool {
        let mut q = self.queues.lock();
        match page.state() {
            PageState::Laundry | PageState::Sync => return false,
            PageState::Pgout | PageState::Inactive | PageState::Syncq => q.unlink(page),
            PageState::Pinned => {}
            _ => return true,
        }
        page.set_meta(PageMeta::None);
        page.set_state(PageState::Normal);
        true
    }

    /// Put a page back after a write-back that did not free it
    fn requeue(&self, page: &VmPage, retry_sync: bool) {
        let mut q = self.queues.lock();
        let meta = if retry_sync {
            PageMeta::Syncq(q.slot(SyncWhen::Normal) as u8)
        } else {
            PageMeta::None
        };
        page.set_meta(meta);
        if page.pincnt() > 0 {
            page.set_state(PageState::Pinned);
        } else {
            q.enqueue(page);
        }
    }

    /// Move the whole active list to the tail of the inactive list
    pub fn inactive_update(&self, frames: &PageFrames) {
        let mut q = self.queues.lock();
        let n = q.active.len();
        while let Some(id) = q.active.pop_front() {
            frames.page(id).set_state(PageState::Inactive);
            q.inactive.push_back(id);
        }
        drop(q);
        self.stats.deactivated.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Advance the sync ring to the slot that is due now
    fn tick(&self, q: &mut Queues, now: Duration) {
        if self.sync_slot.is_zero() {
            return;
        }
        while now >= q.slot_start + self.sync_slot && q.syncq[q.cur].is_empty() {
            q.cur = (q.cur + 1) % PAGEOUT_SYNC_QUEUES;
            q.slot_start += self.sync_slot;
        }
    }

    /// Pick the next candidate for `level`
    pub fn choose<'a>(&self, frames: &'a PageFrames, level: PressureLevel) -> Option<&'a VmPage> {
        let mut q = self.queues.lock();
        self.tick(&mut q, sched::now());

        let cur = q.cur;
        if let Some(id) = q.syncq[cur].pop_front() {
            let page = frames.page(id);
            page.set_meta(PageMeta::None);
            page.set_state(PageState::Sync);
            return Some(page);
        }

        let mut id = None;
        if level >= PressureLevel::Moderate {
            id = q.inactive.pop_front();
        }
        if id.is_none() && level == PressureLevel::High {
            id = q.active.pop_front();
            // Out of clean candidates: pull sync pages forward
            for i in 1..PAGEOUT_SYNC_QUEUES {
                if id.is_some() {
                    break;
                }
                id = q.syncq[(cur + i) % PAGEOUT_SYNC_QUEUES].pop_front();
            }
        }
        let page = frames.page(id?);
        page.set_meta(PageMeta::None);
        page.set_state(PageState::Laundry);
        Some(page)
    }

    /// Number of pages on (active, inactive, sync) queues
    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        let q = self.queues.lock();
        (
            q.active.len(),
            q.inactive.len(),
            q.syncq.iter().map(VecDeque::len).sum(),
        )
    }

    pub fn state(&self) -> DaemonState {
        DaemonState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_daemon_state(&self, state: DaemonState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Ask a running daemon to return from `run`
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> PageoutSnapshot {
        let (active, inactive, syncq) = self.queue_lengths();
        PageoutSnapshot {
            state: self.state(),
            active,
            inactive,
            syncq,
            scanned: self.stats.scanned.load(Ordering::Relaxed),
            cleaned: self.stats.cleaned.load(Ordering::Relaxed),
            reclaimed: self.stats.reclaimed.load(Ordering::Relaxed),
            kept: self.stats.kept.load(Ordering::Relaxed),
            deactivated: self.stats.deactivated.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
        }
    }

    /// One step: refresh the inactive list when due, then handle at most
    /// one candidate. Returns false if there was nothing to do.
    pub fn run_once(&self, vm: &Vm) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        if generation % self.inactive_period == 0 {
            self.inactive_update(&vm.frames);
        }

        let level = vm.pressure.pressure(PoolSet::PHYS);
        let Some(page) = self.choose(&vm.frames, level) else {
            return false;
        };
        self.stats.scanned.fetch_add(1, Ordering::Relaxed);
        log::debug!("pageout: page {} chosen at {:?}", page.id().0, level);
        vm.pageout_page(page);
        true
    }

    /// Daemon loop; returns after [`PageoutDaemon::stop`]
    pub fn run(&self, vm: &Vm) {
        self.stop.store(false, Ordering::Release);
        self.set_daemon_state(DaemonState::Running);
        log::info!("pageout: daemon started");

        while !self.stop.load(Ordering::Acquire) {
            if self.run_once(vm) {
                continue;
            }
            self.set_daemon_state(DaemonState::Sleeping);
            if vm.pressure.pressure(PoolSet::PHYS) >= PressureLevel::Moderate {
                sched::sleep(self.delay_moderate);
            } else {
                vm.pressure.wait_for_pressure(
                    PoolSet::PHYS,
                    PressureLevel::Moderate,
                    Some(self.delay_low),
                );
            }
            self.set_daemon_state(DaemonState::Running);
        }

        self.set_daemon_state(DaemonState::Stopped);
        log::info!("pageout: daemon stopped");
    }
}

impl core::fmt::Debug for PageoutDaemon {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageoutDaemon")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// ============================================================================
// Eviction
// ============================================================================

impl Vm {
    /// Take a page out of pageout tracking
    ///
    /// The caller holds the object lock and a pin on the page. A write-back
    /// in flight is waited for with the object lock dropped. Returns true
    /// if it had to wait.
    pub fn pageout_rem(&self, obj: &mut ObjectGuard, page: &VmPage) -> bool {
        let mut waited = false;
        while !self.pageout.untrack(page) {
            waited = true;
            obj.unlocked(|| {
                page.wait_while(|state, _| matches!(state, PageState::Laundry | PageState::Sync))
            });
        }
        waited
    }

    /// Evict or write back one candidate
    pub(crate) fn pageout_page(&self, page: &VmPage) {
        let Some(mut obj) = self.page_lock_object(page) else {
            self.pageout_orphan(page);
            return;
        };

        if page.pincnt() > 0 {
            self.pageout.requeue(page, false);
            self.pageout.stats.kept.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let was_dirty = page.is_dirty();
        let result = self.pager_pageout(&mut obj, page);
        if was_dirty && result.is_ok() {
            self.pageout.stats.cleaned.fetch_add(1, Ordering::Relaxed);
        }
        self.pageout_done(&mut obj, page, result);
    }

    /// Free a candidate whose object was dropped without being destroyed
    fn pageout_orphan(&self, page: &VmPage) {
        if page.pincnt() > 0 {
            self.pageout.requeue(page, false);
            return;
        }
        log::warn!("pageout: page {} has no live owner, freeing it", page.id().0);
        self.pageout.stats.orphaned.fetch_add(1, Ordering::Relaxed);
        let (owner, _) = page.owner_key();
        if owner != VmObjectId::NULL {
            self.pghash.remove(owner, page);
        }
        page.clean();
        page.set_meta(PageMeta::None);
        page.set_state(PageState::Normal);
        self.free_page(page);
    }

    /// Finish a write-back: keep the page or free it
    ///
    /// A page is kept when the write failed, when someone pinned it
    /// meanwhile, or when it came off a sync queue and memory is not short.
    fn pageout_done(&self, obj: &mut ObjectGuard, page: &VmPage, result: Result<(), PagerError>) {
        if result.is_ok() && page.clean() {
            obj.note_clean();
        }
        let level = self.pressure.pressure(PoolSet::PHYS);
        let keep = result.is_err()
            || page.pincnt() > 0
            || (page.state() == PageState::Sync && level <= PressureLevel::Moderate);
        page.clear_busy();

        if keep {
            if result.is_err() {
                self.pageout.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            }
            self.pageout.requeue(page, result.is_err());
            self.pageout.stats.kept.fetch_add(1, Ordering::Relaxed);
            log::debug!("pageout: page {} kept", page.id().0);
        } else {
            page.set_meta(PageMeta::None);
            page.set_state(PageState::Normal);
            self.object_page_remove(obj, page);
            self.free_page(page);
            self.pageout.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
            log::debug!("pageout: page {} freed", page.id().0);
        }
    }
}
