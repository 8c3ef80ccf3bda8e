//! VM Fault - Page Fault Handling
//!
//! Resolves (object, offset, access) to a resident, pinned page. A hit in
//! the page cache pins the page and waits out any I/O in flight on it. A
//! miss allocates a busy page, enters it in the cache so that concurrent
//! faults find it, and asks the pager to fill it with the object lock
//! dropped. Two faults on the same key therefore always end on the same
//! page. A shadow object is filled by copying from its chain instead of
//! asking a pager.
//!
//! Lock order on this path is object, then page.

use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::vm::pmap::VmProt;
use crate::vm::vm_object::VmObject;
use crate::vm::vm_page::{trunc_page, VmPage};
use crate::vm::vm_pageout::SyncWhen;
use crate::vm::vm_pager::PagerFlags;
use crate::vm::vm_pghash::PageTag;
use crate::vm::Vm;

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
#[derive(Debug)]
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Resolved from the page cache
    pub resident: AtomicU64,
    /// Filled by the pager
    pub page_in: AtomicU64,
    /// Filled by copying from further down a shadow chain
    pub copies: AtomicU64,
    /// Lookups restarted after a failed or raced I/O
    pub retries: AtomicU64,
    /// Waits for free memory before retrying
    pub memory_waits: AtomicU64,
    /// Failed faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            resident: AtomicU64::new(0),
            page_in: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            memory_waits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_resident(&self) {
        self.resident.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_page_in(&self) {
        self.page_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_copies(&self) {
        self.copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_memory_waits(&self) {
        self.memory_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pinned Page Reference
// ============================================================================

/// A page held by one pin, released on drop
pub struct PageRef<'a> {
    vm: &'a Vm,
    page: &'a VmPage,
}

impl<'a> PageRef<'a> {
    /// Take over a pin the caller already holds
    pub(crate) fn adopt(vm: &'a Vm, page: &'a VmPage) -> Self {
        Self { vm, page }
    }

    /// Take a new pin on `page`
    pub fn pin(vm: &'a Vm, page: &'a VmPage) -> Self {
        vm.page_pin(page);
        Self { vm, page }
    }

    pub fn page(&self) -> &'a VmPage {
        self.page
    }
}

impl Deref for PageRef<'_> {
    type Target = VmPage;

    fn deref(&self) -> &VmPage {
        self.page
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.vm.page_unpin(self.page);
    }
}

impl core::fmt::Debug for PageRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PageRef").field(&self.page.id()).finish()
    }
}

// ============================================================================
// Object Fault
// ============================================================================

/// Make `offset` of `object` resident and return it pinned
///
/// A write access marks the page dirty. `NoMemory` is transient: the caller
/// may wait for free frames and retry. `Io` and `NotFound` come from the
/// pager and `Fault` means the offset is past the end of the object.
pub fn object_fault<'a>(
    vm: &'a Vm,
    object: &Arc<VmObject>,
    offset: u64,
    access: VmProt,
) -> VmResult<PageRef<'a>> {
    vm.fault_stats.incr_total();
    let offset = trunc_page(offset);
    let mut obj = object.lock();

    loop {
        if obj.is_dead() || offset >= obj.size() {
            vm.fault_stats.incr_failures();
            return Err(VmError::Fault);
        }

        let page = match vm.pghash.lookup(&vm.frames, obj.id(), offset) {
            Some((page, tag)) => {
                vm.page_pin(page);
                if tag == PageTag::Pager {
                    vm.pghash.retag(page, PageTag::Page);
                }
                if page.is_busy() {
                    let ok = obj.unlocked(|| page.busy_wait());
                    if !ok || page.owner_key().0 != obj.id() {
                        vm.page_unpin(page);
                        vm.fault_stats.incr_retries();
                        continue;
                    }
                }
                vm.fault_stats.incr_resident();
                page
            }
            None => {
                let filled = if obj.is_shadow() {
                    vm.shadow_fault(&mut obj, offset)
                } else {
                    vm.pager_pagein(&mut obj, offset)
                };
                let page = match filled {
                    Ok(page) => page,
                    Err(VmError::NoMemory) => return Err(VmError::NoMemory),
                    Err(e) => {
                        vm.fault_stats.incr_failures();
                        return Err(e);
                    }
                };
                if page.owner_key().0 != obj.id() {
                    // Evicted while the pager was filling it
                    vm.page_unpin(page);
                    vm.fault_stats.incr_retries();
                    continue;
                }
                vm.fault_stats.incr_page_in();
                page
            }
        };

        if access.contains(VmProt::WRITE) && page.dirty() {
            obj.note_dirty();
            if obj.object().pager().flags().contains(PagerFlags::PAGEOUT) {
                vm.pageout.sync_needed(page, SyncWhen::Normal);
            }
        }
        return Ok(PageRef::adopt(vm, page));
    }
}
