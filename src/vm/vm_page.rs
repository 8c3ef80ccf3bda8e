//! VM Page Management - Physical Page Frames
//!
//! One [`VmPage`] descriptor exists per physical frame. Descriptors live in
//! a fixed array owned by [`PageFrames`]; they are never created or
//! destroyed after boot, only re-tagged.
//!
//! ## State word
//!
//! Each descriptor packs its [`PageState`] and its [`PageFlags`] into a
//! single atomic word so that waiters can sleep on any change of either.
//! The state occupies bits 0..4 and the flags start at bit 4; the two
//! ranges never overlap. Flags change with atomic or/and operations; the
//! state changes with a compare-and-swap that preserves the flags.
//!
//! ## Pin and busy
//!
//! A pin is a reference that keeps the page out of pageout. Busy marks
//! in-flight I/O; it ends either with `clear_busy` (success) or
//! `mark_error` (failure), and `busy_wait` reports which. The LOCKED flag
//! is a short exclusive window used while the page's owner changes.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{VmError, VmResult};
use crate::kern::futex::{kern_wait, kern_wake};
use crate::kern::lock::SpinLock;
use crate::vm::vm_object::{VmObject, VmObjectId};
use crate::vm::vm_pressure::Pool;
use crate::vm::Vm;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask of the offset bits inside a page
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Largest pin count a page can hold
pub const PIN_MAX: u32 = u16::MAX as u32;

/// Truncate to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Number of pages covering `size` bytes
pub const fn atop(size: u64) -> u64 {
    round_page(size) >> PAGE_SHIFT
}

// ============================================================================
// Page State and Flags
// ============================================================================

/// Bits of the state word holding the page state
const STATE_MASK: u32 = 0xF;

/// Page state
///
/// Mutually exclusive. The last six are owned by the pageout daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// On the free list
    Free = 0,
    /// Allocated, not tracked by pageout
    Normal = 1,
    /// Backs a slab
    Slab = 2,
    /// Backs a large heap allocation
    Malloc = 3,
    /// On the active list
    Pgout = 4,
    /// On the inactive list
    Inactive = 5,
    /// Tracked by pageout, but pinned and off every list
    Pinned = 6,
    /// Being written back after being chosen from a list
    Laundry = 7,
    /// Waiting on a sync queue for timed write-back
    Syncq = 8,
    /// Being written back from a sync queue
    Sync = 9,
}

impl PageState {
    fn from_bits(bits: u32) -> Self {
        match bits & STATE_MASK {
            0 => Self::Free,
            1 => Self::Normal,
            2 => Self::Slab,
            3 => Self::Malloc,
            4 => Self::Pgout,
            5 => Self::Inactive,
            6 => Self::Pinned,
            7 => Self::Laundry,
            8 => Self::Syncq,
            9 => Self::Sync,
            other => panic!("page: corrupt state {}", other),
        }
    }

    /// Is this one of the states owned by the pageout daemon?
    pub fn is_pageout(self) -> bool {
        matches!(
            self,
            Self::Pgout | Self::Inactive | Self::Pinned | Self::Laundry | Self::Syncq | Self::Sync
        )
    }
}

bitflags! {
    /// Page flags, stored above the state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Modified since last write-back
        const DIRTY = 1 << 4;
        /// I/O in flight
        const BUSY = 1 << 5;
        /// I/O failed; the page is freed on the last unpin
        const ERROR = 1 << 6;
        /// Free on the last unpin
        const DEALLOC = 1 << 7;
        /// Short exclusive window
        const LOCKED = 1 << 8;
    }
}

bitflags! {
    /// Page allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Zero-fill the memory
        const ZERO = 1 << 0;
        /// Sleep until memory is available instead of failing
        const WAIT = 1 << 1;
    }
}

// ============================================================================
// Page Identity, Ownership and Metadata
// ============================================================================

/// Index of a page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

/// Owner back-reference of a page
///
/// `key` is the page-aligned object offset with the page-cache type tag in
/// its low bits.
#[derive(Debug, Clone)]
pub struct PageOwner {
    pub object: Weak<VmObject>,
    pub id: VmObjectId,
    pub key: u64,
}

impl PageOwner {
    pub fn none() -> Self {
        Self {
            object: Weak::new(),
            id: VmObjectId::NULL,
            key: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.key & !PAGE_MASK
    }
}

/// Allocation metadata, meaning depends on the page state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMeta {
    None,
    /// Slab page: owning pool and slab slot
    Slab { pool: u32, slab: u32 },
    /// First frame of a large heap allocation
    Malloc { size: usize, npages: u32 },
    /// Sync queue the page sits on
    Syncq(u8),
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Physical page descriptor
#[derive(Debug)]
pub struct VmPage {
    id: PageId,
    /// State (bits 0..4) and PageFlags
    word: AtomicU32,
    /// Pin count
    pincnt: AtomicU32,
    /// Owner; changes only under the owning object's lock
    owner: spin::Mutex<PageOwner>,
    /// Allocation metadata
    meta: spin::Mutex<PageMeta>,
}

impl VmPage {
    fn new(id: PageId) -> Self {
        Self {
            id,
            word: AtomicU32::new(PageState::Free as u32),
            pincnt: AtomicU32::new(0),
            owner: spin::Mutex::new(PageOwner::none()),
            meta: spin::Mutex::new(PageMeta::None),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    // ------------------------------------------------------------------------
    // State and flags
    // ------------------------------------------------------------------------

    pub fn state(&self) -> PageState {
        PageState::from_bits(self.word.load(Ordering::SeqCst))
    }

    /// Change the state, keeping the flags, and wake state waiters
    pub fn set_state(&self, state: PageState) {
        let mut cur = self.word.load(Ordering::SeqCst);
        loop {
            let new = (cur & !STATE_MASK) | state as u32;
            match self
                .word
                .compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        log::trace!("page {}: {:?} -> {:?}", self.id.0, PageState::from_bits(cur), state);
        kern_wake(&self.word, usize::MAX);
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.word.load(Ordering::SeqCst))
    }

    fn set_flags(&self, flags: PageFlags) -> PageFlags {
        PageFlags::from_bits_truncate(self.word.fetch_or(flags.bits(), Ordering::SeqCst))
    }

    fn clear_flags(&self, flags: PageFlags) -> PageFlags {
        PageFlags::from_bits_truncate(self.word.fetch_and(!flags.bits(), Ordering::SeqCst))
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    /// Set DIRTY; returns true if the page was clean
    pub fn dirty(&self) -> bool {
        !self.set_flags(PageFlags::DIRTY).contains(PageFlags::DIRTY)
    }

    /// Clear DIRTY; returns true if the page was dirty
    pub fn clean(&self) -> bool {
        self.clear_flags(PageFlags::DIRTY).contains(PageFlags::DIRTY)
    }

    /// Request that the last unpin frees the page
    pub fn set_dealloc(&self) {
        self.set_flags(PageFlags::DEALLOC);
    }

    // ------------------------------------------------------------------------
    // Pin count
    // ------------------------------------------------------------------------

    pub fn pincnt(&self) -> u32 {
        self.pincnt.load(Ordering::SeqCst)
    }

    /// Raw increment; returns the previous count
    fn pin_ref(&self) -> u32 {
        let old = self.pincnt.fetch_add(1, Ordering::SeqCst);
        if old >= PIN_MAX {
            panic!("page {}: pin count overflow", self.id.0);
        }
        old
    }

    /// Raw decrement; returns the previous count
    fn unpin_ref(&self) -> u32 {
        let old = self.pincnt.fetch_sub(1, Ordering::SeqCst);
        if old == 0 {
            panic!("page {}: unpin of unpinned page", self.id.0);
        }
        old
    }

    // ------------------------------------------------------------------------
    // Busy / error
    // ------------------------------------------------------------------------

    pub fn is_busy(&self) -> bool {
        self.flags().contains(PageFlags::BUSY)
    }

    /// Mark I/O in flight
    pub fn mark_busy(&self) {
        let old = self.set_flags(PageFlags::BUSY);
        if old.contains(PageFlags::BUSY) {
            panic!("page {}: already busy", self.id.0);
        }
    }

    /// Complete I/O successfully and wake waiters
    pub fn clear_busy(&self) {
        let old = self.clear_flags(PageFlags::BUSY);
        if !old.contains(PageFlags::BUSY) || old.contains(PageFlags::ERROR) {
            panic!("page {}: clear_busy with flags {:?}", self.id.0, old);
        }
        kern_wake(&self.word, usize::MAX);
    }

    /// Complete I/O with an error and wake waiters
    pub fn mark_error(&self) {
        self.set_flags(PageFlags::ERROR);
        kern_wake(&self.word, usize::MAX);
    }

    /// Sleep until busy clears; returns false if the I/O failed
    pub fn busy_wait(&self) -> bool {
        loop {
            let word = self.word.load(Ordering::SeqCst);
            let flags = PageFlags::from_bits_truncate(word);
            if flags & (PageFlags::BUSY | PageFlags::ERROR) != PageFlags::BUSY {
                return !flags.contains(PageFlags::ERROR);
            }
            let _ = kern_wait(&self.word, word as u64, None);
        }
    }

    /// Sleep while the state word satisfies `pred`
    pub fn wait_while<F: Fn(PageState, PageFlags) -> bool>(&self, pred: F) {
        loop {
            let word = self.word.load(Ordering::SeqCst);
            if !pred(PageState::from_bits(word), PageFlags::from_bits_truncate(word)) {
                return;
            }
            let _ = kern_wait(&self.word, word as u64, None);
        }
    }

    // ------------------------------------------------------------------------
    // Page lock
    // ------------------------------------------------------------------------

    /// Take the page lock
    pub fn lock(&self) {
        loop {
            let old = self.set_flags(PageFlags::LOCKED);
            if !old.contains(PageFlags::LOCKED) {
                return;
            }
            let word = self.word.load(Ordering::SeqCst);
            if word & PageFlags::LOCKED.bits() != 0 {
                let _ = kern_wait(&self.word, word as u64, None);
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        !self.set_flags(PageFlags::LOCKED).contains(PageFlags::LOCKED)
    }

    pub fn unlock(&self) {
        let old = self.clear_flags(PageFlags::LOCKED);
        if !old.contains(PageFlags::LOCKED) {
            panic!("page {}: unlock of unlocked page", self.id.0);
        }
        kern_wake(&self.word, usize::MAX);
    }

    pub fn is_locked(&self) -> bool {
        self.flags().contains(PageFlags::LOCKED)
    }

    // ------------------------------------------------------------------------
    // Owner and metadata
    // ------------------------------------------------------------------------

    pub fn owner(&self) -> PageOwner {
        self.owner.lock().clone()
    }

    /// Owning object id and key, without touching the weak count
    pub fn owner_key(&self) -> (VmObjectId, u64) {
        let owner = self.owner.lock();
        (owner.id, owner.key)
    }

    /// Owning object, if it is still alive
    pub fn object(&self) -> Option<Arc<VmObject>> {
        self.owner.lock().object.upgrade()
    }

    pub fn set_owner(&self, owner: PageOwner) {
        *self.owner.lock() = owner;
    }

    pub fn clear_owner(&self) {
        *self.owner.lock() = PageOwner::none();
    }

    pub fn meta(&self) -> PageMeta {
        *self.meta.lock()
    }

    pub fn set_meta(&self, meta: PageMeta) {
        *self.meta.lock() = meta;
    }
}

// ============================================================================
// Page Frames
// ============================================================================

/// The page descriptor array and its free bitmap
pub struct PageFrames {
    /// Kernel virtual address of frame 0 (direct map)
    base: NonNull<u8>,
    /// Physical address of frame 0
    phys_base: u64,
    pages: Vec<VmPage>,
    /// One bit per frame, set when free
    free: SpinLock<FreeMap>,
}

struct FreeMap {
    bits: Vec<u64>,
    count: usize,
    hint: usize,
}

impl FreeMap {
    fn is_free(&self, i: usize) -> bool {
        self.bits[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) {
        self.bits[i / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: usize) {
        self.bits[i / 64] &= !(1 << (i % 64));
    }
}

unsafe impl Send for PageFrames {}
unsafe impl Sync for PageFrames {}

impl PageFrames {
    /// Manage `npages` frames starting at `base`
    ///
    /// # Safety
    ///
    /// `base` must be page aligned, direct-mapped, and valid for reads and
    /// writes of `npages * PAGE_SIZE` bytes for the lifetime of the frames.
    pub unsafe fn new(base: NonNull<u8>, phys_base: u64, npages: usize) -> Self {
        let pages = (0..npages).map(|i| VmPage::new(PageId(i as u32))).collect();
        let mut bits = alloc::vec![0u64; npages.div_ceil(64)];
        for i in 0..npages {
            bits[i / 64] |= 1 << (i % 64);
        }
        Self {
            base,
            phys_base,
            pages,
            free: SpinLock::new(FreeMap {
                bits,
                count: npages,
                hint: 0,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.pages.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().count
    }

    pub fn page(&self, id: PageId) -> &VmPage {
        &self.pages[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmPage> {
        self.pages.iter()
    }

    /// Kernel virtual address of a page
    pub fn page_to_addr(&self, page: &VmPage) -> usize {
        self.base.as_ptr() as usize + page.id.0 as usize * PAGE_SIZE
    }

    /// Physical address of a page
    pub fn page_to_phys(&self, page: &VmPage) -> u64 {
        self.phys_base + (page.id.0 as u64) * PAGE_SIZE as u64
    }

    /// Page containing a kernel virtual address
    pub fn addr_to_page(&self, addr: usize) -> Option<&VmPage> {
        let base = self.base.as_ptr() as usize;
        if addr < base {
            return None;
        }
        self.pages.get((addr - base) / PAGE_SIZE)
    }

    /// Page containing a physical address
    pub fn phys_to_page(&self, paddr: u64) -> Option<&VmPage> {
        if paddr < self.phys_base {
            return None;
        }
        self.pages.get(((paddr - self.phys_base) >> PAGE_SHIFT) as usize)
    }

    /// Contents of a page
    ///
    /// # Safety
    ///
    /// The caller must own the page contents: the page is busy, freshly
    /// allocated, or otherwise unreachable by other writers.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_bytes(&self, page: &VmPage) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.page_to_addr(page) as *mut u8, PAGE_SIZE)
    }

    /// Zero a whole page
    pub fn zero(&self, page: &VmPage) {
        self.zero_range(page, 0, PAGE_SIZE);
    }

    /// Zero `len` bytes at `offset` inside a page
    pub fn zero_range(&self, page: &VmPage, offset: usize, len: usize) {
        if offset + len > PAGE_SIZE {
            panic!("page {}: zero_range {}+{} past end", page.id.0, offset, len);
        }
        unsafe {
            core::ptr::write_bytes((self.page_to_addr(page) + offset) as *mut u8, 0, len);
        }
    }

    /// Take one frame off the free bitmap
    fn take(&self) -> Option<&VmPage> {
        let mut map = self.free.lock();
        if map.count == 0 {
            return None;
        }
        let words = map.bits.len();
        for n in 0..words {
            let w = (map.hint + n) % words;
            let word = map.bits[w];
            if word != 0 {
                let i = w * 64 + word.trailing_zeros() as usize;
                map.clear(i);
                map.count -= 1;
                map.hint = w;
                return Some(&self.pages[i]);
            }
        }
        None
    }

    /// Take `n` physically contiguous frames
    fn take_contig(&self, n: usize) -> Option<&VmPage> {
        let mut map = self.free.lock();
        if n == 0 || map.count < n {
            return None;
        }
        let mut run = 0;
        for i in 0..self.pages.len() {
            if map.is_free(i) {
                run += 1;
                if run == n {
                    let first = i + 1 - n;
                    for j in first..=i {
                        map.clear(j);
                    }
                    map.count -= n;
                    return Some(&self.pages[first]);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn put(&self, page: &VmPage) {
        let mut map = self.free.lock();
        let i = page.id.0 as usize;
        if map.is_free(i) {
            panic!("page {}: double free", i);
        }
        map.set(i);
        map.count += 1;
    }
}

impl core::fmt::Debug for PageFrames {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageFrames")
            .field("total", &self.total())
            .field("free", &self.free_count())
            .finish()
    }
}

// ============================================================================
// Allocation, Free, Pin and Unpin
// ============================================================================

impl Vm {
    /// Allocate one page in state NORMAL
    pub fn alloc_page(&self, flags: AllocFlags) -> VmResult<&VmPage> {
        loop {
            if let Some(page) = self.frames.take() {
                self.pressure.add(Pool::Phys, -(PAGE_SIZE as i64));
                page.set_state(PageState::Normal);
                if flags.contains(AllocFlags::ZERO) {
                    self.frames.zero(page);
                }
                return Ok(page);
            }
            if !flags.contains(AllocFlags::WAIT) {
                return Err(VmError::NoMemory);
            }
            log::debug!("vm: waiting for a free page");
            self.pressure
                .wait_for_free(Pool::Phys, PAGE_SIZE as u64, None);
        }
    }

    /// Allocate `n` contiguous pages; the first is returned
    pub fn alloc_contig(&self, n: usize, state: PageState) -> VmResult<&VmPage> {
        let first = self.frames.take_contig(n).ok_or(VmError::NoMemory)?;
        self.pressure
            .add(Pool::Phys, -((n * PAGE_SIZE) as i64));
        for i in 0..n {
            self.frames
                .page(PageId(first.id.0 + i as u32))
                .set_state(state);
        }
        Ok(first)
    }

    /// Return a page to the free list
    pub fn free_page(&self, page: &VmPage) {
        if page.state() == PageState::Free {
            panic!("page {}: double free", page.id.0);
        }
        let flags = page.flags();
        if flags.intersects(PageFlags::BUSY | PageFlags::LOCKED) || page.pincnt() != 0 {
            panic!(
                "page {}: freed while busy, locked or pinned ({:?}, pincnt {})",
                page.id.0,
                flags,
                page.pincnt()
            );
        }
        page.clear_flags(PageFlags::all());
        page.clear_owner();
        page.set_meta(PageMeta::None);
        page.set_state(PageState::Free);
        self.frames.put(page);
        self.pressure.add(Pool::Phys, PAGE_SIZE as i64);
    }

    /// Take a pin on a page
    ///
    /// The first pin on a page that pageout is tracking takes it off the
    /// eviction lists.
    pub fn page_pin(&self, page: &VmPage) {
        let old = page.pin_ref();
        if old == 0 && page.state().is_pageout() {
            self.pageout.pin(page);
        }
    }

    /// Drop a pin
    ///
    /// The last unpin frees the page if deallocation is pending or its I/O
    /// failed; otherwise a page tracked by pageout goes back on the active
    /// list.
    pub fn page_unpin(&self, page: &VmPage) {
        if page.unpin_ref() != 1 {
            return;
        }

        let flags = page.flags();
        if flags.contains(PageFlags::DEALLOC) {
            page.clear_flags(PageFlags::DEALLOC);
            self.free_page(page);
        } else if flags.contains(PageFlags::ERROR) {
            if !flags.contains(PageFlags::BUSY) {
                panic!("page {}: error without busy", page.id.0);
            }
            page.clear_flags(PageFlags::BUSY | PageFlags::ERROR);
            self.free_page(page);
        } else if page.state().is_pageout() {
            self.pageout.unpin(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::thread;

    #[test]
    fn test_page_alignment() {
        assert_eq!(trunc_page(0x1234), 0x1000);
        assert_eq!(round_page(0x1234), 0x2000);
        assert_eq!(round_page(0x2000), 0x2000);
        assert_eq!(atop(1), 1);
    }

    #[test]
    fn test_state_and_flags_are_disjoint() {
        let state_bits = STATE_MASK;
        assert_eq!(PageFlags::all().bits() & state_bits, 0);
        assert!((PageState::Sync as u32) <= STATE_MASK);
    }

    #[test]
    fn test_alloc_and_free() {
        let vm = testing::test_vm(8);
        let before = vm.pressure.pool_free(Pool::Phys);

        let page = vm.alloc_page(AllocFlags::ZERO).unwrap();
        assert_eq!(page.state(), PageState::Normal);
        assert_eq!(vm.frames.free_count(), 7);
        assert_eq!(vm.pressure.pool_free(Pool::Phys), before - PAGE_SIZE as u64);
        assert!(unsafe { vm.frames.page_bytes(page) }.iter().all(|b| *b == 0));

        page.dirty();
        vm.free_page(page);
        assert_eq!(page.state(), PageState::Free);
        assert!(page.flags().is_empty());
        assert_eq!(vm.frames.free_count(), 8);
        assert_eq!(vm.pressure.pool_free(Pool::Phys), before);
    }

    #[test]
    fn test_exhaustion() {
        let vm = testing::test_vm(2);
        let a = vm.alloc_page(AllocFlags::empty()).unwrap();
        let _b = vm.alloc_page(AllocFlags::empty()).unwrap();
        assert_eq!(vm.alloc_page(AllocFlags::empty()).err(), Some(VmError::NoMemory));
        vm.free_page(a);
        assert!(vm.alloc_page(AllocFlags::empty()).is_ok());
    }

    #[test]
    fn test_alloc_contig() {
        let vm = testing::test_vm(8);
        let hole = vm.alloc_page(AllocFlags::empty()).unwrap();
        let first = vm.alloc_contig(3, PageState::Malloc).unwrap();
        assert!(first.id().0 >= 1);
        for i in 0..3 {
            assert_eq!(vm.frames.page(PageId(first.id().0 + i)).state(), PageState::Malloc);
        }
        vm.free_page(hole);
        assert_eq!(vm.frames.free_count(), 5);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let vm = testing::test_vm(2);
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        vm.free_page(page);
        vm.free_page(page);
    }

    #[test]
    fn test_zero_range() {
        let vm = testing::test_vm(1);
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        let bytes = unsafe { vm.frames.page_bytes(page) };
        bytes.fill(0xAA);
        vm.frames.zero_range(page, 100, 50);
        assert_eq!(bytes[99], 0xAA);
        assert!(bytes[100..150].iter().all(|b| *b == 0));
        assert_eq!(bytes[150], 0xAA);
    }

    #[test]
    fn test_addr_to_page() {
        let vm = testing::test_vm(4);
        let page = vm.frames.page(PageId(2));
        let addr = vm.frames.page_to_addr(page);
        assert_eq!(vm.frames.addr_to_page(addr + 17).map(|p| p.id()), Some(PageId(2)));
        let phys = vm.frames.page_to_phys(page);
        assert_eq!(vm.frames.phys_to_page(phys).map(|p| p.id()), Some(PageId(2)));
    }

    #[test]
    #[should_panic(expected = "already busy")]
    fn test_double_busy_panics() {
        let vm = testing::test_vm(1);
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        page.mark_busy();
        page.mark_busy();
    }

    #[test]
    fn test_busy_wait_success() {
        let vm = Arc::new(testing::test_vm(1));
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        page.mark_busy();

        let waiter = {
            let vm = vm.clone();
            thread::spawn(move || vm.frames.page(PageId(0)).busy_wait())
        };
        thread::sleep(std::time::Duration::from_millis(10));
        page.clear_busy();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_busy_wait_error() {
        let vm = Arc::new(testing::test_vm(1));
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        page.mark_busy();

        let waiter = {
            let vm = vm.clone();
            thread::spawn(move || vm.frames.page(PageId(0)).busy_wait())
        };
        thread::sleep(std::time::Duration::from_millis(10));
        page.mark_error();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_page_lock() {
        let vm = Arc::new(testing::test_vm(1));
        let page = vm.frames.page(PageId(0));
        page.lock();
        assert!(!page.try_lock());

        let other = {
            let vm = vm.clone();
            thread::spawn(move || {
                let page = vm.frames.page(PageId(0));
                page.lock();
                page.unlock();
            })
        };
        thread::sleep(std::time::Duration::from_millis(5));
        page.unlock();
        other.join().unwrap();
        assert!(!page.is_locked());
    }

    #[test]
    #[should_panic(expected = "unlock of unlocked page")]
    fn test_unlock_unlocked_panics() {
        let vm = testing::test_vm(1);
        vm.frames.page(PageId(0)).unlock();
    }

    #[test]
    fn test_unpin_frees_deallocated_page() {
        let vm = testing::test_vm(2);
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        vm.page_pin(page);
        page.set_dealloc();
        vm.page_unpin(page);
        assert_eq!(page.state(), PageState::Free);
        assert_eq!(vm.frames.free_count(), 2);
    }

    #[test]
    fn test_unpin_frees_errored_page() {
        let vm = testing::test_vm(2);
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        vm.page_pin(page);
        page.mark_busy();
        page.mark_error();
        vm.page_unpin(page);
        assert_eq!(page.state(), PageState::Free);
        assert!(page.flags().is_empty());
    }

    #[test]
    #[should_panic(expected = "unpin of unpinned page")]
    fn test_unpin_underflow_panics() {
        let vm = testing::test_vm(1);
        let page = vm.alloc_page(AllocFlags::empty()).unwrap();
        vm.page_unpin(page);
    }

    #[test]
    fn test_random_pin_unpin_balance() {
        let vm = testing::test_vm(4);
        let pages: Vec<&VmPage> = (0..4)
            .map(|_| vm.alloc_page(AllocFlags::empty()).unwrap())
            .collect();
        let mut expected = [0u32; 4];
        let mut rng = testing::XorShift::new(0x5eed);

        for _ in 0..2000 {
            let i = (rng.next() % 4) as usize;
            if expected[i] == 0 || rng.next() % 2 == 0 {
                vm.page_pin(pages[i]);
                expected[i] += 1;
            } else {
                vm.page_unpin(pages[i]);
                expected[i] -= 1;
            }
            assert_eq!(pages[i].pincnt(), expected[i]);
        }
        for (i, page) in pages.iter().enumerate() {
            while expected[i] > 0 {
                vm.page_unpin(page);
                expected[i] -= 1;
            }
            assert_eq!(page.pincnt(), 0);
            assert_eq!(page.state(), PageState::Normal);
        }
    }
}
