//! Slab Allocator
//!
//! A slab pool hands out fixed-size objects carved from single page
//! frames. Each frame is one slab; its free objects are linked through
//! their first word. Slabs with free objects sit on one list with
//! partially used slabs at the front and fully free ones at the tail, so
//! allocation fills partial slabs first and empty slabs can be returned
//! to the page allocator.
//!
//! A slab frame is in state SLAB and its metadata names the pool and the
//! slab slot, which is how `free` finds its way back.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::kern::lock::SpinLock;
use crate::vm::vm_page::{AllocFlags, PageId, PageMeta, PageState, VmPage, PAGE_SIZE};
use crate::vm::vm_pressure::Pool;
use crate::vm::Vm;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Most objects a slab can hold (pointer-sized objects)
const MAX_OBJS: usize = PAGE_SIZE / core::mem::size_of::<usize>();
const MAP_WORDS: usize = (MAX_OBJS + 63) / 64;

/// Slab pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabPoolId(pub u32);

// ============================================================================
// Slab Statistics
// ============================================================================

/// Slab pool statistics
#[derive(Debug, Default)]
pub struct SlabStats {
    /// Total allocations from this pool
    pub alloc_count: AtomicU64,
    /// Total frees to this pool
    pub free_count: AtomicU64,
    /// Objects currently handed out
    pub in_use: AtomicU64,
    /// Slabs currently held
    pub slabs: AtomicU64,
    /// Times the pool grew by a slab
    pub grows: AtomicU64,
    /// Slabs given back to the page allocator
    pub reclaims: AtomicU64,
    /// Failed allocation attempts
    pub failures: AtomicU64,
}

impl SlabStats {
    fn record_alloc(&self) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
    }

    fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_grow(&self) {
        self.grows.fetch_add(1, Ordering::Relaxed);
        self.slabs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        self.slabs.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Slab Pool
// ============================================================================

#[derive(Debug)]
struct Slab {
    page: PageId,
    /// Address of the slab frame
    base: usize,
    /// Address of the first free object, 0 if none
    free_head: usize,
    inuse: u32,
    /// One bit per object, set while handed out
    allocated: [u64; MAP_WORDS],
}

impl Slab {
    fn mark(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        let was = self.allocated[word] & bit != 0;
        self.allocated[word] |= bit;
        was
    }

    fn unmark(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        let was = self.allocated[word] & bit != 0;
        self.allocated[word] &= !bit;
        was
    }
}

#[derive(Debug, Default)]
struct SlabList {
    slabs: Vec<Option<Slab>>,
    spare: Vec<u32>,
    /// Slabs with a free object: partial first, fully free last
    avail: VecDeque<u32>,
}

impl SlabList {
    fn slab(&mut self, slot: u32) -> &mut Slab {
        match self.slabs.get_mut(slot as usize).and_then(Option::as_mut) {
            Some(slab) => slab,
            None => panic!("slab: stale slot {}", slot),
        }
    }

    fn unlink(&mut self, slot: u32) {
        if let Some(pos) = self.avail.iter().position(|s| *s == slot) {
            self.avail.remove(pos);
        }
    }
}

/// A pool of fixed-size objects
#[derive(Debug)]
pub struct SlabPool {
    id: SlabPoolId,
    name: heapless::String<32>,
    obj_size: usize,
    per_slab: u32,
    list: SpinLock<SlabList>,
    pub stats: SlabStats,
}

impl SlabPool {
    /// Create a pool of `obj_size`-byte objects
    ///
    /// The size is rounded up to a power of two of at least a pointer, which
    /// is also the alignment of every object.
    pub fn new(name: &str, obj_size: usize) -> Self {
        let obj_size = obj_size
            .max(core::mem::size_of::<usize>())
            .next_power_of_two();
        if obj_size > PAGE_SIZE {
            panic!("slab {}: object size {} larger than a page", name, obj_size);
        }
        let mut pool_name = heapless::String::new();
        for c in name.chars() {
            if pool_name.push(c).is_err() {
                break;
            }
        }
        Self {
            id: SlabPoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            name: pool_name,
            obj_size,
            per_slab: (PAGE_SIZE / obj_size) as u32,
            list: SpinLock::new(SlabList::default()),
            stats: SlabStats::default(),
        }
    }

    pub fn id(&self) -> SlabPoolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object size
    pub fn size(&self) -> usize {
        self.obj_size
    }

    /// Objects per slab
    pub fn per_slab(&self) -> u32 {
        self.per_slab
    }

    /// Allocate one object
    ///
    /// `AllocFlags::WAIT` lets the pool sleep for a page frame when it has
    /// to grow; `AllocFlags::ZERO` zeroes the object.
    pub fn alloc(&self, vm: &Vm, flags: AllocFlags) -> VmResult<NonNull<u8>> {
        loop {
            if let Some(obj) = self.take() {
                if flags.contains(AllocFlags::ZERO) {
                    unsafe { core::ptr::write_bytes(obj.as_ptr(), 0, self.obj_size) };
                }
                self.stats.record_alloc();
                return Ok(obj);
            }
            // The list lock is not held while the page allocator sleeps
            let page = match vm.alloc_page(flags & AllocFlags::WAIT) {
                Ok(page) => page,
                Err(e) => {
                    self.stats.record_failure();
                    return Err(e);
                }
            };
            self.grow(vm, page);
        }
    }

    /// Pop a free object off the first available slab
    fn take(&self) -> Option<NonNull<u8>> {
        let mut list = self.list.lock();
        let slot = *list.avail.front()?;
        let obj_size = self.obj_size;
        let slab = list.slab(slot);
        let obj = slab.free_head;
        if slab.mark((obj - slab.base) / obj_size) {
            panic!("slab {}: free list hands out live object {:#x}", self.name, obj);
        }
        slab.free_head = unsafe { *(obj as *const usize) };
        slab.inuse += 1;
        if slab.free_head == 0 {
            list.avail.pop_front();
        }
        NonNull::new(obj as *mut u8)
    }

    /// Turn a fresh frame into a slab at the tail of the list
    fn grow(&self, vm: &Vm, page: &VmPage) {
        vm.pressure.add(Pool::Kern, -(PAGE_SIZE as i64));
        let base = vm.frames.page_to_addr(page);
        let mut head = 0usize;
        for i in (0..self.per_slab as usize).rev() {
            let obj = base + i * self.obj_size;
            unsafe { *(obj as *mut usize) = head };
            head = obj;
        }

        let mut list = self.list.lock();
        let slab = Slab {
            page: page.id(),
            base,
            free_head: head,
            inuse: 0,
            allocated: [0; MAP_WORDS],
        };
        let slot = match list.spare.pop() {
            Some(slot) => {
                list.slabs[slot as usize] = Some(slab);
                slot
            }
            None => {
                list.slabs.push(Some(slab));
                list.slabs.len() as u32 - 1
            }
        };
        page.set_meta(PageMeta::Slab {
            pool: self.id.0,
            slab: slot,
        });
        page.set_state(PageState::Slab);
        list.avail.push_back(slot);
        drop(list);

        self.stats.record_grow();
        log::trace!("slab {}: grew by page {}", self.name, page.id().0);
    }

    /// Return an object to the pool
    ///
    /// # Safety
    /// `obj` must have come from [`SlabPool::alloc`] on this pool and must
    /// not be used afterwards.
    pub unsafe fn free(&self, vm: &Vm, obj: NonNull<u8>) {
        let addr = obj.as_ptr() as usize;
        let page = match vm.frames.addr_to_page(addr) {
            Some(page) => page,
            None => panic!("slab {}: free of {:#x} outside page frames", self.name, addr),
        };
        let slot = match (page.state(), page.meta()) {
            (PageState::Slab, PageMeta::Slab { pool, slab }) if pool == self.id.0 => slab,
            (PageState::Slab, PageMeta::Slab { pool, .. }) => panic!(
                "slab {}: free of {:#x} that belongs to pool {}",
                self.name, addr, pool
            ),
            (state, _) => panic!(
                "slab {}: free of {:#x} on page {} in state {:?}",
                self.name,
                addr,
                page.id().0,
                state
            ),
        };
        if (addr - vm.frames.page_to_addr(page)) % self.obj_size != 0 {
            panic!("slab {}: free of misaligned {:#x}", self.name, addr);
        }

        let mut list = self.list.lock();
        let per_slab = self.per_slab;
        let obj_size = self.obj_size;
        let slab = list.slab(slot);
        if !slab.unmark((addr - slab.base) / obj_size) {
            panic!("slab {}: double free of {:#x}", self.name, addr);
        }
        *(addr as *mut usize) = slab.free_head;
        slab.free_head = addr;
        slab.inuse -= 1;
        let inuse = slab.inuse;

        if inuse + 1 == per_slab {
            // Was full: now partial
            list.avail.push_front(slot);
        }
        if inuse == 0 {
            list.unlink(slot);
            list.avail.push_back(slot);
        }
        drop(list);
        self.stats.record_free();
    }

    /// Give one fully free slab back to the page allocator
    ///
    /// Returns false if every slab has objects in use.
    pub fn reclaim(&self, vm: &Vm) -> bool {
        let mut list = self.list.lock();
        let Some(&slot) = list.avail.back() else {
            return false;
        };
        if list.slab(slot).inuse != 0 {
            return false;
        }
        list.avail.pop_back();
        let slab = match list.slabs[slot as usize].take() {
            Some(slab) => slab,
            None => panic!("slab {}: stale slot {}", self.name, slot),
        };
        list.spare.push(slot);
        drop(list);

        let page = vm.frames.page(slab.page);
        page.set_meta(PageMeta::None);
        page.set_state(PageState::Normal);
        vm.free_page(page);
        vm.pressure.add(Pool::Kern, PAGE_SIZE as i64);
        self.stats.record_reclaim();
        true
    }

    /// Slabs held, fully free slabs included
    pub fn slab_count(&self) -> usize {
        let list = self.list.lock();
        list.slabs.len() - list.spare.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use alloc::collections::BTreeSet;

    #[test]
    fn test_objects_are_distinct_and_aligned() {
        let vm = testing::test_vm(4);
        let pool = SlabPool::new("test.64", 60);
        assert_eq!(pool.size(), 64);
        assert_eq!(pool.per_slab() as usize, PAGE_SIZE / 64);

        let mut seen = BTreeSet::new();
        let objs: Vec<NonNull<u8>> = (0..100)
            .map(|_| pool.alloc(&vm, AllocFlags::empty()).unwrap())
            .collect();
        for obj in &objs {
            assert_eq!(obj.as_ptr() as usize % 64, 0);
            assert!(seen.insert(obj.as_ptr() as usize));
        }
        assert_eq!(pool.slab_count(), 2);
        assert_eq!(
            vm.frames.addr_to_page(objs[0].as_ptr() as usize).unwrap().state(),
            PageState::Slab
        );
        for obj in objs {
            unsafe { pool.free(&vm, obj) };
        }
        assert_eq!(pool.stats.in_use.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_partial_slabs_are_preferred() {
        let vm = testing::test_vm(4);
        let pool = SlabPool::new("test.2048", 2048);
        let a = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        let b = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        let c = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        let page_of = |p: NonNull<u8>| vm.frames.addr_to_page(p.as_ptr() as usize).unwrap().id();
        assert_eq!(page_of(a), page_of(b));
        assert_ne!(page_of(a), page_of(c));

        // First slab becomes partial; it must be used before the second
        unsafe { pool.free(&vm, b) };
        let d = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        assert_eq!(page_of(d), page_of(a));

        for obj in [a, c, d] {
            unsafe { pool.free(&vm, obj) };
        }
    }

    #[test]
    fn test_reclaim_returns_free_slabs() {
        let vm = testing::test_vm(4);
        let pool = SlabPool::new("test.1024", 1024);
        let free_before = vm.frames.free_count();
        let kern_before = vm.pressure.pool_free(Pool::Kern);

        let objs: Vec<_> = (0..8)
            .map(|_| pool.alloc(&vm, AllocFlags::empty()).unwrap())
            .collect();
        assert_eq!(pool.slab_count(), 2);
        assert_eq!(vm.frames.free_count(), free_before - 2);
        assert_eq!(vm.pressure.pool_free(Pool::Kern), kern_before - 2 * PAGE_SIZE as u64);

        // Nothing to give back while every slab is in use
        unsafe { pool.free(&vm, objs[0]) };
        assert!(!pool.reclaim(&vm));

        for obj in &objs[1..4] {
            unsafe { pool.free(&vm, *obj) };
        }
        assert!(pool.reclaim(&vm));
        assert!(!pool.reclaim(&vm));
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(vm.frames.free_count(), free_before - 1);

        for obj in &objs[4..] {
            unsafe { pool.free(&vm, *obj) };
        }
        assert!(pool.reclaim(&vm));
        assert_eq!(vm.frames.free_count(), free_before);
        assert_eq!(vm.pressure.pool_free(Pool::Kern), kern_before);
        assert_eq!(pool.stats.reclaims.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_zeroed_alloc() {
        let vm = testing::test_vm(2);
        let pool = SlabPool::new("test.128", 128);
        let a = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        unsafe {
            core::ptr::write_bytes(a.as_ptr(), 0xAB, 128);
            pool.free(&vm, a);
        }
        let b = pool.alloc(&vm, AllocFlags::ZERO).unwrap();
        assert_eq!(a, b);
        let bytes = unsafe { core::slice::from_raw_parts(b.as_ptr(), 128) };
        assert!(bytes.iter().all(|&x| x == 0));
        unsafe { pool.free(&vm, b) };
    }

    #[test]
    fn test_exhaustion_fails_without_wait() {
        let vm = testing::test_vm(1);
        let pool = SlabPool::new("test.4096", PAGE_SIZE);
        let a = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        assert_eq!(pool.alloc(&vm, AllocFlags::empty()), Err(VmError::NoMemory));
        assert_eq!(pool.stats.failures.load(Ordering::Relaxed), 1);
        unsafe { pool.free(&vm, a) };
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_in_partial_slab_panics() {
        let vm = testing::test_vm(2);
        let pool = SlabPool::new("test.32", 32);
        let a = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        let _b = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        unsafe {
            pool.free(&vm, a);
            pool.free(&vm, a);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_in_empty_slab_panics() {
        let vm = testing::test_vm(2);
        let pool = SlabPool::new("test.32", 32);
        let a = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        unsafe {
            pool.free(&vm, a);
            pool.free(&vm, a);
        }
    }

    #[test]
    fn test_freed_object_reused_once() {
        let vm = testing::test_vm(2);
        let pool = SlabPool::new("test.32", 32);
        let a = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        let b = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        unsafe { pool.free(&vm, a) };
        let x = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        let y = pool.alloc(&vm, AllocFlags::empty()).unwrap();
        assert_eq!(x, a);
        assert_ne!(x, y);
        assert_ne!(y, b);
        for obj in [b, x, y] {
            unsafe { pool.free(&vm, obj) };
        }
        assert_eq!(pool.stats.in_use.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "belongs to pool")]
    fn test_free_to_wrong_pool_panics() {
        let vm = testing::test_vm(2);
        let a = SlabPool::new("test.a", 64);
        let b = SlabPool::new("test.b", 64);
        let obj = a.alloc(&vm, AllocFlags::empty()).unwrap();
        unsafe { b.free(&vm, obj) };
    }
}
