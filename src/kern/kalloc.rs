//! General Kernel Memory Allocator
//!
//! Requests up to the slab boundary are rounded to the next power of two
//! and served by one slab pool per size. Larger requests take contiguous
//! page frames directly; the first frame records the requested size and
//! the frame count so that `free` can give them all back.
//!
//! `free` needs no size: it looks at the state of the frame under the
//! pointer.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::kern::slab::SlabPool;
use crate::vm::vm_page::{atop, AllocFlags, PageId, PageMeta, PageState, PAGE_MASK, PAGE_SIZE};
use crate::vm::vm_pressure::Pool;
use crate::vm::vm_reclaim::ReclaimRegistry;
use crate::vm::Vm;

// ============================================================================
// Kalloc Statistics
// ============================================================================

/// Kalloc statistics
#[derive(Debug, Default)]
pub struct KallocStats {
    /// Allocations served by slab pools
    pub small_allocs: AtomicU64,
    /// Allocations served by page frames
    pub large_allocs: AtomicU64,
    /// Frees of either kind
    pub frees: AtomicU64,
    /// Pages currently held by large allocations
    pub large_pages: AtomicU64,
    /// Failed allocations
    pub failures: AtomicU64,
}

// ============================================================================
// Kalloc
// ============================================================================

/// The kernel heap
#[derive(Debug)]
pub struct Kalloc {
    /// One pool per power-of-two size, smallest first
    pools: Vec<SlabPool>,
    min_bucket: usize,
    slab_max: usize,
    pub stats: KallocStats,
}

impl Kalloc {
    pub fn new(config: &VmConfig) -> Self {
        let min_bucket = config
            .heap_min_bucket
            .max(core::mem::size_of::<usize>())
            .next_power_of_two();
        let slab_max = config.heap_slab_max.min(PAGE_SIZE).max(min_bucket);

        let mut pools = Vec::new();
        let mut size = min_bucket;
        while size <= slab_max {
            pools.push(SlabPool::new(&format!("kalloc.{}", size), size));
            size *= 2;
        }
        Self {
            pools,
            min_bucket,
            slab_max,
            stats: KallocStats::default(),
        }
    }

    pub fn pools(&self) -> &[SlabPool] {
        &self.pools
    }

    /// Largest request served from a slab pool
    pub fn slab_max(&self) -> usize {
        self.slab_max
    }

    /// Pool index for a small request
    fn bucket(&self, size: usize) -> usize {
        let size = size.max(self.min_bucket).next_power_of_two();
        (size.trailing_zeros() - self.min_bucket.trailing_zeros()) as usize
    }

    /// Allocate `size` bytes
    pub fn alloc(&self, vm: &Vm, size: usize, flags: AllocFlags) -> VmResult<NonNull<u8>> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let result = if size <= self.slab_max {
            let ptr = self.pools[self.bucket(size)].alloc(vm, flags);
            if ptr.is_ok() {
                self.stats.small_allocs.fetch_add(1, Ordering::Relaxed);
            }
            ptr
        } else {
            self.alloc_large(vm, size, flags)
        };
        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn alloc_large(&self, vm: &Vm, size: usize, flags: AllocFlags) -> VmResult<NonNull<u8>> {
        if size as u64 > u64::MAX - PAGE_MASK {
            return Err(VmError::InvalidArgument);
        }
        let npages = atop(size as u64) as usize;
        let bytes = (npages * PAGE_SIZE) as u64;
        let first = loop {
            match vm.alloc_contig(npages, PageState::Malloc) {
                Ok(first) => break first,
                // Waiting only helps if frames are short, not fragmented
                Err(VmError::NoMemory)
                    if flags.contains(AllocFlags::WAIT) && vm.pressure.must_wait(Pool::Phys, bytes) =>
                {
                    vm.pressure.wait_for_free(Pool::Phys, bytes, None);
                }
                Err(e) => return Err(e),
            }
        };

        first.set_meta(PageMeta::Malloc {
            size,
            npages: npages as u32,
        });
        vm.pressure.add(Pool::Kern, -(bytes as i64));
        let base = vm.frames.page_to_addr(first);
        if flags.contains(AllocFlags::ZERO) {
            unsafe { core::ptr::write_bytes(base as *mut u8, 0, npages * PAGE_SIZE) };
        }
        self.stats.large_allocs.fetch_add(1, Ordering::Relaxed);
        self.stats.large_pages.fetch_add(npages as u64, Ordering::Relaxed);
        NonNull::new(base as *mut u8).ok_or(VmError::NoMemory)
    }

    /// Free memory returned by [`Kalloc::alloc`]
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this heap and must not be used
    /// afterwards.
    pub unsafe fn free(&self, vm: &Vm, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let page = match vm.frames.addr_to_page(addr) {
            Some(page) => page,
            None => panic!("kalloc: free of {:#x} outside page frames", addr),
        };
        match (page.state(), page.meta()) {
            (PageState::Slab, PageMeta::Slab { pool, .. }) => {
                let Some(slab) = self.pools.iter().find(|p| p.id().0 == pool) else {
                    panic!("kalloc: free of {:#x} from foreign slab pool {}", addr, pool);
                };
                slab.free(vm, ptr);
            }
            (PageState::Malloc, PageMeta::Malloc { npages, .. }) => {
                if addr != vm.frames.page_to_addr(page) {
                    panic!("kalloc: free of {:#x} inside a large allocation", addr);
                }
                for i in 0..npages {
                    let frame = vm.frames.page(PageId(page.id().0 + i));
                    frame.set_meta(PageMeta::None);
                    frame.set_state(PageState::Normal);
                    vm.free_page(frame);
                }
                vm.pressure
                    .add(Pool::Kern, (npages as usize * PAGE_SIZE) as i64);
                self.stats
                    .large_pages
                    .fetch_sub(npages as u64, Ordering::Relaxed);
            }
            (state, meta) => panic!(
                "kalloc: free of {:#x} on page {} ({:?}, {:?}) not from the heap",
                addr,
                page.id().0,
                state,
                meta
            ),
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes usable at `ptr`
    pub fn usable_size(&self, vm: &Vm, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let Some(page) = vm.frames.addr_to_page(addr) else {
            panic!("kalloc: {:#x} outside page frames", addr);
        };
        match page.meta() {
            PageMeta::Slab { pool, .. } => self
                .pools
                .iter()
                .find(|p| p.id().0 == pool)
                .map(SlabPool::size)
                .unwrap_or_else(|| panic!("kalloc: {:#x} in foreign slab pool {}", addr, pool)),
            PageMeta::Malloc { npages, .. } => npages as usize * PAGE_SIZE,
            meta => panic!("kalloc: {:#x} not from the heap ({:?})", addr, meta),
        }
    }

    /// Give one fully free slab of pool `index` back
    pub fn reclaim_pool(&self, vm: &Vm, index: usize) -> bool {
        self.pools.get(index).is_some_and(|pool| pool.reclaim(vm))
    }

    /// Register one reclaim callback per pool
    pub fn register_reclaim(&self, registry: &ReclaimRegistry) -> VmResult<()> {
        for (index, pool) in self.pools.iter().enumerate() {
            registry.add(
                pool.name(),
                Arc::new(move |vm: &Vm| vm.heap.reclaim_pool(vm, index)),
            )?;
        }
        Ok(())
    }
}
