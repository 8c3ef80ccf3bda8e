//! Virtual Memory Subsystem
//!
//! - vm_page: page frames, pin and busy bookkeeping
//! - vm_pghash: (object, offset) to page lookup
//! - vm_object: memory objects and their resident pages
//! - vm_shadow: copy-on-write shadow chains
//! - vm_pager: backing-store strategies
//! - vm_fault: fault resolution
//! - vm_map: address spaces
//! - vm_arena: address-interval allocator
//! - pmap: page-table seam
//! - vm_pageout: page daemon
//! - vm_reclaim: generic reclaim callbacks
//! - vm_pressure: memory-pressure signaling
//!
//! Every component hangs off one [`Vm`], which owns the frame array. The
//! kernel installs a single instance with [`init`]; tests build their own.

pub mod pmap;
pub mod vm_arena;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;
pub mod vm_pageout;
pub mod vm_pager;
pub mod vm_pghash;
pub mod vm_pressure;
pub mod vm_reclaim;
pub mod vm_shadow;

use alloc::sync::Arc;
use core::ptr::NonNull;

use spin::Once;

use crate::config::VmConfig;
use crate::kern::kalloc::Kalloc;

pub use pmap::{Pmap, SpaceId, VmProt};
pub use vm_arena::{Arena, NodeId};
pub use vm_fault::{object_fault, FaultStats, PageRef};
pub use vm_map::{AddressSpace, MapEntry, MapFlags};
pub use vm_object::{VmObject, VmObjectId};
pub use vm_page::{AllocFlags, PageFlags, PageFrames, PageState, VmPage, PAGE_SIZE};
pub use vm_pageout::{DaemonState, PageoutDaemon, SyncWhen};
pub use vm_pager::{AnonPager, BackingStore, Pager, PagerFlags, VnodePager};
pub use vm_pghash::{PageCache, PageTag};
pub use vm_pressure::{Pool, PoolSet, Pressure, PressureLevel};
pub use vm_reclaim::ReclaimRegistry;
pub use vm_shadow::{ShadowPager, ShadowState};

// ============================================================================
// VM Context
// ============================================================================

/// The VM subsystem
pub struct Vm {
    pub config: VmConfig,
    pub frames: PageFrames,
    pub pghash: PageCache,
    pub pressure: Pressure,
    pub pageout: PageoutDaemon,
    pub reclaim: ReclaimRegistry,
    pub heap: Kalloc,
    pub pmap: Arc<dyn Pmap>,
    pub fault_stats: FaultStats,
}

impl Vm {
    /// Build the VM over `npages` frames at `base`
    ///
    /// # Safety
    /// `base` must be the page-aligned, direct-mapped address of `npages`
    /// frames of RAM starting at `phys_base`, used by nothing else.
    pub unsafe fn new(
        base: NonNull<u8>,
        phys_base: u64,
        npages: usize,
        pmap: Arc<dyn Pmap>,
        config: VmConfig,
    ) -> Self {
        let bytes = (npages * PAGE_SIZE) as u64;
        let pressure = Pressure::new(&config);
        for pool in Pool::ALL {
            pressure.init_pool(pool, bytes, bytes);
            pressure.set_threshold(pool, config.low_water);
        }

        let vm = Self {
            frames: PageFrames::new(base, phys_base, npages),
            pghash: PageCache::with_capacity(npages, config.pghash_shift),
            pressure,
            pageout: PageoutDaemon::new(&config),
            reclaim: ReclaimRegistry::new(config.reclaim_backoff),
            heap: Kalloc::new(&config),
            pmap,
            fault_stats: FaultStats::new(),
            config,
        };
        if let Err(e) = vm.heap.register_reclaim(&vm.reclaim) {
            log::warn!("vm: heap reclaim not registered: {}", e);
        }
        vm
    }

    /// Allocate `size` bytes from the kernel heap
    pub fn alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.heap.alloc(self, size, flags).ok()
    }

    /// Free memory from [`Vm::alloc`]
    ///
    /// # Safety
    /// `ptr` must come from `alloc` and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.heap.free(self, ptr)
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("frames", &self.frames)
            .field("pghash", &self.pghash)
            .field("pressure", &self.pressure)
            .field("pageout", &self.pageout)
            .finish()
    }
}

// ============================================================================
// Global Instance
// ============================================================================

static VM: Once<Vm> = Once::new();

/// Install the kernel's VM
///
/// # Safety
/// Same contract as [`Vm::new`].
pub unsafe fn init(
    base: NonNull<u8>,
    phys_base: u64,
    npages: usize,
    pmap: Arc<dyn Pmap>,
    config: VmConfig,
) -> &'static Vm {
    VM.call_once(|| {
        let vm = Vm::new(base, phys_base, npages, pmap, config);
        log::info!(
            "vm: {} pages ({} KiB), {} page-cache buckets, {} heap pools",
            npages,
            npages * PAGE_SIZE / 1024,
            vm.pghash.bucket_count(),
            vm.heap.pools().len()
        );
        vm
    })
}

/// The kernel's VM; panics before [`init`]
pub fn vm() -> &'static Vm {
    match VM.get() {
        Some(vm) => vm,
        None => panic!("vm: used before init"),
    }
}
