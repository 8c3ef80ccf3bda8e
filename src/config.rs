//! VM Policy Parameters
//!
//! Tunables for pressure levels, heap layout, the page cache, and the
//! pageout and reclaim daemons. `VmConfig::default()` is the kernel's
//! stock policy.

use core::time::Duration;

use crate::vm::vm_page::PAGE_SIZE;

/// Free percentage at or above which a pool is at LOW pressure
pub const PRESSURE_LOW_PCT: u64 = 50;
/// Free percentage at or above which a pool is at MODERATE pressure
pub const PRESSURE_MODERATE_PCT: u64 = 30;

/// Sync queues in the pageout ring
pub const PAGEOUT_SYNC_QUEUES: usize = 32;

/// VM policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Free percentage for LOW pressure
    pub pressure_low_pct: u64,
    /// Free percentage for MODERATE pressure
    pub pressure_moderate_pct: u64,
    /// Free units each pool keeps in reserve before `wait_for_free` succeeds
    pub low_water: u64,

    /// Smallest heap bucket; also the heap alignment
    pub heap_min_bucket: usize,
    /// Largest request served from a slab; larger ones get page frames
    pub heap_slab_max: usize,

    /// Page-cache buckets are `total_pages >> pghash_shift`
    pub pghash_shift: u32,

    /// Pageout delay between pages while pressure is MODERATE
    pub pageout_delay_moderate: Duration,
    /// Pageout delay while pressure is LOW (sync queues only)
    pub pageout_delay_low: Duration,
    /// Generations between active-to-inactive refreshes
    pub pageout_inactive_period: u32,
    /// Time a dirty page may sit before it is written back
    pub sync_interval: Duration,

    /// Reclaim daemon backoff once pressure drops to MODERATE
    pub reclaim_backoff: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            pressure_low_pct: PRESSURE_LOW_PCT,
            pressure_moderate_pct: PRESSURE_MODERATE_PCT,
            low_water: 0,
            heap_min_bucket: core::mem::size_of::<usize>(),
            heap_slab_max: PAGE_SIZE / 2,
            pghash_shift: 8,
            pageout_delay_moderate: Duration::from_millis(50),
            pageout_delay_low: Duration::from_millis(200),
            pageout_inactive_period: 16,
            sync_interval: Duration::from_secs(30),
            reclaim_backoff: Duration::from_millis(10),
        }
    }
}

impl VmConfig {
    /// Time slot covered by one sync queue
    pub fn sync_slot(&self) -> Duration {
        self.sync_interval / PAGEOUT_SYNC_QUEUES as u32
    }
}
