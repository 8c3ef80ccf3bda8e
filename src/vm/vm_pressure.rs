//! Memory Pressure
//!
//! Every memory pool (kernel heap pages, physical frames) tracks its total
//! and free amount. The free ratio maps to a pressure level:
//!
//! | free        | level    |
//! |-------------|----------|
//! | >= 50%      | LOW      |
//! | 30% .. 50%  | MODERATE |
//! | < 30%       | HIGH     |
//!
//! Daemons block in [`Pressure::wait_for_pressure`] until some pool in a
//! set reaches a minimum level. Allocators block in
//! [`Pressure::wait_for_free`] until a pool has room above its low-water
//! threshold.

use bitflags::bitflags;
use core::time::Duration;

use crate::config::VmConfig;
use crate::kern::lock::SpinLock;
use crate::kern::sched_prim::{wait_event_until, wait_until, EventSpace, WaitEvent, WaitQueue, WaitResult};

// ============================================================================
// Pools and Levels
// ============================================================================

/// Memory pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pool {
    /// Kernel heap memory
    Kern = 0,
    /// Physical page frames
    Phys = 1,
}

/// Number of pools
pub const NUM_POOLS: usize = 2;

impl Pool {
    pub const ALL: [Pool; NUM_POOLS] = [Pool::Kern, Pool::Phys];

    pub fn set(self) -> PoolSet {
        match self {
            Pool::Kern => PoolSet::KERN,
            Pool::Phys => PoolSet::PHYS,
        }
    }
}

bitflags! {
    /// A set of pools
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolSet: u32 {
        const KERN = 1 << 0;
        const PHYS = 1 << 1;
    }
}

/// Pressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PressureLevel {
    Low = 0,
    Moderate = 1,
    High = 2,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            1 => Self::Moderate,
            _ => Self::High,
        }
    }
}

// ============================================================================
// Pool State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PoolState {
    total: u64,
    free: u64,
    threshold: u64,
    level: PressureLevel,
}

impl PoolState {
    const EMPTY: Self = Self {
        total: 0,
        free: 0,
        threshold: 0,
        level: PressureLevel::Low,
    };
}

/// Waiters for a level encode their request in the event key
fn level_event(set: PoolSet, min: PressureLevel) -> WaitEvent {
    WaitEvent {
        space: EventSpace::None,
        addr: ((set.bits() as u64) << 8) | min as u64,
    }
}

fn decode_level_event(event: &WaitEvent) -> (PoolSet, PressureLevel) {
    (
        PoolSet::from_bits_truncate((event.addr >> 8) as u32),
        PressureLevel::from_u8(event.addr as u8),
    )
}

// ============================================================================
// Pressure Tracker
// ============================================================================

/// Pressure accounting for all pools
pub struct Pressure {
    pools: SpinLock<[PoolState; NUM_POOLS]>,
    /// Waiters for a minimum pressure level
    level_waiters: WaitQueue,
    /// Waiters for free memory, per pool
    free_waiters: [WaitQueue; NUM_POOLS],
    low_pct: u64,
    moderate_pct: u64,
}

impl Pressure {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            pools: SpinLock::new([PoolState::EMPTY; NUM_POOLS]),
            level_waiters: WaitQueue::new(),
            free_waiters: [WaitQueue::new(), WaitQueue::new()],
            low_pct: config.pressure_low_pct,
            moderate_pct: config.pressure_moderate_pct,
        }
    }

    fn level_for(&self, free: u64, total: u64) -> PressureLevel {
        if total == 0 {
            return PressureLevel::Low;
        }
        let pct = free.saturating_mul(100) / total;
        if pct >= self.low_pct {
            PressureLevel::Low
        } else if pct >= self.moderate_pct {
            PressureLevel::Moderate
        } else {
            PressureLevel::High
        }
    }

    /// Set a pool's total and free amount
    pub fn init_pool(&self, pool: Pool, total: u64, free: u64) {
        if free > total {
            panic!("pressure: {:?} initialized with free {} > total {}", pool, free, total);
        }
        let level = self.level_for(free, total);
        let mut pools = self.pools.lock();
        let st = &mut pools[pool as usize];
        st.total = total;
        st.free = free;
        st.level = level;
    }

    /// Set the low-water reserve of a pool
    pub fn set_threshold(&self, pool: Pool, threshold: u64) {
        self.pools.lock()[pool as usize].threshold = threshold;
    }

    /// Adjust a pool's free amount and wake whoever can now proceed
    pub fn add(&self, pool: Pool, delta: i64) {
        let (old, new, free, threshold) = {
            let mut pools = self.pools.lock();
            let st = &mut pools[pool as usize];
            let free = st.free as i64 + delta;
            if free < 0 || free as u64 > st.total {
                panic!(
                    "pressure: {:?} free {} + {} out of range (total {})",
                    pool, st.free, delta, st.total
                );
            }
            st.free = free as u64;
            let old = st.level;
            st.level = self.level_for(st.free, st.total);
            (old, st.level, st.free, st.threshold)
        };

        if new > old {
            log::trace!("pressure: {:?} {:?} -> {:?}", pool, old, new);
            self.level_waiters
                .wakeup_matching(usize::MAX, WaitResult::Normal, |w| {
                    let (set, min) = decode_level_event(&w.event);
                    set.contains(pool.set()) && new >= min
                });
        } else if free >= threshold {
            self.free_waiters[pool as usize].wakeup_all();
        }
    }

    /// Pressure of one pool
    pub fn level(&self, pool: Pool) -> PressureLevel {
        self.pools.lock()[pool as usize].level
    }

    /// Highest pressure over a set of pools
    pub fn pressure(&self, set: PoolSet) -> PressureLevel {
        let pools = self.pools.lock();
        Pool::ALL
            .iter()
            .filter(|p| set.contains(p.set()))
            .map(|p| pools[*p as usize].level)
            .max()
            .unwrap_or(PressureLevel::Low)
    }

    /// Free amount of a pool
    pub fn pool_free(&self, pool: Pool) -> u64 {
        self.pools.lock()[pool as usize].free
    }

    /// Total amount of a pool
    pub fn pool_total(&self, pool: Pool) -> u64 {
        self.pools.lock()[pool as usize].total
    }

    /// Would an allocation of `size` have to wait?
    pub fn must_wait(&self, pool: Pool, size: u64) -> bool {
        let pools = self.pools.lock();
        let st = &pools[pool as usize];
        st.free < size + st.threshold
    }

    /// Block until some pool in `set` reaches at least `min`
    ///
    /// Returns at once if the condition already holds.
    pub fn wait_for_pressure(
        &self,
        set: PoolSet,
        min: PressureLevel,
        timeout: Option<Duration>,
    ) -> WaitResult {
        if min == PressureLevel::Low {
            return WaitResult::Normal;
        }
        wait_event_until(&self.level_waiters, level_event(set, min), timeout, || {
            self.pressure(set) >= min
        })
    }

    /// Block until `pool` has `size` free above its low-water threshold
    pub fn wait_for_free(&self, pool: Pool, size: u64, timeout: Option<Duration>) -> WaitResult {
        wait_until(&self.free_waiters[pool as usize], timeout, || {
            !self.must_wait(pool, size)
        })
    }

    /// Release every waiter with `WaitResult::Interrupted`
    pub fn interrupt_waiters(&self) {
        self.level_waiters.interrupt_all();
        for queue in &self.free_waiters {
            queue.interrupt_all();
        }
    }
}

impl core::fmt::Debug for Pressure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let pools = self.pools.lock();
        f.debug_struct("Pressure")
            .field("kern", &pools[Pool::Kern as usize])
            .field("phys", &pools[Pool::Phys as usize])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn pressure() -> Pressure {
        testing::setup();
        Pressure::new(&VmConfig::default())
    }

    #[test]
    fn test_levels() {
        let p = pressure();
        p.init_pool(Pool::Kern, 100, 20);
        assert_eq!(p.level(Pool::Kern), PressureLevel::High);
        p.add(Pool::Kern, 10);
        assert_eq!(p.level(Pool::Kern), PressureLevel::Moderate);
        p.add(Pool::Kern, 19);
        assert_eq!(p.level(Pool::Kern), PressureLevel::Moderate);
        p.add(Pool::Kern, 1);
        assert_eq!(p.level(Pool::Kern), PressureLevel::Low);
    }

    #[test]
    fn test_pressure_is_max_over_set() {
        let p = pressure();
        p.init_pool(Pool::Kern, 100, 90);
        p.init_pool(Pool::Phys, 100, 10);
        assert_eq!(p.pressure(PoolSet::KERN), PressureLevel::Low);
        assert_eq!(p.pressure(PoolSet::KERN | PoolSet::PHYS), PressureLevel::High);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_underflow_panics() {
        let p = pressure();
        p.init_pool(Pool::Phys, 10, 1);
        p.add(Pool::Phys, -2);
    }

    #[test]
    fn test_wait_for_free_released_at_low() {
        let p = Arc::new(pressure());
        p.init_pool(Pool::Kern, 100, 20);
        assert_eq!(p.level(Pool::Kern), PressureLevel::High);

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let p = p.clone();
            let released = released.clone();
            thread::spawn(move || {
                let r = p.wait_for_free(Pool::Kern, 50, None);
                released.store(true, Ordering::SeqCst);
                r
            })
        };

        p.add(Pool::Kern, 20);
        assert_eq!(p.level(Pool::Kern), PressureLevel::Moderate);
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!released.load(Ordering::SeqCst));

        p.add(Pool::Kern, 10);
        assert_eq!(p.pool_free(Pool::Kern), 50);
        assert_eq!(p.level(Pool::Kern), PressureLevel::Low);
        assert_eq!(waiter.join().unwrap(), WaitResult::Normal);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_for_pressure_woken_on_increase() {
        let p = Arc::new(pressure());
        p.init_pool(Pool::Phys, 100, 100);

        let waiter = {
            let p = p.clone();
            thread::spawn(move || p.wait_for_pressure(PoolSet::PHYS, PressureLevel::Moderate, None))
        };

        p.add(Pool::Phys, -40);
        p.add(Pool::Phys, -30);
        assert_eq!(p.level(Pool::Phys), PressureLevel::Moderate);
        assert_eq!(waiter.join().unwrap(), WaitResult::Normal);
    }

    #[test]
    fn test_wait_for_pressure_ignores_other_pool() {
        let p = pressure();
        p.init_pool(Pool::Kern, 100, 100);
        p.init_pool(Pool::Phys, 100, 10);
        let r = p.wait_for_pressure(
            PoolSet::KERN,
            PressureLevel::Moderate,
            Some(Duration::from_millis(5)),
        );
        assert_eq!(r, WaitResult::TimedOut);
        assert_eq!(
            p.wait_for_pressure(PoolSet::PHYS, PressureLevel::High, None),
            WaitResult::Normal
        );
    }

    #[test]
    fn test_threshold_holds_back_allocations() {
        let p = pressure();
        p.init_pool(Pool::Phys, 100, 10);
        p.set_threshold(Pool::Phys, 8);
        assert!(p.must_wait(Pool::Phys, 4));
        assert!(!p.must_wait(Pool::Phys, 2));
    }
}
