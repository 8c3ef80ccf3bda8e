//! vmcore - virtual-memory core of a monolithic kernel
//!
//! This crate provides page-frame lifecycle management, VM objects and
//! pagers, the page cache, the pageout and reclaim daemons, the kernel
//! heap, the address-interval allocator, and the sync and wait primitives
//! all of it is built on.
//!
//! The page-table layer, the scheduler, and block I/O are consumed
//! through the [`vm::Pmap`], [`kern::sched::Scheduler`] and
//! [`vm::BackingStore`] traits.

#![cfg_attr(not(test), no_std)]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod kern;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

pub use config::VmConfig;
pub use error::{ArenaError, PagerError, VmError, VmResult, WaitError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "vmcore";
