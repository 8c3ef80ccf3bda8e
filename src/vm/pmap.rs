//! Physical Map Interface
//!
//! The machine-dependent page-table layer is outside this crate. The VM
//! talks to it through [`Pmap`]: install a translation, remove a range,
//! translate an address. One implementation serves every address space;
//! spaces are told apart by [`SpaceId`].

use bitflags::bitflags;
use thiserror::Error;

use crate::vm::vm_page::VmPage;
use crate::vm::Vm;

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u64);

impl SpaceId {
    /// The kernel address space
    pub const KERNEL: Self = Self(0);
}

bitflags! {
    /// Protection of a mapping, also used for the access of a fault
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Pmap operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmapError {
    /// No memory for page tables
    #[error("no memory for page tables")]
    NoMemory,
    /// Address outside what the hardware can map
    #[error("invalid address")]
    InvalidAddress,
}

impl From<PmapError> for crate::error::VmError {
    fn from(err: PmapError) -> Self {
        match err {
            PmapError::NoMemory => Self::NoMemory,
            PmapError::InvalidAddress => Self::Fault,
        }
    }
}

/// Page-table layer
pub trait Pmap: Send + Sync {
    /// Map the page at physical `paddr` at `vaddr`
    fn map(&self, space: SpaceId, vaddr: u64, paddr: u64, prot: VmProt) -> Result<(), PmapError>;

    /// Remove every translation in [vaddr, vaddr + size)
    fn unmap(&self, space: SpaceId, vaddr: u64, size: u64);

    /// Physical address `vaddr` translates to
    fn translate(&self, space: SpaceId, vaddr: u64) -> Option<u64>;
}

impl Vm {
    /// Page descriptor behind a mapped virtual address
    pub fn page_for(&self, space: SpaceId, vaddr: u64) -> Option<&VmPage> {
        let paddr = self.pmap.translate(space, vaddr)?;
        self.frames.phys_to_page(paddr)
    }
}
