//! VM Map - Address Space Management
//!
//! An address space is a range of virtual addresses carved by an [`Arena`]
//! into map entries, each backed by a window of a VM object. Faults are
//! resolved against the entries and installed through the [`Pmap`].
//!
//! Private writable mappings are copy-on-write after a fork: an entry
//! flagged [`MapFlags::SHADOW`] puts a shadow object in front of its
//! backing object on the next fault and writes only ever reach that
//! shadow.
//!
//! [`Pmap`]: crate::vm::pmap::Pmap

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::error::{VmError, VmResult};
use crate::kern::lock::Mutex;
use crate::vm::pmap::{SpaceId, VmProt};
use crate::vm::vm_arena::{Arena, NodeId};
use crate::vm::vm_fault::object_fault;
use crate::vm::vm_object::{Mapping, VmObject};
use crate::vm::vm_page::{round_page, trunc_page, PAGE_MASK, PAGE_SIZE};
use crate::vm::vm_pressure::Pool;
use crate::vm::vm_shadow::{demand_register, demand_unregister};
use crate::vm::Vm;

// ============================================================================
// Map Entry
// ============================================================================

bitflags! {
    /// Mapping attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Writes reach the object and every space that shares it,
        /// forked children included
        const SHARED = 1 << 0;
        /// The next fault shadows the backing object first
        const SHADOW = 1 << 1;
    }
}

/// One mapping in an address space
#[derive(Debug, Clone)]
pub struct MapEntry {
    /// First mapped address
    pub base: u64,
    /// Length in bytes, a page multiple
    pub size: u64,
    /// Backing object
    pub object: Arc<VmObject>,
    /// Object offset mapped at `base`
    pub offset: u64,
    /// Protection
    pub prot: VmProt,
    /// Highest protection `protect` may grant
    pub max_prot: VmProt,
    pub flags: MapFlags,
    node: NodeId,
}

impl MapEntry {
    /// Check if address is in this entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Object offset backing `addr`
    pub fn offset_of(&self, addr: u64) -> u64 {
        self.offset + (addr - self.base)
    }

    fn mapping(&self, space: SpaceId) -> Mapping {
        Mapping {
            space,
            base: self.base,
            offset: self.offset,
            size: self.size,
            prot: self.prot,
        }
    }
}

struct SpaceInner {
    arena: Arena,
    entries: BTreeMap<u64, MapEntry>,
}

// ============================================================================
// Address Space
// ============================================================================

/// A kernel or user address space
pub struct AddressSpace {
    id: SpaceId,
    inner: Mutex<SpaceInner>,
}

impl AddressSpace {
    /// Address space covering `[start, start + size)`
    pub fn new(id: SpaceId, start: u64, size: u64) -> Arc<Self> {
        if start & PAGE_MASK != 0 || size & PAGE_MASK != 0 {
            panic!("space {}: range {:#x}+{:#x} not page aligned", id.0, start, size);
        }
        Arc::new(Self {
            id,
            inner: Mutex::new(SpaceInner {
                arena: Arena::new(start, size),
                entries: BTreeMap::new(),
            }),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Map `size` bytes of `object` starting at `offset` anywhere
    pub fn map_object(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        size: u64,
        prot: VmProt,
    ) -> VmResult<u64> {
        self.enter(None, object, offset, size, prot, MapFlags::empty())
    }

    /// Map `size` bytes of `object` at a fixed address
    pub fn map_fixed(
        &self,
        addr: u64,
        object: &Arc<VmObject>,
        offset: u64,
        size: u64,
        prot: VmProt,
    ) -> VmResult<u64> {
        if addr & PAGE_MASK != 0 {
            return Err(VmError::InvalidArgument);
        }
        self.enter(Some(addr), object, offset, size, prot, MapFlags::empty())
    }

    /// Map `object` copy-on-write: writes never reach the object
    pub fn map_private(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        size: u64,
        prot: VmProt,
    ) -> VmResult<u64> {
        self.enter(None, object, offset, size, prot, MapFlags::SHADOW)
    }

    /// Map `object` so that forked spaces keep sharing it
    pub fn map_shared(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        size: u64,
        prot: VmProt,
    ) -> VmResult<u64> {
        self.enter(None, object, offset, size, prot, MapFlags::SHARED)
    }

    fn enter(
        &self,
        addr: Option<u64>,
        object: &Arc<VmObject>,
        offset: u64,
        size: u64,
        prot: VmProt,
        flags: MapFlags,
    ) -> VmResult<u64> {
        if size == 0 || offset & PAGE_MASK != 0 {
            return Err(VmError::InvalidArgument);
        }
        let size = round_page(size);

        let mut inner = self.inner.lock();
        let node = match addr {
            Some(addr) => inner.arena.insert_at(addr, size)?,
            None => inner.arena.alloc(size, PAGE_SIZE as u64)?,
        };
        let base = inner.arena.node(node).addr;
        let entry = MapEntry {
            base,
            size,
            object: object.clone(),
            offset,
            prot,
            max_prot: prot,
            flags,
            node,
        };

        let mut obj = object.lock();
        if flags.contains(MapFlags::SHADOW) {
            demand_register(&mut obj);
        }
        obj.map_add(entry.mapping(self.id));
        drop(obj);
        inner.entries.insert(base, entry);
        log::trace!(
            "space {}: mapped object {} at {:#x}+{:#x}",
            self.id.0,
            object.id().0,
            base,
            size
        );
        Ok(base)
    }

    /// Remove the mapping that starts at `addr`
    ///
    /// A shadow object left without mappings or children goes away with it.
    pub fn unmap(&self, vm: &Vm, addr: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(&addr).ok_or(VmError::NotFound)?;
        vm.pmap.unmap(self.id, entry.base, entry.size);
        inner.arena.free(entry.node);

        let mut obj = entry.object.lock();
        obj.map_rem(self.id, entry.base);
        if entry.flags.contains(MapFlags::SHADOW) {
            demand_unregister(&mut obj);
        }
        vm.shadow_settle(obj);
        Ok(())
    }

    /// Change the protection of `[addr, addr + size)`
    ///
    /// The range must lie within one mapping, which is split so that only
    /// the range changes. Nothing mapped at `addr` is not an error.
    /// Revoked rights drop the range's translations, so the next access
    /// faults against the new protection.
    pub fn protect(&self, vm: &Vm, addr: u64, size: u64, prot: VmProt) -> VmResult<()> {
        if size == 0 || addr & PAGE_MASK != 0 || size & PAGE_MASK != 0 {
            return Err(VmError::InvalidArgument);
        }
        let end = addr.checked_add(size).ok_or(VmError::InvalidArgument)?;

        let mut inner = self.inner.lock();
        let Some(entry) = inner
            .entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(addr))
        else {
            return Ok(());
        };
        let (base, entry_end) = (entry.base, entry.base + entry.size);
        if end > entry_end {
            return Err(VmError::InvalidArgument);
        }
        if !entry.max_prot.contains(prot) {
            return Err(VmError::Fault);
        }
        if entry.prot == prot {
            return Ok(());
        }

        if addr > base {
            self.split(vm, &mut inner, base, addr - base)?;
        }
        if end < entry_end {
            self.split(vm, &mut inner, addr, size)?;
        }

        let entry = inner.entries.get_mut(&addr).ok_or(VmError::NotFound)?;
        let old = entry.prot;
        entry.prot = prot;
        let mut obj = entry.object.lock();
        obj.map_rem(self.id, addr);
        obj.map_add(entry.mapping(self.id));
        if !prot.contains(old) {
            vm.pmap.unmap(self.id, addr, size);
        }
        drop(obj);
        log::trace!(
            "space {}: protect {:#x}+{:#x} {:?} -> {:?}",
            self.id.0,
            addr,
            size,
            old,
            prot
        );
        Ok(())
    }

    /// Cut the entry at `base` in two, `at` bytes in
    ///
    /// A pending shadow is resolved first so both halves end up on the same
    /// object.
    fn split(&self, vm: &Vm, inner: &mut SpaceInner, base: u64, at: u64) -> VmResult<()> {
        self.resolve_shadow(vm, inner, base);
        let SpaceInner { arena, entries } = inner;
        let entry = entries.get_mut(&base).ok_or(VmError::NotFound)?;
        if at == 0 || at >= entry.size {
            return Err(VmError::InvalidArgument);
        }

        let tail_size = entry.size - at;
        arena.free_tail(entry.node, tail_size);
        let node = arena.insert_at(base + at, tail_size)?;
        entry.size = at;
        let tail = MapEntry {
            base: base + at,
            size: tail_size,
            offset: entry.offset + at,
            node,
            ..entry.clone()
        };

        let mut obj = entry.object.lock();
        obj.map_rem(self.id, base);
        obj.map_add(entry.mapping(self.id));
        obj.map_add(tail.mapping(self.id));
        drop(obj);
        entries.insert(tail.base, tail);
        Ok(())
    }

    /// Give the entry at `base` its own shadow if it is waiting for one
    fn resolve_shadow(&self, vm: &Vm, inner: &mut SpaceInner, base: u64) {
        let Some(entry) = inner.entries.get_mut(&base) else {
            return;
        };
        if !entry.flags.contains(MapFlags::SHADOW) {
            return;
        }
        entry.flags.remove(MapFlags::SHADOW);
        let shadow = vm.demand_shadow(&entry.object, entry.offset + entry.size);
        if Arc::ptr_eq(&shadow, &entry.object) {
            return;
        }

        // Translations still point at pages of the old object
        let mut old = entry.object.lock();
        old.map_rem(self.id, base);
        vm.pmap.unmap(self.id, base, entry.size);
        drop(old);
        shadow.lock().map_add(entry.mapping(self.id));
        log::trace!(
            "space {}: {:#x} now backed by shadow {}",
            self.id.0,
            base,
            shadow.id().0
        );
        entry.object = shadow;
    }

    /// Duplicate this space as `id`, every mapping at the same address
    ///
    /// Shared and never-writable mappings are shared with the child.
    /// Writable private mappings become copy-on-write on both sides, and
    /// the parent's translations are dropped so its next write faults.
    pub fn fork(&self, vm: &Vm, id: SpaceId) -> VmResult<Arc<AddressSpace>> {
        let mut inner = self.inner.lock();
        let child = AddressSpace::new(id, inner.arena.start(), inner.arena.size());
        {
            let mut child_inner = child.inner.lock();
            for entry in inner.entries.values_mut() {
                let mut obj = entry.object.lock();
                if !entry.flags.contains(MapFlags::SHARED) && entry.max_prot.contains(VmProt::WRITE) {
                    if !entry.flags.contains(MapFlags::SHADOW) {
                        entry.flags.insert(MapFlags::SHADOW);
                        demand_register(&mut obj);
                    }
                    vm.pmap.unmap(self.id, entry.base, entry.size);
                }

                let node = child_inner.arena.insert_at(entry.base, entry.size)?;
                if entry.flags.contains(MapFlags::SHADOW) {
                    demand_register(&mut obj);
                }
                let copy = MapEntry {
                    node,
                    ..entry.clone()
                };
                obj.map_add(copy.mapping(id));
                drop(obj);
                child_inner.entries.insert(copy.base, copy);
            }
        }
        log::debug!("space {}: forked into space {}", self.id.0, id.0);
        Ok(child)
    }

    /// Mapping covering `addr`
    pub fn lookup(&self, addr: u64) -> Option<MapEntry> {
        let inner = self.inner.lock();
        let (_, entry) = inner.entries.range(..=addr).next_back()?;
        entry.contains(addr).then(|| entry.clone())
    }

    /// Every mapping, in address order
    pub fn entries(&self) -> Vec<MapEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Resolve a fault at `addr`
    ///
    /// Fails with `Fault` if nothing is mapped there or the mapping does not
    /// allow `access`, and with `Io`/`NotFound` if the pager cannot fill
    /// the page. Running out of frames is waited out.
    pub fn fault(&self, vm: &Vm, addr: u64, access: VmProt) -> VmResult<()> {
        let vaddr = trunc_page(addr);
        loop {
            let entry = self.lookup(vaddr).ok_or(VmError::Fault)?;
            if !entry.prot.contains(access) {
                return Err(VmError::Fault);
            }
            if entry.flags.contains(MapFlags::SHADOW) {
                let mut inner = self.inner.lock();
                self.resolve_shadow(vm, &mut inner, entry.base);
                continue;
            }
            let offset = entry.offset_of(vaddr);

            let page = match object_fault(vm, &entry.object, offset, access) {
                Ok(page) => page,
                Err(VmError::NoMemory) => {
                    vm.fault_stats.incr_memory_waits();
                    log::debug!("space {}: fault at {:#x} waiting for memory", self.id.0, vaddr);
                    vm.pressure.wait_for_free(Pool::Phys, PAGE_SIZE as u64, None);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Map with the object locked so eviction and unmap cannot slip
            // in between
            let obj = entry.object.lock();
            let still_mapped = obj
                .mappings()
                .iter()
                .any(|m| m.space == self.id && m.base == entry.base);
            if obj.resident(offset) != Some(page.id()) || !still_mapped {
                drop(obj);
                drop(page);
                vm.fault_stats.incr_retries();
                continue;
            }

            // Leave clean pages read-only so the first write faults again
            let mut prot = entry.prot;
            if !access.contains(VmProt::WRITE) && !page.is_dirty() {
                prot.remove(VmProt::WRITE);
            }
            vm.pmap.map(self.id, vaddr, vm.frames.page_to_phys(&page), prot)?;
            return Ok(());
        }
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("entries", &self.inner.lock().entries.len())
            .finish()
    }
}
