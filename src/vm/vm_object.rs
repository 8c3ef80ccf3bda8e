//! VM Object - Logical Memory Container
//!
//! A VM object is the backing of every mapping: a size, a pager that fills
//! and writes back its pages, the set of resident pages, and the list of
//! address-space ranges that map it. The `Arc` around the object is its
//! reference count.
//!
//! ## Locking
//!
//! The object lock is a blocking lock. Every change of a page's owner
//! (insert, remove, migrate) happens with the owning object's lock held.
//! The fault path locks object then page. Pageout goes the other way round
//! through [`Vm::page_lock_object`], which only ever try-locks the object
//! while it holds the page lock and backs off otherwise.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::kern::lock::Mutex;
use crate::vm::pmap::{SpaceId, VmProt};
use crate::vm::vm_page::{round_page, trunc_page, AllocFlags, PageId, VmPage, PAGE_MASK, PAGE_SIZE};
use crate::vm::vm_pager::{Pager, PagerFlags};
use crate::vm::vm_pghash::PageTag;
use crate::vm::vm_shadow::{ShadowPager, ShadowState};
use crate::vm::Vm;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// One address-space range that maps (part of) an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub space: SpaceId,
    /// Virtual address of the start of the range
    pub base: u64,
    /// Object offset mapped at `base`
    pub offset: u64,
    pub size: u64,
    pub prot: VmProt,
}

impl Mapping {
    /// Virtual address of `offset` in this mapping, if it covers it
    pub fn vaddr_of(&self, offset: u64) -> Option<u64> {
        (offset >= self.offset && offset < self.offset + self.size)
            .then(|| self.base + (offset - self.offset))
    }
}

/// State protected by the object lock
#[derive(Debug)]
pub struct ObjectState {
    size: u64,
    /// Resident pages by offset
    pages: BTreeMap<u64, PageId>,
    maps: Vec<Mapping>,
    /// Number of resident pages with DIRTY set
    dirty: usize,
    dead: bool,
    /// Chain links, only for shadow objects
    shadow: Option<ShadowState>,
}

impl ObjectState {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    pub fn resident(&self, offset: u64) -> Option<PageId> {
        self.pages.get(&trunc_page(offset)).copied()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.maps
    }

    pub fn is_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn shadow(&self) -> Option<&ShadowState> {
        self.shadow.as_ref()
    }

    pub(crate) fn shadow_mut(&mut self) -> Option<&mut ShadowState> {
        self.shadow.as_mut()
    }

    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Record a mapping of this object
    pub fn map_add(&mut self, mapping: Mapping) {
        self.maps.push(mapping);
    }

    /// Forget the mapping of `space` at `base`
    pub fn map_rem(&mut self, space: SpaceId, base: u64) -> Option<Mapping> {
        let pos = self
            .maps
            .iter()
            .position(|m| m.space == space && m.base == base)?;
        Some(self.maps.swap_remove(pos))
    }

    pub(crate) fn note_dirty(&mut self) {
        self.dirty += 1;
    }

    pub(crate) fn note_clean(&mut self) {
        if self.dirty == 0 {
            panic!("object: dirty count underflow");
        }
        self.dirty -= 1;
    }
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// VM Object - represents a unit of backing store
pub struct VmObject {
    id: VmObjectId,
    pager: Arc<dyn Pager>,
    state: Mutex<ObjectState>,
}

impl VmObject {
    /// Create an object of `size` bytes backed by `pager`
    pub fn new(size: u64, pager: Arc<dyn Pager>) -> Arc<Self> {
        Self::with_state(size, pager, None)
    }

    /// Create a copy-on-write shadow in front of `shadow.parent`
    pub(crate) fn new_shadow(size: u64, shadow: ShadowState) -> Arc<Self> {
        Self::with_state(size, Arc::new(ShadowPager), Some(shadow))
    }

    fn with_state(size: u64, pager: Arc<dyn Pager>, shadow: Option<ShadowState>) -> Arc<Self> {
        Arc::new(Self {
            id: VmObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            pager,
            state: Mutex::new(ObjectState {
                size,
                pages: BTreeMap::new(),
                maps: Vec::new(),
                dirty: 0,
                dead: false,
                shadow,
            }),
        })
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn pager(&self) -> &Arc<dyn Pager> {
        &self.pager
    }

    /// Take the object lock
    pub fn lock(self: &Arc<Self>) -> ObjectGuard {
        self.state.raw().acquire();
        ObjectGuard {
            object: self.clone(),
        }
    }

    pub fn try_lock(self: &Arc<Self>) -> Option<ObjectGuard> {
        self.state.raw().try_acquire().then(|| ObjectGuard {
            object: self.clone(),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("pager", &self.pager.flags())
            .finish_non_exhaustive()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let state = self.state.lock();
        if !state.pages.is_empty() {
            log::warn!(
                "object {}: dropped with {} resident pages, use object_destroy",
                self.id.0,
                state.pages.len()
            );
        }
    }
}

/// Held object lock
///
/// The guard keeps its own reference on the object, so the lock may be
/// released and re-taken around a sleep with [`ObjectGuard::unlocked`].
pub struct ObjectGuard {
    object: Arc<VmObject>,
}

impl ObjectGuard {
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    pub fn id(&self) -> VmObjectId {
        self.object.id
    }

    /// Run `f` with the object lock dropped
    ///
    /// Anything read from the object state before the call must be
    /// revalidated afterwards.
    pub fn unlocked<R, F: FnOnce() -> R>(&mut self, f: F) -> R {
        self.object.state.raw().release();
        let r = f();
        self.object.state.raw().acquire();
        r
    }
}

impl Deref for ObjectGuard {
    type Target = ObjectState;

    fn deref(&self) -> &ObjectState {
        // The guard holds the lock for its whole lifetime except inside
        // `unlocked`, which borrows the guard mutably.
        unsafe { self.object.state.data_unchecked() }
    }
}

impl DerefMut for ObjectGuard {
    fn deref_mut(&mut self) -> &mut ObjectState {
        unsafe { self.object.state.data_unchecked() }
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        self.object.state.raw().release();
    }
}

// ============================================================================
// Object Operations
// ============================================================================

impl Vm {
    /// Create an object
    pub fn object_alloc(&self, size: u64, pager: Arc<dyn Pager>) -> Arc<VmObject> {
        let object = VmObject::new(size, pager);
        log::debug!("object {}: created, size {:#x}", object.id.0, size);
        object
    }

    /// Tear an object down
    ///
    /// Every page is flushed out of pageout, unmapped and released, then
    /// the pager is told. The object must no longer be mapped. A shadow
    /// object also leaves its parent's children, which may let the parent
    /// collapse or go away.
    pub fn object_destroy(&self, object: Arc<VmObject>) {
        let parent = {
            let mut obj = object.lock();
            if !obj.maps.is_empty() {
                panic!(
                    "object {}: destroyed while mapped {} times",
                    object.id.0,
                    obj.maps.len()
                );
            }
            self.object_clear(&mut obj);
            obj.dead = true;
            obj.shadow.as_mut().and_then(|s| s.parent.take())
        };
        object.pager.destroy(&object);
        log::debug!("object {}: destroyed", object.id.0);
        if let Some(parent) = parent {
            self.shadow_detach(object.id, parent);
        }
    }

    /// Lock the object that owns `page`
    ///
    /// Returns `None` if the page has no live owner. The page lock is only
    /// held while the owner is read; the object lock is tried, never waited
    /// for, under it. On contention the page lock is dropped, the object
    /// lock is taken with a temporary reference, and ownership is checked
    /// again because the page may have migrated in between.
    pub fn page_lock_object(&self, page: &VmPage) -> Option<ObjectGuard> {
        loop {
            page.lock();
            let Some(object) = page.object() else {
                page.unlock();
                return None;
            };
            if let Some(guard) = object.try_lock() {
                page.unlock();
                return Some(guard);
            }
            page.unlock();

            let guard = object.lock();
            if page.owner_key().0 == object.id {
                return Some(guard);
            }
            drop(guard);
        }
    }

    /// Allocate a page for `offset` and enter it in the object
    ///
    /// The page comes back busy with one pin held by the caller.
    pub fn object_page_alloc<'a>(&'a self, obj: &mut ObjectGuard, offset: u64) -> VmResult<&'a VmPage> {
        let offset = trunc_page(offset);
        if obj.pages.contains_key(&offset) {
            panic!("object {}: offset {:#x} already resident", obj.id().0, offset);
        }
        let page = self.alloc_page(AllocFlags::empty())?;
        page.mark_busy();
        self.page_pin(page);
        self.object_page_insert(obj, PageTag::Page, offset, page);
        Ok(page)
    }

    fn object_page_insert(&self, obj: &mut ObjectGuard, tag: PageTag, offset: u64, page: &VmPage) {
        self.pghash.insert(&self.frames, &obj.object, tag, offset, page);
        obj.pages.insert(offset, page.id());
        if obj.object.pager.flags().contains(PagerFlags::PAGEOUT) {
            self.pageout.add(page);
        }
    }

    /// Enter a filled page the pager supplies ahead of any fault
    ///
    /// The page is tagged [`PageTag::Pager`] until the first fault claims
    /// it. An offset that is already resident is left alone.
    pub fn object_supply_page(&self, obj: &mut ObjectGuard, offset: u64, data: &[u8]) -> VmResult<()> {
        let offset = trunc_page(offset);
        if offset >= obj.size || data.len() > PAGE_SIZE {
            return Err(VmError::InvalidArgument);
        }
        if obj.pages.contains_key(&offset) {
            return Ok(());
        }
        let page = self.alloc_page(AllocFlags::ZERO)?;
        let bytes = unsafe { self.frames.page_bytes(page) };
        bytes[..data.len()].copy_from_slice(data);
        self.object_page_insert(obj, PageTag::Pager, offset, page);
        Ok(())
    }

    /// Take a page out of the object and the page cache
    ///
    /// The page itself is not freed.
    pub fn object_page_remove(&self, obj: &mut ObjectGuard, page: &VmPage) {
        let offset = page.owner().offset();
        self.pghash.remove(obj.id(), page);
        if obj.pages.remove(&offset) != Some(page.id()) {
            panic!(
                "object {}: page {} not resident at {:#x}",
                obj.id().0,
                page.id().0,
                offset
            );
        }
        if page.clean() {
            obj.note_clean();
        }
    }

    /// Remove a page and free it once the last pin is gone
    pub fn object_page_free(&self, obj: &mut ObjectGuard, page: &VmPage) {
        self.page_pin(page);
        self.pageout_rem(obj, page);
        if page.owner_key().0 == obj.id() {
            self.object_page_remove(obj, page);
            page.set_dealloc();
        }
        self.page_unpin(page);
    }

    /// Fail the I/O on a busy page
    ///
    /// Waiters see the error and the page leaves the object. It is freed
    /// when the last pin, including the caller's, is dropped.
    pub fn object_page_error(&self, obj: &mut ObjectGuard, page: &VmPage) {
        page.mark_error();
        if page.owner_key().0 == obj.id() {
            self.pageout_rem(obj, page);
            self.object_unmap_page(obj, page);
            self.object_page_remove(obj, page);
        }
    }

    /// Remove a page from every address space mapping the object
    pub fn object_unmap_page(&self, obj: &ObjectGuard, page: &VmPage) {
        let offset = page.owner().offset();
        for map in obj.maps.iter() {
            if let Some(vaddr) = map.vaddr_of(offset) {
                self.pmap.unmap(map.space, vaddr, PAGE_SIZE as u64);
            }
        }
    }

    /// Evict one resident page: out of pageout, unmapped, removed, freed
    fn object_page_evict(&self, obj: &mut ObjectGuard, page: &VmPage) {
        self.page_pin(page);
        self.pageout_rem(obj, page);
        if page.is_busy() {
            obj.unlocked(|| page.busy_wait());
        }
        if page.owner_key().0 == obj.id() {
            self.object_unmap_page(obj, page);
            self.object_page_remove(obj, page);
            page.set_dealloc();
        }
        self.page_unpin(page);
    }

    /// Evict every resident page
    pub fn object_clear(&self, obj: &mut ObjectGuard) {
        while let Some(id) = obj.pages.values().next().copied() {
            let page = self.frames.page(id);
            self.object_page_evict(obj, page);
        }
    }

    /// Change the object size
    ///
    /// Shrinking evicts every page past the new end and zeroes the tail of
    /// a partial last page.
    pub fn object_resize(&self, obj: &mut ObjectGuard, size: u64) {
        let end = round_page(size);
        while let Some(id) = obj.pages.range(end..).next().map(|(_, id)| *id) {
            let page = self.frames.page(id);
            self.object_page_evict(obj, page);
        }
        if size & PAGE_MASK != 0 && size < obj.size {
            if let Some(id) = obj.resident(size) {
                let tail = (size & PAGE_MASK) as usize;
                self.frames.zero_range(self.frames.page(id), tail, PAGE_SIZE - tail);
            }
        }
        obj.size = size;
    }

    /// Move every page of `src` into `dst` at the same offset
    ///
    /// Pages `dst` already holds win; the `src` copy is freed. Busy pages
    /// are waited for with the `src` lock dropped.
    pub fn object_migrate(&self, src: &mut ObjectGuard, dst: &mut ObjectGuard) {
        let offsets: Vec<u64> = src.pages.keys().copied().collect();
        for offset in offsets {
            let Some(id) = src.resident(offset) else {
                continue;
            };
            let page = self.frames.page(id);
            if dst.pages.contains_key(&offset) {
                self.object_page_evict(src, page);
                continue;
            }

            self.page_pin(page);
            if page.is_busy() {
                src.unlocked(|| page.busy_wait());
                if page.owner_key().0 != src.id() {
                    self.page_unpin(page);
                    continue;
                }
            }
            self.object_unmap_page(src, page);

            page.lock();
            self.pghash.migrate(src.id(), page, &dst.object);
            page.unlock();

            src.pages.remove(&offset);
            dst.pages.insert(offset, id);
            if page.is_dirty() {
                src.note_clean();
                dst.note_dirty();
            }
            self.page_unpin(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::vm::vm_page::PageState;
    use crate::vm::vm_pager::AnonPager;
    use std::thread;

    fn anon(vm: &Vm, pages: u64) -> Arc<VmObject> {
        vm.object_alloc(pages * PAGE_SIZE as u64, Arc::new(AnonPager))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = VmObject::new(0, Arc::new(AnonPager));
        let b = VmObject::new(0, Arc::new(AnonPager));
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), VmObjectId::NULL);
    }

    #[test]
    fn test_page_alloc_enters_cache() {
        let vm = testing::test_vm(4);
        let object = anon(&vm, 4);
        let mut obj = object.lock();
        let page = vm.object_page_alloc(&mut obj, 0x2000).unwrap();
        assert!(page.is_busy());
        assert_eq!(page.pincnt(), 1);
        assert_eq!(obj.resident(0x2000), Some(page.id()));
        let (found, tag) = vm.pghash.lookup(&vm.frames, object.id(), 0x2000).unwrap();
        assert_eq!(found.id(), page.id());
        assert_eq!(tag, PageTag::Page);
        page.clear_busy();
        vm.page_unpin(page);
        vm.object_clear(&mut obj);
    }

    #[test]
    fn test_page_free_deferred_while_pinned() {
        let vm = testing::test_vm(4);
        let object = anon(&vm, 1);
        let mut obj = object.lock();
        let page = vm.object_page_alloc(&mut obj, 0).unwrap();
        page.clear_busy();

        vm.object_page_free(&mut obj, page);
        assert_eq!(obj.resident_count(), 0);
        assert!(vm.pghash.lookup(&vm.frames, object.id(), 0).is_none());
        assert_eq!(page.state(), PageState::Normal);

        vm.page_unpin(page);
        assert_eq!(page.state(), PageState::Free);
        assert_eq!(vm.frames.free_count(), 4);
    }

    #[test]
    fn test_page_error_frees_on_last_unpin() {
        let vm = testing::test_vm(2);
        let object = anon(&vm, 1);
        let mut obj = object.lock();
        let page = vm.object_page_alloc(&mut obj, 0).unwrap();
        vm.object_page_error(&mut obj, page);
        assert_eq!(obj.resident_count(), 0);
        vm.page_unpin(page);
        assert_eq!(page.state(), PageState::Free);
        assert!(page.flags().is_empty());
    }

    #[test]
    fn test_dirty_counter_follows_removal() {
        let vm = testing::test_vm(4);
        let object = anon(&vm, 2);
        let mut obj = object.lock();
        let page = vm.object_page_alloc(&mut obj, 0).unwrap();
        page.clear_busy();
        if page.dirty() {
            obj.note_dirty();
        }
        assert_eq!(obj.dirty_count(), 1);
        vm.page_unpin(page);
        vm.object_clear(&mut obj);
        assert_eq!(obj.dirty_count(), 0);
        assert_eq!(vm.frames.free_count(), 4);
    }

    #[test]
    fn test_resize_truncates_and_zeroes_tail() {
        let vm = testing::test_vm(8);
        let object = anon(&vm, 4);
        let mut obj = object.lock();
        for i in 0..4u64 {
            let page = vm.object_page_alloc(&mut obj, i * PAGE_SIZE as u64).unwrap();
            unsafe { vm.frames.page_bytes(page) }.fill(0xAB);
            page.clear_busy();
            vm.page_unpin(page);
        }

        let new_size = PAGE_SIZE as u64 + 100;
        vm.object_resize(&mut obj, new_size);
        assert_eq!(obj.size(), new_size);
        assert_eq!(obj.resident_count(), 2);
        assert!(obj.resident(2 * PAGE_SIZE as u64).is_none());

        let last = vm.frames.page(obj.resident(PAGE_SIZE as u64).unwrap());
        let bytes = unsafe { vm.frames.page_bytes(last) };
        assert!(bytes[..100].iter().all(|b| *b == 0xAB));
        assert!(bytes[100..].iter().all(|b| *b == 0));
        assert_eq!(vm.frames.free_count(), 6);
        vm.object_clear(&mut obj);
    }

    #[test]
    fn test_migrate_moves_pages_and_frees_shadowed() {
        let vm = testing::test_vm(8);
        let from = anon(&vm, 4);
        let to = anon(&vm, 4);
        let mut src = from.lock();
        let mut dst = to.lock();

        for i in 0..3u64 {
            let page = vm.object_page_alloc(&mut src, i * PAGE_SIZE as u64).unwrap();
            page.clear_busy();
            vm.page_unpin(page);
        }
        let kept = vm.object_page_alloc(&mut dst, PAGE_SIZE as u64).unwrap();
        kept.clear_busy();
        vm.page_unpin(kept);

        vm.object_migrate(&mut src, &mut dst);
        assert_eq!(src.resident_count(), 0);
        assert_eq!(dst.resident_count(), 3);
        assert_eq!(dst.resident(PAGE_SIZE as u64), Some(kept.id()));
        for i in 0..3u64 {
            let off = i * PAGE_SIZE as u64;
            assert!(vm.pghash.lookup(&vm.frames, from.id(), off).is_none());
            let (page, _) = vm.pghash.lookup(&vm.frames, to.id(), off).unwrap();
            assert_eq!(page.owner_key().0, to.id());
        }
        assert_eq!(vm.frames.free_count(), 5);
        vm.object_clear(&mut dst);
    }

    #[test]
    fn test_destroy_releases_pages() {
        let vm = testing::test_vm(4);
        let object = anon(&vm, 4);
        {
            let mut obj = object.lock();
            for i in 0..3u64 {
                let page = vm.object_page_alloc(&mut obj, i * PAGE_SIZE as u64).unwrap();
                page.clear_busy();
                vm.page_unpin(page);
            }
        }
        assert_eq!(vm.frames.free_count(), 1);
        vm.object_destroy(object.clone());
        assert_eq!(vm.frames.free_count(), 4);
        assert!(vm.pghash.is_empty());
        assert!(object.lock().is_dead());
    }

    #[test]
    #[should_panic(expected = "destroyed while mapped")]
    fn test_destroy_mapped_panics() {
        let vm = testing::test_vm(1);
        let object = anon(&vm, 1);
        object.lock().map_add(Mapping {
            space: SpaceId(1),
            base: 0x10000,
            offset: 0,
            size: PAGE_SIZE as u64,
            prot: VmProt::READ,
        });
        vm.object_destroy(object);
    }

    #[test]
    fn test_unmap_page_hits_every_mapping() {
        let (vm, pmap) = testing::test_vm_with_pmap(2);
        let object = anon(&vm, 2);
        let mut obj = object.lock();
        obj.map_add(Mapping {
            space: SpaceId(1),
            base: 0x10000,
            offset: 0,
            size: 2 * PAGE_SIZE as u64,
            prot: VmProt::READ,
        });
        obj.map_add(Mapping {
            space: SpaceId(2),
            base: 0x40000,
            offset: PAGE_SIZE as u64,
            size: PAGE_SIZE as u64,
            prot: VmProt::READ | VmProt::WRITE,
        });
        let page = vm.object_page_alloc(&mut obj, PAGE_SIZE as u64).unwrap();
        vm.object_unmap_page(&obj, page);

        let unmapped = pmap.unmapped();
        assert!(unmapped.contains(&(SpaceId(1), 0x11000)));
        assert!(unmapped.contains(&(SpaceId(2), 0x40000)));

        assert!(obj.map_rem(SpaceId(1), 0x10000).is_some());
        assert!(obj.map_rem(SpaceId(1), 0x10000).is_none());
        obj.map_rem(SpaceId(2), 0x40000);
        page.clear_busy();
        vm.page_unpin(page);
        vm.object_clear(&mut obj);
    }

    #[test]
    fn test_lock_object_follows_migration() {
        let vm = Arc::new(testing::test_vm(2));
        let from = anon(&vm, 1);
        let to = anon(&vm, 1);

        let page_id = {
            let mut src = from.lock();
            let page = vm.object_page_alloc(&mut src, 0).unwrap();
            page.clear_busy();
            vm.page_unpin(page);
            page.id()
        };

        let mut src = from.lock();
        let locker = {
            let vm = vm.clone();
            thread::spawn(move || {
                let page = vm.frames.page(page_id);
                let guard = vm.page_lock_object(page).unwrap();
                guard.id()
            })
        };
        thread::sleep(std::time::Duration::from_millis(20));
        {
            let mut dst = to.lock();
            vm.object_migrate(&mut src, &mut dst);
        }
        drop(src);

        assert_eq!(locker.join().unwrap(), to.id());
        vm.object_destroy(to);
    }

    #[test]
    fn test_supply_page_is_pager_tagged() {
        let vm = testing::test_vm(2);
        let object = anon(&vm, 2);
        let mut obj = object.lock();
        vm.object_supply_page(&mut obj, PAGE_SIZE as u64, b"supplied").unwrap();
        let (page, tag) = vm.pghash.lookup(&vm.frames, object.id(), PAGE_SIZE as u64).unwrap();
        assert_eq!(tag, PageTag::Pager);
        assert_eq!(&unsafe { vm.frames.page_bytes(page) }[..8], b"supplied");
        assert_eq!(
            vm.object_supply_page(&mut obj, 4 * PAGE_SIZE as u64, b"x"),
            Err(VmError::InvalidArgument)
        );
        vm.object_clear(&mut obj);
    }
}
