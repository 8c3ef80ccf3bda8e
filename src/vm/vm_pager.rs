//! Pagers - Backing Store Strategies
//!
//! A pager fills pages of an object on fault and writes dirty pages back
//! when pageout evicts them. Two are provided: [`AnonPager`] for anonymous
//! memory (zero fill, never paged out) and [`VnodePager`] for memory backed
//! by a file through the [`BackingStore`] seam.

use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PagerError, VmError, VmResult};
use crate::vm::vm_object::{ObjectGuard, VmObject};
use crate::vm::vm_page::VmPage;
use crate::vm::Vm;

bitflags! {
    /// Pager capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerFlags: u32 {
        /// Pages only exist once entered in the page cache; a miss is
        /// filled with `init_page`, never read from the pager
        const PGHASH = 1 << 0;
        /// Pages take part in pageout
        const PAGEOUT = 1 << 1;
    }
}

/// Backing-store strategy of an object
pub trait Pager: Send + Sync {
    fn flags(&self) -> PagerFlags;

    /// Fill `data` with the contents at `offset`
    fn pagein(&self, object: &VmObject, offset: u64, data: &mut [u8]) -> Result<(), PagerError>;

    /// Write `data` back to `offset`
    fn pageout(&self, _object: &VmObject, _offset: u64, _data: &[u8]) -> Result<(), PagerError> {
        Err(PagerError::Unsupported)
    }

    /// Fill a page that has no backing yet
    fn init_page(&self, _object: &VmObject, _offset: u64, data: &mut [u8]) -> Result<(), PagerError> {
        data.fill(0);
        Ok(())
    }

    /// The object is going away
    fn destroy(&self, _object: &VmObject) {}
}

// ============================================================================
// Anonymous Pager
// ============================================================================

/// Zero-fill memory
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonPager;

impl Pager for AnonPager {
    fn flags(&self) -> PagerFlags {
        PagerFlags::empty()
    }

    fn pagein(&self, object: &VmObject, offset: u64, data: &mut [u8]) -> Result<(), PagerError> {
        self.init_page(object, offset, data)
    }
}

// ============================================================================
// Vnode Pager
// ============================================================================

/// File I/O layer under a [`VnodePager`]
pub trait BackingStore: Send + Sync {
    /// Read at `offset`; returns the bytes read, short at end of file
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PagerError>;

    /// Write at `offset`
    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, PagerError>;

    /// File size in bytes
    fn size(&self) -> u64;
}

impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PagerError> {
        (**self).read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, PagerError> {
        (**self).write(offset, buf)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// Pager statistics
#[derive(Debug, Default)]
pub struct PagerStats {
    pub pageins: AtomicU64,
    pub pageouts: AtomicU64,
    pub errors: AtomicU64,
}

/// File-backed pager
#[derive(Debug)]
pub struct VnodePager<S> {
    store: S,
    pub stats: PagerStats,
}

impl<S: BackingStore> VnodePager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stats: PagerStats::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn count_error<T>(&self, r: Result<T, PagerError>) -> Result<T, PagerError> {
        if r.is_err() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        r
    }
}

impl<S: BackingStore> Pager for VnodePager<S> {
    fn flags(&self) -> PagerFlags {
        PagerFlags::PAGEOUT
    }

    fn pagein(&self, _object: &VmObject, offset: u64, data: &mut [u8]) -> Result<(), PagerError> {
        if offset >= self.store.size() {
            return Err(PagerError::NotFound);
        }
        let n = self.count_error(self.store.read(offset, data))?;
        data[n..].fill(0);
        self.stats.pageins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pageout(&self, _object: &VmObject, offset: u64, data: &[u8]) -> Result<(), PagerError> {
        let size = self.store.size();
        if offset >= size {
            return Ok(());
        }
        let len = data.len().min((size - offset) as usize);
        self.count_error(self.store.write(offset, &data[..len]))?;
        self.stats.pageouts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Pager-level Pagein and Pageout
// ============================================================================

impl Vm {
    /// Allocate a page for `offset` and fill it from the pager
    ///
    /// The object lock is dropped during the fill; the page stays busy so
    /// concurrent faults on it wait. On success the page is returned with
    /// one pin. On failure the page carries the error and is freed once
    /// every waiter has let go.
    pub fn pager_pagein<'a>(&'a self, obj: &mut ObjectGuard, offset: u64) -> VmResult<&'a VmPage> {
        let object = obj.object().clone();
        let page = self.object_page_alloc(obj, offset)?;
        let pager = object.pager();
        let from_pager = !pager.flags().contains(PagerFlags::PGHASH);

        let result = obj.unlocked(|| {
            let data = unsafe { self.frames.page_bytes(page) };
            if from_pager {
                pager.pagein(&object, offset, data)
            } else {
                pager.init_page(&object, offset, data)
            }
        });

        match result {
            Ok(()) => {
                page.clear_busy();
                Ok(page)
            }
            Err(e) => {
                log::warn!(
                    "pager: pagein of object {} offset {:#x} failed: {}",
                    object.id().0,
                    offset,
                    e
                );
                self.object_page_error(obj, page);
                self.page_unpin(page);
                Err(VmError::from(e))
            }
        }
    }

    /// Unmap `page`, mark it busy, and write it back if dirty
    ///
    /// The page stays busy on return; `pageout_done` finishes it. The
    /// object lock is dropped while the pager writes.
    pub fn pager_pageout(&self, obj: &mut ObjectGuard, page: &VmPage) -> Result<(), PagerError> {
        self.object_unmap_page(obj, page);
        page.mark_busy();
        if !page.is_dirty() {
            return Ok(());
        }

        let object = obj.object().clone();
        let offset = page.owner().offset();
        let result = obj.unlocked(|| {
            let data: &[u8] = unsafe { self.frames.page_bytes(page) };
            object.pager().pageout(&object, offset, data)
        });
        if let Err(e) = result {
            log::warn!(
                "pager: pageout of object {} offset {:#x} failed: {}",
                object.id().0,
                offset,
                e
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MemStore};
    use crate::vm::vm_page::{PageState, PAGE_SIZE};
    use crate::vm::vm_pghash::PageTag;

    fn file(len: usize) -> Arc<MemStore> {
        Arc::new(MemStore::new((0..len).map(|i| (i % 251) as u8).collect()))
    }

    #[test]
    fn test_anon_zero_fill() {
        let vm = testing::test_vm(2);
        let object = vm.object_alloc(PAGE_SIZE as u64, Arc::new(AnonPager));
        let mut obj = object.lock();
        let page = vm.pager_pagein(&mut obj, 0).unwrap();
        assert!(!page.is_busy());
        assert!(unsafe { vm.frames.page_bytes(page) }.iter().all(|b| *b == 0));
        assert_eq!(page.state(), PageState::Normal);
        vm.page_unpin(page);
        vm.object_clear(&mut obj);
    }

    #[test]
    fn test_vnode_pagein_reads_and_pads() {
        let vm = testing::test_vm(4);
        let store = file(PAGE_SIZE + 10);
        let pager = Arc::new(VnodePager::new(store.clone()));
        let object = vm.object_alloc(2 * PAGE_SIZE as u64, pager.clone());
        let mut obj = object.lock();

        let page = vm.pager_pagein(&mut obj, PAGE_SIZE as u64).unwrap();
        let bytes = unsafe { vm.frames.page_bytes(page) };
        assert_eq!(bytes[0], (PAGE_SIZE % 251) as u8);
        assert_eq!(bytes[9], ((PAGE_SIZE + 9) % 251) as u8);
        assert!(bytes[10..].iter().all(|b| *b == 0));
        assert_eq!(page.state(), PageState::Pinned);
        assert_eq!(pager.stats.pageins.load(Ordering::Relaxed), 1);
        vm.page_unpin(page);
        assert_eq!(page.state(), PageState::Pgout);
        vm.object_clear(&mut obj);
    }

    #[test]
    fn test_pagein_error_frees_page() {
        let vm = testing::test_vm(2);
        let store = file(PAGE_SIZE);
        store.fail_reads(true);
        let object = vm.object_alloc(PAGE_SIZE as u64, Arc::new(VnodePager::new(store)));
        let mut obj = object.lock();

        assert_eq!(vm.pager_pagein(&mut obj, 0).err(), Some(VmError::Io));
        assert_eq!(obj.resident_count(), 0);
        assert!(vm.pghash.is_empty());
        assert_eq!(vm.frames.free_count(), 2);
    }

    #[test]
    fn test_pagein_past_eof() {
        let vm = testing::test_vm(2);
        let object = vm.object_alloc(
            4 * PAGE_SIZE as u64,
            Arc::new(VnodePager::new(file(100))),
        );
        let mut obj = object.lock();
        assert_eq!(
            vm.pager_pagein(&mut obj, 2 * PAGE_SIZE as u64).err(),
            Some(VmError::NotFound)
        );
        assert_eq!(vm.frames.free_count(), 2);
    }

    struct HashedPager;

    impl Pager for HashedPager {
        fn flags(&self) -> PagerFlags {
            PagerFlags::PGHASH
        }

        fn pagein(&self, _: &VmObject, _: u64, _: &mut [u8]) -> Result<(), PagerError> {
            panic!("pagein called for a hashed pager");
        }

        fn init_page(&self, _: &VmObject, _: u64, data: &mut [u8]) -> Result<(), PagerError> {
            data.fill(0x5A);
            Ok(())
        }
    }

    #[test]
    fn test_pghash_pager_uses_init_page() {
        let vm = testing::test_vm(2);
        let object = vm.object_alloc(PAGE_SIZE as u64, Arc::new(HashedPager));
        let mut obj = object.lock();
        let page = vm.pager_pagein(&mut obj, 0).unwrap();
        assert!(unsafe { vm.frames.page_bytes(page) }.iter().all(|b| *b == 0x5A));
        let (_, tag) = vm.pghash.lookup(&vm.frames, object.id(), 0).unwrap();
        assert_eq!(tag, PageTag::Page);
        vm.page_unpin(page);
        vm.object_clear(&mut obj);
    }

    #[test]
    fn test_pageout_writes_only_dirty() {
        let vm = testing::test_vm(2);
        let store = file(PAGE_SIZE);
        let pager = Arc::new(VnodePager::new(store.clone()));
        let object = vm.object_alloc(PAGE_SIZE as u64, pager.clone());
        let mut obj = object.lock();

        let page = vm.pager_pagein(&mut obj, 0).unwrap();
        vm.page_unpin(page);

        assert_eq!(vm.pager_pageout(&mut obj, page), Ok(()));
        assert!(page.is_busy());
        assert_eq!(pager.stats.pageouts.load(Ordering::Relaxed), 0);
        page.clear_busy();

        (unsafe { vm.frames.page_bytes(page) })[0] = 0xEE;
        if page.dirty() {
            obj.note_dirty();
        }
        assert_eq!(vm.pager_pageout(&mut obj, page), Ok(()));
        assert_eq!(store.contents()[0], 0xEE);
        assert_eq!(pager.stats.pageouts.load(Ordering::Relaxed), 1);
        page.clear_busy();
        vm.object_clear(&mut obj);
    }
}
