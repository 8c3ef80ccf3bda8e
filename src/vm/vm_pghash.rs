//! Page Cache - Reverse Lookup from (object, offset) to Page
//!
//! Every resident page that belongs to an object is entered here under the
//! key (object id, offset). The entry is the page descriptor itself: a
//! bucket holds page ids and the key is read back from each page's owner
//! field. The low bits of the key carry a [`PageTag`]; offsets are always
//! page aligned so those bits are otherwise zero.
//!
//! One reader/writer lock covers the whole table. Insert, remove and
//! migrate are totally ordered against each other.

use alloc::vec::Vec;
use alloc::sync::Arc;

use crate::kern::lock::RwLock;
use crate::vm::vm_object::{VmObject, VmObjectId};
use crate::vm::vm_page::{PageFrames, PageId, PageOwner, VmPage, PAGE_MASK};

/// Minimum number of buckets
const PGHASH_MIN_BUCKETS: usize = 16;

/// Type tag stored in the low bits of a page-cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageTag {
    /// A resident page
    Page = 0,
    /// A page the pager holds on the object's behalf
    Pager = 1,
}

impl PageTag {
    pub fn from_key(key: u64) -> Self {
        if key & 1 == 1 {
            Self::Pager
        } else {
            Self::Page
        }
    }
}

fn make_key(offset: u64, tag: PageTag) -> u64 {
    if offset & PAGE_MASK != 0 {
        panic!("pghash: unaligned offset {:#x}", offset);
    }
    offset | tag as u64
}

/// Reverse page lookup table
pub struct PageCache {
    buckets: RwLock<Vec<Vec<PageId>>>,
    mask: u64,
}

impl PageCache {
    /// Size the table for `total_pages` frames
    pub fn with_capacity(total_pages: usize, shift: u32) -> Self {
        let n = (total_pages >> shift)
            .max(PGHASH_MIN_BUCKETS)
            .next_power_of_two();
        Self {
            buckets: RwLock::new((0..n).map(|_| Vec::new()).collect()),
            mask: n as u64 - 1,
        }
    }

    fn hash(&self, object: VmObjectId, offset: u64) -> usize {
        ((object.0.wrapping_mul(0x9e37_79b9) ^ (offset >> 12)) & self.mask) as usize
    }

    pub fn bucket_count(&self) -> usize {
        self.mask as usize + 1
    }

    /// Find the page at `offset` in `object`
    pub fn lookup<'a>(
        &self,
        frames: &'a PageFrames,
        object: VmObjectId,
        offset: u64,
    ) -> Option<(&'a VmPage, PageTag)> {
        let offset = offset & !PAGE_MASK;
        let buckets = self.buckets.read();
        buckets[self.hash(object, offset)]
            .iter()
            .map(|id| frames.page(*id))
            .find_map(|page| {
                let (id, key) = page.owner_key();
                (id == object && key & !PAGE_MASK == offset).then(|| (page, PageTag::from_key(key)))
            })
    }

    /// Enter `page` under (object, offset)
    ///
    /// The key must not be present.
    pub fn insert(
        &self,
        frames: &PageFrames,
        object: &Arc<VmObject>,
        tag: PageTag,
        offset: u64,
        page: &VmPage,
    ) {
        let key = make_key(offset, tag);
        let id = object.id();
        let mut buckets = self.buckets.write();
        let h = self.hash(id, offset);
        for other in buckets[h].iter().map(|p| frames.page(*p)) {
            let (oid, okey) = other.owner_key();
            if oid == id && okey & !PAGE_MASK == offset {
                panic!(
                    "pghash: object {} offset {:#x} already maps page {}",
                    id.0,
                    offset,
                    other.id().0
                );
            }
        }
        page.set_owner(PageOwner {
            object: Arc::downgrade(object),
            id,
            key,
        });
        buckets[h].push(page.id());
    }

    /// Remove `page` from the table and clear its owner
    pub fn remove(&self, object: VmObjectId, page: &VmPage) {
        let (id, key) = page.owner_key();
        if id != object {
            panic!(
                "pghash: page {} removed from object {} but owned by {}",
                page.id().0,
                object.0,
                id.0
            );
        }
        let mut buckets = self.buckets.write();
        let h = self.hash(id, key & !PAGE_MASK);
        let pos = buckets[h]
            .iter()
            .position(|p| *p == page.id())
            .unwrap_or_else(|| panic!("pghash: page {} not in table", page.id().0));
        buckets[h].swap_remove(pos);
        page.clear_owner();
    }

    /// Move `page` from `old` to `new`, keeping its offset
    ///
    /// The page stays in the table throughout; it is rehashed only if its
    /// bucket changes.
    pub fn migrate(&self, old: VmObjectId, page: &VmPage, new: &Arc<VmObject>) {
        let (id, key) = page.owner_key();
        if id != old {
            panic!("pghash: page {} migrated from {} but owned by {}", page.id().0, old.0, id.0);
        }
        let offset = key & !PAGE_MASK;
        let mut buckets = self.buckets.write();
        let from = self.hash(old, offset);
        let to = self.hash(new.id(), offset);

        page.set_owner(PageOwner {
            object: Arc::downgrade(new),
            id: new.id(),
            key,
        });

        if from != to {
            let pos = buckets[from]
                .iter()
                .position(|p| *p == page.id())
                .unwrap_or_else(|| panic!("pghash: page {} not in table", page.id().0));
            buckets[from].swap_remove(pos);
            buckets[to].push(page.id());
        }
    }

    /// Change the type tag of an entry in place
    pub fn retag(&self, page: &VmPage, tag: PageTag) {
        let _buckets = self.buckets.write();
        let mut owner = page.owner();
        owner.key = make_key(owner.offset(), tag);
        page.set_owner(owner);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageCache")
            .field("buckets", &self.bucket_count())
            .finish()
    }
}
