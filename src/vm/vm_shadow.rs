//! Shadow Objects - Copy-on-Write Chains
//!
//! A shadow object sits in front of a parent object and holds the pages
//! copied out of it. A miss walks the chain parent by parent for a
//! resident page and ends at the root object, which is faulted for read.
//! Whatever is found is copied into the shadow, so nothing below a shadow
//! is ever written through it.
//!
//! Each shadow counts its demand: mappings that will put a fresh shadow in
//! front of it on their next fault. A shadow left with one child, no
//! mappings and no demand is collapsed: the child takes over its pages and
//! links to the grandparent. A shadow left with no children at all is
//! destroyed.
//!
//! Locks along a chain are taken child first.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::error::{PagerError, VmError, VmResult};
use crate::vm::pmap::VmProt;
use crate::vm::vm_fault::{object_fault, PageRef};
use crate::vm::vm_object::{ObjectGuard, VmObject, VmObjectId};
use crate::vm::vm_page::{VmPage, PAGE_SIZE};
use crate::vm::vm_pager::{Pager, PagerFlags};
use crate::vm::Vm;

// ============================================================================
// Shadow State
// ============================================================================

/// Chain links of a shadow object, protected by its object lock
#[derive(Debug)]
pub struct ShadowState {
    pub(crate) parent: Option<Arc<VmObject>>,
    children: Vec<(VmObjectId, Weak<VmObject>)>,
    depth: usize,
    demand: usize,
}

impl ShadowState {
    /// Object this one shadows; `None` once destroyed or collapsed
    pub fn parent(&self) -> Option<&Arc<VmObject>> {
        self.parent.as_ref()
    }

    /// Distance from the root object
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn demand(&self) -> usize {
        self.demand
    }

    /// Number of live shadows of this object
    pub fn children(&self) -> usize {
        self.children.iter().filter(|(_, w)| w.strong_count() > 0).count()
    }

    fn prune(&mut self) {
        self.children.retain(|(_, w)| w.strong_count() > 0);
    }
}

/// Pager of shadow objects
///
/// Misses are filled from the chain by the fault path, never by the pager.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowPager;

impl Pager for ShadowPager {
    fn flags(&self) -> PagerFlags {
        PagerFlags::empty()
    }

    fn pagein(&self, _object: &VmObject, _offset: u64, _data: &mut [u8]) -> Result<(), PagerError> {
        Err(PagerError::Unsupported)
    }
}

/// Count a mapping that will shadow `obj` on its next fault
///
/// Root objects keep no count.
pub(crate) fn demand_register(obj: &mut ObjectGuard) {
    if let Some(shadow) = obj.shadow_mut() {
        shadow.demand += 1;
    }
}

/// Drop a demand that will never be turned into a shadow
pub(crate) fn demand_unregister(obj: &mut ObjectGuard) {
    let id = obj.id();
    if let Some(shadow) = obj.shadow_mut() {
        if shadow.demand == 0 {
            panic!("object {}: shadow demand underflow", id.0);
        }
        shadow.demand -= 1;
    }
}

// ============================================================================
// Chain Operations
// ============================================================================

impl Vm {
    /// Satisfy one demand on `object`
    ///
    /// Returns a new shadow of `size` bytes in front of `object`, or
    /// `object` itself when it is a shadow whose only user is the caller.
    /// A registered demand on a shadow object is consumed.
    pub fn demand_shadow(&self, object: &Arc<VmObject>, size: u64) -> Arc<VmObject> {
        let mut obj = object.lock();
        let id = obj.id();
        let depth = match obj.shadow_mut() {
            Some(shadow) => {
                if shadow.demand == 0 {
                    panic!("object {}: shadowed without demand", id.0);
                }
                shadow.prune();
                let needed = shadow.demand != 1 || !shadow.children.is_empty();
                shadow.demand -= 1;
                if !needed {
                    log::trace!("shadow: object {} reused by its sole user", id.0);
                    return object.clone();
                }
                shadow.depth + 1
            }
            None => 1,
        };

        let child = VmObject::new_shadow(
            size,
            ShadowState {
                parent: Some(object.clone()),
                children: Vec::new(),
                depth,
                demand: 0,
            },
        );
        if let Some(shadow) = obj.shadow_mut() {
            shadow.children.push((child.id(), Arc::downgrade(&child)));
        }
        log::debug!(
            "shadow: object {} shadows {} at depth {}",
            child.id().0,
            id.0,
            depth
        );
        child
    }

    /// Fill a miss at `offset` of the shadow `obj` by copying from its chain
    ///
    /// The page found closest up the chain is copied. A page from the root
    /// object is copied up to the end of the shadow and the rest of the
    /// page zeroed. The new page comes back with one pin.
    pub(crate) fn shadow_fault<'a>(&'a self, obj: &mut ObjectGuard, offset: u64) -> VmResult<&'a VmPage> {
        let (source, from_shadow) = self.shadow_chain_get(obj, offset)?;
        let page = self.object_page_alloc(obj, offset)?;
        let len = if from_shadow {
            PAGE_SIZE
        } else {
            (obj.size() - offset).min(PAGE_SIZE as u64) as usize
        };

        // Distinct frames; the new page is busy and the source pinned
        let dst = unsafe { self.frames.page_bytes(page) };
        let src: &[u8] = unsafe { self.frames.page_bytes(&source) };
        dst[..len].copy_from_slice(&src[..len]);
        dst[len..].fill(0);
        drop(source);

        page.clear_busy();
        self.fault_stats.incr_copies();
        log::trace!("shadow: object {} copied offset {:#x}", obj.id().0, offset);
        Ok(page)
    }

    /// Find the page backing `offset` below the shadow `obj`
    ///
    /// Returns the page pinned, and whether it belongs to a shadow rather
    /// than the root object.
    fn shadow_chain_get<'a>(&'a self, obj: &ObjectGuard, offset: u64) -> VmResult<(PageRef<'a>, bool)> {
        let first = obj
            .shadow()
            .and_then(|s| s.parent.clone())
            .ok_or(VmError::Fault)?;
        let mut cur = first.clone();
        loop {
            let mut guard = cur.lock();
            if guard.is_dead() && guard.is_shadow() {
                // Collapsed into a child while we walked; its pages moved
                // down the chain, so start over
                drop(guard);
                cur = first.clone();
                continue;
            }
            if !guard.is_shadow() {
                drop(guard);
                return object_fault(self, &cur, offset, VmProt::READ).map(|page| (page, false));
            }

            if let Some(id) = guard.resident(offset) {
                let page = self.frames.page(id);
                self.page_pin(page);
                if page.is_busy() {
                    let ok = guard.unlocked(|| page.busy_wait());
                    if !ok || page.owner_key().0 != guard.id() {
                        self.page_unpin(page);
                        continue;
                    }
                }
                return Ok((PageRef::adopt(self, page), true));
            }

            let next = guard
                .shadow()
                .and_then(|s| s.parent.clone())
                .ok_or(VmError::Fault)?;
            drop(guard);
            cur = next;
        }
    }

    /// A child of the shadow `parent` is gone
    pub(crate) fn shadow_detach(&self, child: VmObjectId, parent: Arc<VmObject>) {
        let mut obj = parent.lock();
        match obj.shadow_mut() {
            Some(shadow) => shadow.children.retain(|(id, _)| *id != child),
            None => return,
        }
        self.shadow_settle(obj);
    }

    /// Collapse or destroy a shadow nothing maps or demands any more
    ///
    /// Root objects and shadows still in use are left alone.
    pub fn shadow_settle(&self, mut obj: ObjectGuard) {
        if obj.is_dead() || !obj.mappings().is_empty() {
            return;
        }
        let children = match obj.shadow_mut() {
            Some(shadow) if shadow.demand == 0 => {
                shadow.prune();
                shadow.children.len()
            }
            _ => return,
        };
        match children {
            0 => {
                let object = obj.object().clone();
                drop(obj);
                self.object_destroy(object);
            }
            1 => self.shadow_collapse(obj),
            _ => {}
        }
    }

    /// Merge the shadow `parent` into its only child
    ///
    /// Pages the child already holds win. The child then shadows the
    /// grandparent directly and `parent` is dead.
    fn shadow_collapse(&self, parent: ObjectGuard) {
        let Some(child) = parent
            .shadow()
            .and_then(|s| s.children.first())
            .and_then(|(_, w)| w.upgrade())
        else {
            return;
        };
        let object = parent.object().clone();
        drop(parent);

        let mut dst = child.lock();
        let mut src = object.lock();
        let collapsible = !src.is_dead()
            && !dst.is_dead()
            && src.mappings().is_empty()
            && src.shadow().is_some_and(|s| {
                s.demand == 0 && s.children.len() == 1 && s.children[0].0 == child.id()
            });
        if !collapsible {
            return;
        }

        self.object_migrate(&mut src, &mut dst);
        let grandparent = src.shadow_mut().and_then(|s| {
            s.children.clear();
            s.parent.take()
        });
        src.mark_dead();
        if let Some(shadow) = dst.shadow_mut() {
            shadow.parent = grandparent.clone();
            shadow.depth = shadow.depth.saturating_sub(1);
        }
        if let Some(grandparent) = &grandparent {
            let mut g = grandparent.lock();
            if let Some(shadow) = g.shadow_mut() {
                for link in shadow.children.iter_mut() {
                    if link.0 == object.id() {
                        *link = (child.id(), Arc::downgrade(&child));
                    }
                }
            }
        }
        drop(src);
        drop(dst);

        object.pager().destroy(&object);
        log::debug!("shadow: object {} collapsed into {}", object.id().0, child.id().0);
    }
}
