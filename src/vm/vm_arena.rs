//! Address-Interval Allocator
//!
//! Carves address ranges out of one contiguous span. Every node is an
//! allocation `[addr, addr + size)` followed by the free room up to the
//! next node. A root node of size zero sits at the start of the span and
//! owns the room before the first allocation, so an address-ordered walk
//! always covers the span with no gaps and no overlaps.
//!
//! Nodes are indexed twice: by address, and by free room for best-fit
//! search. The arena has no lock of its own; each owner wraps it in one.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use crate::error::ArenaError;

/// Handle to an arena node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

/// One node as seen by callers: allocation start, size, and trailing room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaNode {
    pub addr: u64,
    pub size: u64,
    pub free: u64,
}

impl ArenaNode {
    /// End of the allocation
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    /// End of the trailing free room
    pub fn limit(&self) -> u64 {
        self.addr + self.size + self.free
    }
}

fn align_up(addr: u64, align: u64) -> Option<u64> {
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

// ============================================================================
// Arena
// ============================================================================

/// Best-fit address-interval allocator
#[derive(Debug)]
pub struct Arena {
    start: u64,
    size: u64,
    nodes: Vec<Option<ArenaNode>>,
    spare: Vec<u32>,
    root: NodeId,
    /// Keyed by (addr, 0) for the root and (addr, 1) for allocations, so
    /// the root sorts before an allocation at the start of the span
    by_addr: BTreeMap<(u64, u8), NodeId>,
    /// (free room, addr, node)
    by_free: BTreeSet<(u64, u64, NodeId)>,
}

impl Arena {
    /// Arena over `[start, start + size)`, all of it free
    pub fn new(start: u64, size: u64) -> Self {
        let mut arena = Self {
            start,
            size,
            nodes: Vec::new(),
            spare: Vec::new(),
            root: NodeId(0),
            by_addr: BTreeMap::new(),
            by_free: BTreeSet::new(),
        };
        arena.root = arena.link(ArenaNode {
            addr: start,
            size: 0,
            free: size,
        });
        arena
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The node at the start of the span that owns the leading free room
    pub fn root(&self) -> NodeId {
        self.root
    }

    fn get(&self, id: NodeId) -> ArenaNode {
        match self.nodes.get(id.0 as usize).copied().flatten() {
            Some(node) => node,
            None => panic!("arena: stale node {:?}", id),
        }
    }

    fn addr_key(&self, id: NodeId, addr: u64) -> (u64, u8) {
        (addr, (id != self.root) as u8)
    }

    /// Store a node and enter it in both indexes
    fn link(&mut self, node: ArenaNode) -> NodeId {
        let id = match self.spare.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                NodeId(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() as u32 - 1)
            }
        };
        let key = self.addr_key(id, node.addr);
        if self.by_addr.insert(key, id).is_some() {
            panic!("arena: two nodes at {:#x}", node.addr);
        }
        self.by_free.insert((node.free, node.addr, id));
        id
    }

    fn unlink(&mut self, id: NodeId) -> ArenaNode {
        let node = self.get(id);
        let key = self.addr_key(id, node.addr);
        self.by_addr.remove(&key);
        self.by_free.remove(&(node.free, node.addr, id));
        self.nodes[id.0 as usize] = None;
        self.spare.push(id.0);
        node
    }

    /// Replace a node's extent, re-keying both indexes
    fn update(&mut self, id: NodeId, new: ArenaNode) {
        let old = self.get(id);
        if old.addr != new.addr {
            let (old_key, new_key) = (self.addr_key(id, old.addr), self.addr_key(id, new.addr));
            self.by_addr.remove(&old_key);
            self.by_addr.insert(new_key, id);
        }
        if old.free != new.free || old.addr != new.addr {
            self.by_free.remove(&(old.free, old.addr, id));
            self.by_free.insert((new.free, new.addr, id));
        }
        self.nodes[id.0 as usize] = Some(new);
    }

    /// Last node starting at or below `addr`
    fn covering(&self, addr: u64) -> Option<NodeId> {
        self.by_addr.range(..=(addr, 1)).next_back().map(|(_, id)| *id)
    }

    /// Node whose free room runs up to `id`
    fn predecessor(&self, id: NodeId) -> NodeId {
        let node = self.get(id);
        match self.by_addr.range(..self.addr_key(id, node.addr)).next_back() {
            Some((_, prev)) => *prev,
            None => panic!("arena: node at {:#x} has no predecessor", node.addr),
        }
    }

    /// Allocate `size` bytes aligned to `align` from the smallest free
    /// room that fits
    pub fn alloc(&mut self, size: u64, align: u64) -> Result<NodeId, ArenaError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(ArenaError::InvalidArgument);
        }

        let mut found = None;
        for &(free, _, id) in self.by_free.range((size, 0, NodeId(0))..) {
            let node = self.get(id);
            let Some(base) = align_up(node.end(), align) else {
                continue;
            };
            if (base - node.end()).checked_add(size).is_some_and(|need| need <= free) {
                found = Some((id, base));
                break;
            }
        }
        let (donor, base) = found.ok_or(ArenaError::NoSpace)?;

        let mut node = self.get(donor);
        let limit = node.limit();
        node.free = base - node.end();
        self.update(donor, node);
        Ok(self.link(ArenaNode {
            addr: base,
            size,
            free: limit - base - size,
        }))
    }

    /// Place an allocation at a fixed address
    ///
    /// The range must lie entirely within one node's free room.
    pub fn insert_at(&mut self, addr: u64, size: u64) -> Result<NodeId, ArenaError> {
        let end = addr.checked_add(size).ok_or(ArenaError::InvalidArgument)?;
        if size == 0 {
            return Err(ArenaError::InvalidArgument);
        }
        let donor = self.covering(addr).ok_or(ArenaError::NotFree)?;
        let mut node = self.get(donor);
        if addr < node.end() || end > node.limit() {
            return Err(ArenaError::NotFree);
        }
        let limit = node.limit();
        node.free = addr - node.end();
        self.update(donor, node);
        Ok(self.link(ArenaNode {
            addr,
            size,
            free: limit - addr - size,
        }))
    }

    /// Release an allocation; its span and room join the previous node
    pub fn free(&mut self, id: NodeId) {
        if id == self.root {
            panic!("arena: freeing the root node");
        }
        let prev = self.predecessor(id);
        let node = self.unlink(id);
        let mut p = self.get(prev);
        p.free += node.size + node.free;
        self.update(prev, p);
    }

    /// Give back the first `n` bytes of an allocation
    pub fn free_head(&mut self, id: NodeId, n: u64) {
        let mut node = self.get(id);
        if n >= node.size {
            panic!("arena: trimming {:#x} of {:#x}-byte node", n, node.size);
        }
        let prev = self.predecessor(id);
        let mut p = self.get(prev);
        p.free += n;
        self.update(prev, p);
        node.addr += n;
        node.size -= n;
        self.update(id, node);
    }

    /// Give back the last `n` bytes of an allocation
    pub fn free_tail(&mut self, id: NodeId, n: u64) {
        let mut node = self.get(id);
        if n >= node.size {
            panic!("arena: trimming {:#x} of {:#x}-byte node", n, node.size);
        }
        node.size -= n;
        node.free += n;
        self.update(id, node);
    }

    pub fn node(&self, id: NodeId) -> ArenaNode {
        self.get(id)
    }

    /// Allocation covering `addr`
    pub fn lookup(&self, addr: u64) -> Option<NodeId> {
        let id = self.covering(addr)?;
        let node = self.get(id);
        (addr < node.end()).then_some(id)
    }

    /// First allocation overlapping `[addr, addr + size)`
    pub fn first_node(&self, addr: u64, size: u64) -> Option<NodeId> {
        if let Some(id) = self.lookup(addr) {
            return Some(id);
        }
        self.by_addr
            .range((addr, 0)..(addr + size, 0))
            .map(|(_, id)| *id)
            .find(|id| self.get(*id).size > 0)
    }

    /// Nodes in address order, root first
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, ArenaNode)> + '_ {
        self.by_addr.values().map(move |id| (*id, self.get(*id)))
    }

    /// Number of allocations, not counting the root
    pub fn len(&self) -> usize {
        self.by_addr.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total free room
    pub fn free_space(&self) -> u64 {
        self.by_free.iter().map(|(free, _, _)| *free).sum()
    }

    /// Walk every node and panic on a gap or an overlap
    pub fn check(&self) {
        let mut expect = self.start;
        for (id, node) in self.iter() {
            if node.addr != expect {
                panic!(
                    "arena: node {:?} at {:#x}, previous room ends at {:#x}",
                    id, node.addr, expect
                );
            }
            if !self.by_free.contains(&(node.free, node.addr, id)) {
                panic!("arena: node {:?} missing from the free index", id);
            }
            expect = node.limit();
        }
        if expect != self.start + self.size {
            panic!(
                "arena: nodes end at {:#x}, span ends at {:#x}",
                expect,
                self.start + self.size
            );
        }
        if self.by_free.len() != self.by_addr.len() {
            panic!("arena: index sizes differ");
        }
    }
}
