//! Record pools backing the memory map.
//!
//! The manager cannot call into a dynamic allocator: the kernel's allocators
//! are built on top of *it*. Instead, all map records and ownership nodes
//! live in a fixed slab that the bootstrap path carves out of the very
//! memory being mapped. Records released by merges go onto an internal
//! recycling chain (`free_mapitems` / `free_pids`) and are handed back out
//! by later splits; the slab itself never grows or moves.

use core::mem;

use crate::chunk::{ChunkId, MemoryChunk, Pid, PidNodeId};

/// Fixed-capacity slab of [`MemoryChunk`] records with a free-list of
/// recycled slots threaded through `next_mapitem`.
pub(crate) struct ChunkPool {
    slots: &'static mut [MemoryChunk],
    free_mapitems: Option<ChunkId>,
}

impl ChunkPool {
    /// Take ownership of `capacity` records' worth of memory at `base` and
    /// initialize every slot as spare.
    ///
    /// # Safety
    /// `base` must be suitably aligned, point to at least
    /// `capacity * size_of::<MemoryChunk>()` bytes of otherwise-unused
    /// memory, and stay valid for the life of the pool.
    pub(crate) unsafe fn carve(base: *mut MemoryChunk, capacity: usize) -> ChunkPool {
        debug_assert!(capacity > 0);
        debug_assert!(base as usize % mem::align_of::<MemoryChunk>() == 0);

        for index in 0..capacity {
            let next = if index + 1 < capacity {
                Some(ChunkId::from_index(index + 1))
            } else {
                None
            };
            base.add(index).write(MemoryChunk::unused(next));
        }

        ChunkPool {
            slots: core::slice::from_raw_parts_mut(base, capacity),
            free_mapitems: Some(ChunkId::from_index(0)),
        }
    }

    /// Hand out a spare record, reset to a blank state. `None` when the pool
    /// is exhausted; the caller reports that as an ordinary allocation
    /// failure.
    pub(crate) fn allocate(&mut self) -> Option<ChunkId> {
        let id = self.free_mapitems?;
        self.free_mapitems = self.get(id).next_mapitem;
        self.get_mut(id).next_mapitem = None;
        Some(id)
    }

    /// Return a record to the spare chain. The record's owner set must
    /// already be empty.
    pub(crate) fn release(&mut self, id: ChunkId) {
        debug_assert!(self.get(id).owners.is_empty());
        let head = self.free_mapitems;
        let record = self.get_mut(id);
        record.size = 0;
        record.allocatable = false;
        record.next_buddy = None;
        record.next_mapitem = head;
        self.free_mapitems = Some(id);
    }

    pub(crate) fn get(&self, id: ChunkId) -> &MemoryChunk {
        &self.slots[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: ChunkId) -> &mut MemoryChunk {
        &mut self.slots[id.index()]
    }

    pub(crate) fn spare_records(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_mapitems;
        while let Some(id) = cur {
            count += 1;
            cur = self.get(id).next_mapitem;
        }
        count
    }
}

/// Ownership node: one spilled owner of a chunk whose inline slots are full.
pub(crate) struct PidNode {
    pub pid: Pid,
    pub next: Option<PidNodeId>,
}

/// Fixed pool of [`PidNode`]s, the `free_pids` reserve.
pub(crate) struct PidPool {
    nodes: &'static mut [PidNode],
    free_pids: Option<PidNodeId>,
}

impl PidPool {
    /// # Safety
    /// Same contract as [`ChunkPool::carve`].
    pub(crate) unsafe fn carve(base: *mut PidNode, capacity: usize) -> PidPool {
        debug_assert!(capacity > 0);
        debug_assert!(base as usize % mem::align_of::<PidNode>() == 0);

        for index in 0..capacity {
            let next = if index + 1 < capacity {
                Some(PidNodeId::from_index(index + 1))
            } else {
                None
            };
            base.add(index).write(PidNode {
                pid: Pid::KERNEL,
                next,
            });
        }

        PidPool {
            nodes: core::slice::from_raw_parts_mut(base, capacity),
            free_pids: Some(PidNodeId::from_index(0)),
        }
    }

    pub(crate) fn allocate(&mut self, pid: Pid, next: Option<PidNodeId>) -> Option<PidNodeId> {
        let id = self.free_pids?;
        self.free_pids = self.node(id).next;
        let node = self.node_mut(id);
        node.pid = pid;
        node.next = next;
        Some(id)
    }

    pub(crate) fn release(&mut self, id: PidNodeId) {
        let head = self.free_pids;
        let node = self.node_mut(id);
        node.pid = Pid::KERNEL;
        node.next = head;
        self.free_pids = Some(id);
    }

    pub(crate) fn node(&self, id: PidNodeId) -> &PidNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: PidNodeId) -> &mut PidNode {
        &mut self.nodes[id.index()]
    }

    pub(crate) fn spare_nodes(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_pids;
        while let Some(id) = cur {
            count += 1;
            cur = self.node(id).next;
        }
        count
    }
}

#[cfg(test)]
mod test {
    use super::{ChunkPool, MemoryChunk};
    use x86_64::PhysAddr;

    fn pool(capacity: usize) -> ChunkPool {
        let layout = std::alloc::Layout::array::<MemoryChunk>(capacity).expect("layout");
        let base = unsafe { std::alloc::alloc(layout) } as *mut MemoryChunk;
        assert!(!base.is_null());
        unsafe { ChunkPool::carve(base, capacity) }
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut chunks = pool(3);
        assert_eq!(chunks.spare_records(), 3);

        let a = chunks.allocate().unwrap();
        let b = chunks.allocate().unwrap();
        let c = chunks.allocate().unwrap();
        assert_eq!(chunks.spare_records(), 0);
        assert!(chunks.allocate().is_none());

        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_release_recycles_records() {
        let mut chunks = pool(2);
        let a = chunks.allocate().unwrap();

        chunks.get_mut(a).location = PhysAddr::new(0x1000);
        chunks.get_mut(a).size = 0x2000;
        chunks.get_mut(a).allocatable = true;
        chunks.release(a);
        assert_eq!(chunks.spare_records(), 2);

        // The recycled record comes back blank
        let again = chunks.allocate().unwrap();
        assert_eq!(again, a);
        assert_eq!(chunks.get(again).size, 0);
        assert!(chunks.get(again).next_mapitem.is_none());
        assert!(chunks.get(again).next_buddy.is_none());
    }
}
