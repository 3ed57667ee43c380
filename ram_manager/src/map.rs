//! The chunk map proper: one address-ordered chain covering all of physical
//! memory, plus the two free chains threaded through its free records.

use log::trace;
use x86_64::PhysAddr;

use crate::chunk::{ChunkId, MemoryChunk};
use crate::pool::{ChunkPool, PidPool};
use crate::LOW_MEMORY_LIMIT;

/// Mutable state of the manager, guarded by the map mutex in
/// [`crate::RamManager`]. The outer/inner layering follows the usual
/// pattern: the lock wraps everything that can change.
pub(crate) struct MapInner {
    pub(crate) chunks: ChunkPool,
    pub(crate) pids: PidPool,

    /// Head of the full map (the chunk at physical address 0)
    pub(crate) map_head: Option<ChunkId>,

    /// First map item at or above the 1 MiB boundary
    pub(crate) phy_highmmap: Option<ChunkId>,

    /// Free chains for each half of memory, in ascending address order
    pub(crate) free_lowmem: Option<ChunkId>,
    pub(crate) free_highmem: Option<ChunkId>,
}

impl MapInner {
    pub(crate) fn chunk(&self, id: ChunkId) -> &MemoryChunk {
        self.chunks.get(id)
    }

    /// Look up the chunk starting exactly at `location`.
    ///
    /// High lookups start the walk at the low/high boundary marker instead
    /// of the map head.
    pub(crate) fn find_thischunk(&self, location: PhysAddr) -> Option<ChunkId> {
        let mut cur = match self.phy_highmmap {
            Some(boundary) if location.as_u64() >= LOW_MEMORY_LIMIT => Some(boundary),
            _ => self.map_head,
        };

        while let Some(id) = cur {
            let chunk = self.chunk(id);
            if chunk.location == location {
                return Some(id);
            }
            if chunk.location > location {
                return None;
            }
            cur = chunk.next_mapitem;
        }
        None
    }

    fn chain_head(&mut self, low: bool) -> &mut Option<ChunkId> {
        if low {
            &mut self.free_lowmem
        } else {
            &mut self.free_highmem
        }
    }

    /// Unlink `id` from the free chain of its half, if present.
    pub(crate) fn chain_remove(&mut self, id: ChunkId) {
        let low = self.chunk(id).is_low();

        let mut prev: Option<ChunkId> = None;
        let mut cur = *self.chain_head(low);
        while let Some(c) = cur {
            if c == id {
                let after = self.chunk(id).next_buddy;
                match prev {
                    Some(p) => self.chunks.get_mut(p).next_buddy = after,
                    None => *self.chain_head(low) = after,
                }
                self.chunks.get_mut(id).next_buddy = None;
                return;
            }
            prev = cur;
            cur = self.chunk(c).next_buddy;
        }
    }

    /// Cut a free chunk in two at `offset` bytes, keeping the first part in
    /// place and inserting the second right after it in the map (and in the
    /// free chain, when the chunk is on one). Returns the second part, or
    /// `None` when no spare record is left.
    pub(crate) fn split_chunk(&mut self, id: ChunkId, offset: u64) -> Option<ChunkId> {
        debug_assert!(offset > 0 && offset < self.chunk(id).size);
        debug_assert!(self.chunk(id).is_free(), "only free chunks are split");

        let new_id = self.chunks.allocate()?;

        let (location, size, allocatable, next_mapitem, next_buddy) = {
            let chunk = self.chunk(id);
            (
                chunk.location,
                chunk.size,
                chunk.allocatable,
                chunk.next_mapitem,
                chunk.next_buddy,
            )
        };

        {
            let second = self.chunks.get_mut(new_id);
            second.location = location + offset;
            second.size = size - offset;
            second.allocatable = allocatable;
            second.next_mapitem = next_mapitem;
            second.next_buddy = if allocatable { next_buddy } else { None };
        }

        let first = self.chunks.get_mut(id);
        first.size = offset;
        first.next_mapitem = Some(new_id);
        if allocatable {
            first.next_buddy = Some(new_id);
        }

        trace!("Splitting {:?} at {:#x}", self.chunk(id), offset);
        Some(new_id)
    }

    /// Fold the map successor of `id` into it, if both are free, allocatable,
    /// address-adjacent, and on the same side of the 1 MiB boundary. The
    /// absorbed record goes back to the spare pool.
    pub(crate) fn merge_with_next(&mut self, id: ChunkId) -> bool {
        let next_id = match self.chunk(id).next_mapitem {
            Some(n) => n,
            None => return false,
        };

        let mergeable = {
            let a = self.chunk(id);
            let b = self.chunk(next_id);
            a.is_free()
                && b.is_free()
                && a.allocatable
                && b.allocatable
                && a.end() == b.location
                && a.is_low() == b.is_low()
        };
        if !mergeable {
            return false;
        }

        // Both halves are free, so they sit next to each other on their
        // free chain as well
        debug_assert_eq!(self.chunk(id).next_buddy, Some(next_id));

        let (b_size, b_next_mapitem, b_next_buddy) = {
            let b = self.chunk(next_id);
            (b.size, b.next_mapitem, b.next_buddy)
        };

        trace!(
            "Reuniting {:?} with {:?}",
            self.chunk(id),
            self.chunk(next_id)
        );

        let a = self.chunks.get_mut(id);
        a.size += b_size;
        a.next_mapitem = b_next_mapitem;
        a.next_buddy = b_next_buddy;

        self.chunks.release(next_id);
        true
    }

    /// Put a freshly-unowned chunk back on the free chain of its half, at
    /// its address-ordered position, and merge it with free neighbours.
    /// Returns the surviving record (the merge target when the chunk was
    /// absorbed into its predecessor).
    pub(crate) fn liberate_record(&mut self, id: ChunkId) -> ChunkId {
        debug_assert!(self.chunk(id).is_free() && self.chunk(id).allocatable);
        debug_assert!(self.chunk(id).next_buddy.is_none());

        let location = self.chunk(id).location;
        let low = self.chunk(id).is_low();

        let mut prev: Option<ChunkId> = None;
        let mut cur = *self.chain_head(low);
        while let Some(c) = cur {
            if self.chunk(c).location > location {
                break;
            }
            prev = cur;
            cur = self.chunk(c).next_buddy;
        }

        self.chunks.get_mut(id).next_buddy = cur;
        match prev {
            Some(p) => self.chunks.get_mut(p).next_buddy = Some(id),
            None => *self.chain_head(low) = Some(id),
        }

        trace!("Returning {:?}", self.chunk(id));

        self.merge_with_next(id);
        if let Some(p) = prev {
            if self.merge_with_next(p) {
                return p;
            }
        }
        id
    }
}

#[cfg(test)]
impl MapInner {
    /// Walk the whole map and both free chains, asserting every structural
    /// invariant the manager promises.
    pub(crate) fn assert_invariants(&self, top_of_ram: u64) {
        // Partition: sorted, gapless, overlap-free coverage of [0, top)
        let mut expected = 0u64;
        let mut cur = self.map_head;
        let mut seen_high = false;
        while let Some(id) = cur {
            let chunk = self.chunk(id);
            assert_eq!(
                chunk.location.as_u64(),
                expected,
                "map must partition the address space"
            );
            assert!(chunk.size > 0, "map must not contain empty chunks");
            assert!(
                chunk.location.as_u64() >= LOW_MEMORY_LIMIT
                    || chunk.end().as_u64() <= LOW_MEMORY_LIMIT,
                "chunks must not straddle the low-memory boundary"
            );
            if !seen_high && chunk.location.as_u64() >= LOW_MEMORY_LIMIT {
                assert_eq!(self.phy_highmmap, Some(id), "boundary marker is stale");
                seen_high = true;
            }
            expected = chunk.end().as_u64();
            cur = chunk.next_mapitem;
        }
        assert_eq!(expected, top_of_ram, "map must cover all of RAM");

        self.assert_chain_invariants(true);
        self.assert_chain_invariants(false);

        // Canonical form: no two map-adjacent free allocatable chunks on the
        // same side of the boundary survive outside of a free operation
        let mut cur = self.map_head;
        while let Some(id) = cur {
            let chunk = self.chunk(id);
            if let Some(next) = chunk.next_mapitem {
                let b = self.chunk(next);
                assert!(
                    !(chunk.is_free()
                        && b.is_free()
                        && chunk.allocatable
                        && b.allocatable
                        && chunk.is_low() == b.is_low()),
                    "adjacent free chunks must have been merged"
                );
            }
            cur = chunk.next_mapitem;
        }
    }

    fn assert_chain_invariants(&self, low: bool) {
        let head = if low { self.free_lowmem } else { self.free_highmem };
        let mut last: Option<u64> = None;
        let mut cur = head;
        while let Some(id) = cur {
            let chunk = self.chunk(id);
            assert!(chunk.is_free(), "owned chunk on a free chain");
            assert!(chunk.allocatable, "non-allocatable chunk on a free chain");
            assert_eq!(chunk.is_low(), low, "chunk on the wrong free chain");
            assert!(
                self.find_thischunk(chunk.location) == Some(id),
                "free chain entry not reachable through the map"
            );
            if let Some(prev) = last {
                assert!(prev < chunk.location.as_u64(), "free chain out of order");
            }
            last = Some(chunk.location.as_u64());
            cur = chunk.next_buddy;
        }
    }

    /// Total bytes on one free chain.
    pub(crate) fn free_bytes(&self, low: bool) -> u64 {
        let mut total = 0;
        let mut cur = if low { self.free_lowmem } else { self.free_highmem };
        while let Some(id) = cur {
            total += self.chunk(id).size;
            cur = self.chunk(id).next_buddy;
        }
        total
    }

    pub(crate) fn map_len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.map_head;
        while let Some(id) = cur {
            count += 1;
            cur = self.chunk(id).next_mapitem;
        }
        count
    }
}
