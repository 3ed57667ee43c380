//! Allocation and liberation over the chunk map.
//!
//! Allocation never scans the full map: it walks the free chain of the
//! requested half of memory, which holds exactly the chunks that could
//! satisfy a request. Only process teardown pays for a full map walk, since
//! ownership is not indexed by process.

use log::trace;
use x86_64::PhysAddr;

use crate::chunk::{ChunkId, Pid};
use crate::map::MapInner;
use crate::PAGE_SIZE;

/// Round a request up to whole pages. Zero-byte requests stay zero and are
/// rejected by the caller.
fn round_to_pages(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

impl MapInner {
    /// Allocate `size` bytes (rounded up to whole pages) for `owner` from
    /// the requested half of memory.
    ///
    /// Returns the head chunk of the allocation and the total size handed
    /// out. With `contiguous`, the result is always a single chunk;
    /// otherwise it may be a chain of parts linked through `next_buddy`.
    /// `None` means the request cannot currently be satisfied; nothing has
    /// changed in that case.
    pub(crate) fn allocate(
        &mut self,
        owner: Pid,
        size: u64,
        contiguous: bool,
        low: bool,
    ) -> Option<(ChunkId, u64)> {
        if size == 0 {
            return None;
        }
        let rounded = round_to_pages(size);

        if contiguous {
            self.allocate_contiguous(owner, rounded, low)
        } else {
            self.allocate_scattered(owner, rounded, low)
        }
    }

    /// Non-contiguous allocation: take chunks off the front of the free
    /// chain until the request is covered, splitting the last one to an
    /// exact fit.
    fn allocate_scattered(&mut self, owner: Pid, rounded: u64, low: bool) -> Option<(ChunkId, u64)> {
        let head = if low { self.free_lowmem } else { self.free_highmem };

        // Figure out how much of the chain we need before touching anything
        let mut total = 0u64;
        let mut last = None;
        let mut cur = head;
        while let Some(id) = cur {
            total += self.chunk(id).size;
            last = Some(id);
            if total >= rounded {
                break;
            }
            cur = self.chunk(id).next_buddy;
        }
        if total < rounded {
            return None;
        }
        let head = head.expect("nonzero total implies a nonempty chain");
        let last = last.expect("nonzero total implies a nonempty chain");

        // Trim the tail chunk so the group covers exactly the request. If
        // the spare pool cannot back the split, the whole request fails
        // before any state changed.
        let excess = total - rounded;
        if excess > 0 {
            let cut = self.chunk(last).size - excess;
            self.split_chunk(last, cut)?;
        }

        // The taken chunks are a prefix of the chain and already link each
        // other through next_buddy, which from here on serves as the parts
        // chain of the allocation.
        let after = self.chunk(last).next_buddy;
        if low {
            self.free_lowmem = after;
        } else {
            self.free_highmem = after;
        }

        let mut cur = head;
        loop {
            let added = self.chunks.get_mut(cur).owners.add(owner, &mut self.pids);
            debug_assert!(added, "a free chunk always has an inline owner slot");
            trace!("Taking {:?} for {}", self.chunk(cur), owner);
            if cur == last {
                self.chunks.get_mut(cur).next_buddy = None;
                break;
            }
            cur = self.chunk(cur).next_buddy.expect("walked past the tail");
        }

        Some((head, rounded))
    }

    /// Contiguous allocation: first fit over single free chunks and
    /// address-adjacent runs of them.
    fn allocate_contiguous(&mut self, owner: Pid, rounded: u64, low: bool) -> Option<(ChunkId, u64)> {
        let mut pred: Option<ChunkId> = None;
        let mut start = if low { self.free_lowmem } else { self.free_highmem };

        while let Some(s) = start {
            // Grow a run of address-adjacent free chunks from this
            // candidate. Chain order is address order, so a run is a chain
            // prefix starting at `s`.
            let mut run_total = self.chunk(s).size;
            let mut run_end = s;
            while run_total < rounded {
                match self.chunk(run_end).next_buddy {
                    Some(n) if self.chunk(run_end).end() == self.chunk(n).location => {
                        run_total += self.chunk(n).size;
                        run_end = n;
                    }
                    _ => break,
                }
            }

            if run_total >= rounded {
                // An oversized run needs one spare record for the split;
                // folding a multi-chunk run frees at least one, so only a
                // single oversized chunk can be blocked by an empty pool.
                let needs_split = run_total > rounded;
                if !needs_split || run_end != s || self.chunks.spare_records() > 0 {
                    while self.chunk(s).size < run_total {
                        let merged = self.merge_with_next(s);
                        debug_assert!(merged, "run chunks are mergeable by construction");
                    }
                    if needs_split {
                        self.split_chunk(s, rounded)
                            .expect("spare record accounted for above");
                    }

                    // Unlink the now exact-sized chunk and hand it over
                    let after = self.chunk(s).next_buddy;
                    match pred {
                        Some(p) => self.chunks.get_mut(p).next_buddy = after,
                        None => {
                            if low {
                                self.free_lowmem = after;
                            } else {
                                self.free_highmem = after;
                            }
                        }
                    }
                    self.chunks.get_mut(s).next_buddy = None;
                    let added = self.chunks.get_mut(s).owners.add(owner, &mut self.pids);
                    debug_assert!(added, "a free chunk always has an inline owner slot");
                    trace!("Taking {:?} for {}", self.chunk(s), owner);
                    return Some((s, rounded));
                }
            }

            pred = start;
            start = self.chunk(s).next_buddy;
        }

        None
    }

    /// Release `owner`'s hold on the allocation group headed at `location`.
    ///
    /// Every part of the group is processed: the owner is dropped, and parts
    /// left without any owner return to their free chain (merging with free
    /// neighbours) unless they are non-allocatable. Returns the number of
    /// bytes the owner gave up, or `None` if `location` is not the start of
    /// a chunk `owner` holds.
    ///
    /// The walk stops at the first chunk that does not list `owner`: a part
    /// torn out of the group earlier (its other holders removed it, or a
    /// teardown liberated it) leaves a chain link that no longer belongs to
    /// this group, and following it further would touch records the group
    /// does not own any more.
    pub(crate) fn free_group(&mut self, owner: Pid, location: PhysAddr) -> Option<u64> {
        let head = self.find_thischunk(location)?;
        if !self.chunk(head).owners.contains(owner, &self.pids) {
            return None;
        }

        let mut released = 0u64;
        let mut cur = Some(head);
        while let Some(id) = cur {
            if !self.chunk(id).owners.contains(owner, &self.pids) {
                break;
            }

            let next = self.chunk(id).next_buddy;
            let removed = self.chunks.get_mut(id).owners.remove(owner, &mut self.pids);
            debug_assert!(removed, "membership checked above");
            released += self.chunk(id).size;
            if self.chunk(id).is_free() {
                // No owners left: the group link dies with the allocation.
                // A part that keeps other owners keeps its link, so a
                // sharer bowing out of one part cannot cut the chain the
                // remaining owner will walk later.
                self.chunks.get_mut(id).next_buddy = None;
                if self.chunk(id).allocatable {
                    self.liberate_record(id);
                }
            }

            cur = next;
        }

        Some(released)
    }

    /// Add `new_owner` to the chunk starting at `location`, taking it off
    /// its free chain if it was available. Returns the bytes now charged to
    /// `new_owner`: the chunk size, or 0 when it already held the chunk.
    pub(crate) fn share(&mut self, new_owner: Pid, location: PhysAddr) -> Option<u64> {
        let id = self.find_thischunk(location)?;

        if self.chunk(id).owners.contains(new_owner, &self.pids) {
            return Some(0);
        }

        let was_free = self.chunk(id).is_free();
        if !self.chunks.get_mut(id).owners.add(new_owner, &mut self.pids) {
            return None;
        }
        if was_free && self.chunk(id).allocatable {
            self.chain_remove(id);
        }

        trace!("Sharing {:?} with {}", self.chunk(id), new_owner);
        Some(self.chunk(id).size)
    }

    /// Strip `pid` from every owner set in the map, liberating whatever it
    /// held alone. The one full-map scan in the manager.
    ///
    /// A chunk that keeps other owners keeps its `next_buddy` link too: the
    /// parts chain belongs to the allocation, and only dies with the last
    /// owner.
    pub(crate) fn remove_process(&mut self, pid: Pid) {
        let mut cur = self.map_head;
        while let Some(id) = cur {
            if self.chunks.get_mut(id).owners.remove(pid, &mut self.pids)
                && self.chunk(id).is_free()
            {
                // No owners left, so any group link dies with the allocation
                self.chunks.get_mut(id).next_buddy = None;
                if self.chunk(id).allocatable {
                    let survivor = self.liberate_record(id);
                    cur = self.chunk(survivor).next_mapitem;
                    continue;
                }
            }
            cur = self.chunk(id).next_mapitem;
        }
    }
}

#[cfg(test)]
mod test {
    use crate::bootstrap;
    use crate::chunk::Pid;
    use crate::map::MapInner;
    use crate::test_support::{fake_ram, standard_system, TOP_OF_RAM};
    use x86_64::PhysAddr;

    fn inner() -> MapInner {
        let boot = standard_system();
        bootstrap::build(&boot, fake_ram())
    }

    #[test]
    fn test_split_and_merge_are_inverses() {
        let mut map = inner();

        let id = map.free_highmem.expect("free high chunk");
        let location = map.chunk(id).location;
        let size = map.chunk(id).size;
        let records = map.chunks.spare_records();

        let second = map.split_chunk(id, 0x5000).expect("spare record");
        assert_eq!(map.chunk(id).size, 0x5000);
        assert_eq!(map.chunk(second).location, location + 0x5000u64);
        assert_eq!(map.chunk(second).size, size - 0x5000);
        assert_eq!(map.chunk(id).next_mapitem, Some(second));
        assert_eq!(map.chunk(id).next_buddy, Some(second));
        assert_eq!(map.chunks.spare_records(), records - 1);

        assert!(map.merge_with_next(id));
        assert_eq!(map.chunk(id).location, location);
        assert_eq!(map.chunk(id).size, size);
        assert!(map.chunk(id).next_buddy.is_none());
        assert_eq!(map.chunks.spare_records(), records);

        map.assert_invariants(TOP_OF_RAM);
    }

    #[test]
    fn test_contiguous_allocation_spans_adjacent_chunks() {
        let mut map = inner();
        let p = Pid::new(1);

        // Manufacture a run of three adjacent free chunks; splitting keeps
        // all parts free and chained
        let first = map.free_highmem.expect("free high chunk");
        let base = map.chunk(first).location;
        map.split_chunk(first, 0x1000).expect("spare record");
        let second = map.chunk(first).next_buddy.expect("second piece");
        map.split_chunk(second, 0x1000).expect("spare record");

        // A request larger than any single piece folds the run back
        // together and comes out as one chunk
        let (head, total) = map.allocate(p, 0x3000, true, false).expect("fits the run");
        assert_eq!(total, 0x3000);
        assert_eq!(map.chunk(head).location, base);
        assert_eq!(map.chunk(head).size, 0x3000);
        assert!(map.chunk(head).next_buddy.is_none());
        assert!(map.chunk(head).owners.contains(p, &map.pids));

        map.assert_invariants(TOP_OF_RAM);
    }

    #[test]
    fn test_liberation_merges_in_both_directions() {
        let mut map = inner();
        let p = Pid::new(2);

        let free_before = map.free_bytes(false);
        let len_before = map.map_len();

        let (a, _) = map.allocate(p, 0x1000, true, false).expect("alloc");
        let (b, _) = map.allocate(p, 0x1000, true, false).expect("alloc");
        let (c, _) = map.allocate(p, 0x1000, true, false).expect("alloc");

        // Free the outer chunks first, then the middle one: it has to fold
        // into both neighbours at once
        let a_loc = map.chunk(a).location;
        let c_loc = map.chunk(c).location;
        let b_loc = map.chunk(b).location;
        assert!(map.free_group(p, a_loc).is_some());
        assert!(map.free_group(p, c_loc).is_some());
        map.assert_invariants(TOP_OF_RAM);

        assert!(map.free_group(p, b_loc).is_some());
        map.assert_invariants(TOP_OF_RAM);
        assert_eq!(map.free_bytes(false), free_before);
        assert_eq!(map.map_len(), len_before);
    }

    #[test]
    fn test_record_exhaustion_blocks_splits_but_not_exact_fits() {
        let mut map = inner();
        let p = Pid::new(3);

        // Every page-sized allocation splits the big free chunk and costs
        // one spare record; drain them all
        while map.chunks.spare_records() > 0 {
            map.allocate(p, 0x1000, true, false).expect("burn a record");
        }

        let remaining = map.chunk(map.free_highmem.expect("still free memory")).size;
        assert!(remaining > 0x1000);

        // Anything needing a split now fails cleanly, in both modes
        assert!(map.allocate(p, 0x1000, true, false).is_none());
        assert!(map.allocate(p, 0x1000, false, false).is_none());
        map.assert_invariants(TOP_OF_RAM);

        // An exact-size request consumes the chunk whole, no record needed
        let (head, total) = map
            .allocate(p, remaining, true, false)
            .expect("exact fit needs no spare record");
        assert_eq!(total, remaining);
        assert!(map.chunk(head).owners.contains(p, &map.pids));
        map.assert_invariants(TOP_OF_RAM);
    }
}
