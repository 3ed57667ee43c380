//! The map record type and per-chunk process ownership sets.

use core::fmt;

use x86_64::PhysAddr;

use crate::pool::PidPool;
use crate::LOW_MEMORY_LIMIT;

/// Process identifier, as assigned by the process manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(u32);

impl Pid {
    /// The kernel's own identity. Memory held by the kernel image, loader
    /// handoff data, and the manager's internal pool is owned by this id.
    pub const KERNEL: Pid = Pid(0);

    pub const fn new(raw: u32) -> Pid {
        Pid(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Pid::KERNEL {
            write!(f, "kernel")
        } else {
            write!(f, "pid {}", self.0)
        }
    }
}

/// Index of a chunk record in the manager's record pool.
///
/// All record-to-record links are pool indices rather than pointers, so a
/// stale link can at worst reach a recycled record, never freed memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    pub(crate) fn from_index(index: usize) -> ChunkId {
        ChunkId(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an ownership node in the pid pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PidNodeId(u32);

impl PidNodeId {
    pub(crate) fn from_index(index: usize) -> PidNodeId {
        PidNodeId(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One record of the physical memory map: a contiguous run of physical
/// memory with uniform ownership.
///
/// Records take part in two singly-linked structures at once. `next_mapitem`
/// threads the full map in ascending address order. `next_buddy` threads the
/// free chain of the record's half of memory while the chunk is free, and is
/// reused as the parts chain of a multi-chunk allocation while it is owned.
pub(crate) struct MemoryChunk {
    pub location: PhysAddr,
    pub size: u64,
    pub owners: OwnerSet,
    pub allocatable: bool,
    pub next_mapitem: Option<ChunkId>,
    pub next_buddy: Option<ChunkId>,
}

impl MemoryChunk {
    /// A blank record, as stored in the pool before first use. `next` seeds
    /// the pool's internal free list.
    pub(crate) fn unused(next: Option<ChunkId>) -> MemoryChunk {
        MemoryChunk {
            location: PhysAddr::new(0),
            size: 0,
            owners: OwnerSet::new(),
            allocatable: false,
            next_mapitem: next,
            next_buddy: None,
        }
    }

    /// Exclusive end address of the chunk
    pub(crate) fn end(&self) -> PhysAddr {
        self.location + self.size
    }

    pub(crate) fn is_free(&self) -> bool {
        self.owners.is_empty()
    }

    /// Whether this chunk lies below the 1 MiB low-memory boundary. The
    /// bootstrap walk splits chunks at the boundary, so a chunk is always
    /// entirely on one side of it.
    pub(crate) fn is_low(&self) -> bool {
        self.location.as_u64() < LOW_MEMORY_LIMIT
    }
}

impl fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:#x}..{:#x} {}{}]",
            self.location.as_u64(),
            self.end().as_u64(),
            if self.allocatable { "" } else { "reserved " },
            if self.is_free() { "free" } else { "owned" },
        )
    }
}

/// The set of processes holding a chunk. Empty means the chunk is free.
///
/// Most chunks have zero or one owner, so a couple of ids are stored inline;
/// further owners spill into a chain of nodes drawn from the preallocated
/// [`PidPool`]. The overflow chain is only ever populated while every inline
/// slot is full.
#[derive(Debug)]
pub(crate) struct OwnerSet {
    inline: [Option<Pid>; INLINE_OWNERS],
    overflow: Option<PidNodeId>,
}

pub(crate) const INLINE_OWNERS: usize = 2;

impl OwnerSet {
    pub(crate) const fn new() -> OwnerSet {
        OwnerSet {
            inline: [None; INLINE_OWNERS],
            overflow: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inline[0].is_none()
    }

    pub(crate) fn contains(&self, pid: Pid, pool: &PidPool) -> bool {
        if self.inline.contains(&Some(pid)) {
            return true;
        }

        let mut cur = self.overflow;
        while let Some(id) = cur {
            let node = pool.node(id);
            if node.pid == pid {
                return true;
            }
            cur = node.next;
        }
        false
    }

    /// Add `pid` to the set. Adding an existing owner is a no-op. Returns
    /// false if the set would need an overflow node and the pool is out of
    /// them.
    pub(crate) fn add(&mut self, pid: Pid, pool: &mut PidPool) -> bool {
        if self.contains(pid, pool) {
            return true;
        }

        for slot in self.inline.iter_mut() {
            if slot.is_none() {
                *slot = Some(pid);
                return true;
            }
        }

        match pool.allocate(pid, self.overflow) {
            Some(id) => {
                self.overflow = Some(id);
                true
            }
            None => false,
        }
    }

    /// Remove `pid` from the set. Returns false if it was not a member.
    pub(crate) fn remove(&mut self, pid: Pid, pool: &mut PidPool) -> bool {
        for i in 0..INLINE_OWNERS {
            if self.inline[i] == Some(pid) {
                if let Some(head) = self.overflow {
                    // Pull an overflow owner inline so the chain stays the
                    // last resort
                    let (head_pid, head_next) = {
                        let node = pool.node(head);
                        (node.pid, node.next)
                    };
                    self.inline[i] = Some(head_pid);
                    self.overflow = head_next;
                    pool.release(head);
                } else {
                    for j in i..INLINE_OWNERS - 1 {
                        self.inline[j] = self.inline[j + 1];
                    }
                    self.inline[INLINE_OWNERS - 1] = None;
                }
                return true;
            }
        }

        let mut prev: Option<PidNodeId> = None;
        let mut cur = self.overflow;
        while let Some(id) = cur {
            let (node_pid, node_next) = {
                let node = pool.node(id);
                (node.pid, node.next)
            };
            if node_pid == pid {
                match prev {
                    Some(p) => pool.node_mut(p).next = node_next,
                    None => self.overflow = node_next,
                }
                pool.release(id);
                return true;
            }
            prev = cur;
            cur = node_next;
        }
        false
    }

    /// Drop every owner, returning any overflow nodes to the pool.
    pub(crate) fn clear(&mut self, pool: &mut PidPool) {
        let mut cur = self.overflow;
        while let Some(id) = cur {
            cur = pool.node(id).next;
            pool.release(id);
        }
        self.overflow = None;
        self.inline = [None; INLINE_OWNERS];
    }

    pub(crate) fn count(&self, pool: &PidPool) -> usize {
        let mut count = self.inline.iter().filter(|slot| slot.is_some()).count();
        let mut cur = self.overflow;
        while let Some(id) = cur {
            count += 1;
            cur = pool.node(id).next;
        }
        count
    }

    pub(crate) fn for_each(&self, pool: &PidPool, mut f: impl FnMut(Pid)) {
        for pid in self.inline.iter().flatten() {
            f(*pid);
        }
        let mut cur = self.overflow;
        while let Some(id) = cur {
            let node = pool.node(id);
            f(node.pid);
            cur = node.next;
        }
    }
}
