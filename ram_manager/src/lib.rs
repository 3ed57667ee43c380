//! Physical memory manager for TernOS.
//!
//! All of physical memory is described by a single chain of chunk records,
//! sorted by address and covering the address space from 0 to the top of
//! detected RAM without gaps. Each chunk knows which processes hold it;
//! free, allocatable chunks are additionally threaded onto one of two free
//! chains (below and above the 1 MiB boundary) so allocation never has to
//! scan the full map.
//!
//! The records themselves live in a fixed pool that the bootstrap path
//! carves out of the memory being mapped - the manager cannot use a heap
//! allocator, because every kernel allocator is built on top of it. Splits
//! draw spare records from the pool and merges return them; the pool never
//! grows.
//!
//! A single spin lock guards the whole map. That is a deliberate fit for
//! the single-core design; anyone adding real multiprocessing here would
//! want to shard it.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use spin::Mutex;
use tern_boot_info::BootInfo;
use tern_common::fmt::ByteSizeExt;
use tern_common::sync::Global;
use x86_64::PhysAddr;

mod allocator;
mod bootstrap;
mod chunk;
mod ledger;
mod map;
mod pool;

pub use chunk::Pid;

use ledger::ProcessLedger;
use map::MapInner;

/// Size of a physical page frame
pub const PAGE_SIZE: u64 = 4096;

/// Boundary between low memory (real-mode reachable, scarce) and high
/// memory. The two are kept on separate free chains.
pub const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// A successful allocation: the head chunk's address and the total bytes
/// handed out. Multi-part allocations are walked with
/// [`RamManager::find_thischunk`] and [`ChunkInfo::next_part`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    location: PhysAddr,
    size: u64,
}

impl Allocation {
    pub fn location(&self) -> PhysAddr {
        self.location
    }

    /// Total size of the allocation group, in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Snapshot of one chunk, as returned by [`RamManager::find_thischunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub location: PhysAddr,
    pub size: u64,
    pub allocatable: bool,
    pub free: bool,
    /// Start of the next part of the same allocation group, if any
    pub next_part: Option<PhysAddr>,
}

/// The physical memory manager.
///
/// Constructed exactly once during kernel init (see [`init`]) and handed by
/// reference to everything that needs physical memory: the paging manager,
/// the byte-granularity allocator, the process manager.
pub struct RamManager {
    /// The chunk map and free chains
    mmap: Mutex<MapInner>,
    /// Per-process accounting. Never locked while `mmap` is held.
    proclist: Mutex<ProcessLedger>,
}

impl RamManager {
    /// Build the manager from the loader's memory map. `physical_memory_map`
    /// is the virtual address at which all physical memory is mapped.
    ///
    /// # Panics
    /// If the boot map is malformed or there is no free high-memory region
    /// large enough for the manager's record pool. Boot cannot proceed
    /// without a working memory map, so there is no recovery path.
    pub fn new(boot: &BootInfo, physical_memory_map: usize) -> RamManager {
        RamManager {
            mmap: Mutex::new(bootstrap::build(boot, physical_memory_map)),
            proclist: Mutex::new(ProcessLedger::new()),
        }
    }

    /// Allocate at least `size` bytes of high memory (rounded up to whole
    /// pages) owned by `owner`. With `contiguous`, the result is one chunk;
    /// otherwise it may be a chain of parts.
    ///
    /// Returns `None` when the request cannot currently be satisfied. That
    /// is an ordinary condition callers must handle, not an error.
    pub fn alloc_chunk(&self, owner: Pid, size: u64, contiguous: bool) -> Option<Allocation> {
        self.allocate(owner, size, contiguous, false)
    }

    /// [`Self::alloc_chunk`], restricted to memory below the 1 MiB boundary
    /// (for DMA buffers and real-mode trampolines).
    pub fn alloc_lowchunk(&self, owner: Pid, size: u64, contiguous: bool) -> Option<Allocation> {
        self.allocate(owner, size, contiguous, true)
    }

    fn allocate(&self, owner: Pid, size: u64, contiguous: bool, low: bool) -> Option<Allocation> {
        let allocation = {
            let mut inner = self.mmap.lock();
            inner
                .allocate(owner, size, contiguous, low)
                .map(|(head, total)| Allocation {
                    location: inner.chunk(head).location,
                    size: total,
                })
        };

        if let Some(allocation) = &allocation {
            self.proclist.lock().charge(owner, allocation.size);
        }
        allocation
    }

    /// Give up `owner`'s hold on the allocation group headed at `location`.
    /// Parts left with no owner return to the free memory pool.
    ///
    /// Returns false if `location` is not the start of a chunk `owner`
    /// holds.
    pub fn free_chunk(&self, owner: Pid, location: PhysAddr) -> bool {
        let released = { self.mmap.lock().free_group(owner, location) };
        match released {
            Some(bytes) => {
                self.proclist.lock().credit(owner, bytes);
                true
            }
            None => false,
        }
    }

    /// Add `new_owner` to the owners of the chunk starting at `location`,
    /// without moving any memory. A free chunk stops being available; a
    /// shared chunk stays mapped until its last owner frees it.
    pub fn share_chunk(&self, new_owner: Pid, location: PhysAddr) -> bool {
        let charged = { self.mmap.lock().share(new_owner, location) };
        match charged {
            Some(bytes) => {
                self.proclist.lock().charge(new_owner, bytes);
                true
            }
            None => false,
        }
    }

    /// Release everything `pid` holds, anywhere in the map. Called by the
    /// process manager when a process dies.
    pub fn remove_process(&self, pid: Pid) {
        self.mmap.lock().remove_process(pid);
        self.proclist.lock().forget(pid);
    }

    /// Look up the chunk starting exactly at `location`.
    pub fn find_thischunk(&self, location: PhysAddr) -> Option<ChunkInfo> {
        let inner = self.mmap.lock();
        inner.find_thischunk(location).map(|id| {
            let chunk = inner.chunk(id);
            ChunkInfo {
                location: chunk.location,
                size: chunk.size,
                allocatable: chunk.allocatable,
                free: chunk.is_free(),
                next_part: if chunk.is_free() {
                    None
                } else {
                    chunk.next_buddy.map(|next| inner.chunk(next).location)
                },
            }
        })
    }

    /// Bytes currently charged to `pid`.
    pub fn usage(&self, pid: Pid) -> u64 {
        self.proclist.lock().usage(pid)
    }

    /// Human-readable dump of the map and free chains, for debugging. Not a
    /// stable format.
    pub fn display_map(&self) -> MapDisplay<'_> {
        MapDisplay(self)
    }
}

/// See [`RamManager::display_map`].
pub struct MapDisplay<'a>(&'a RamManager);

impl fmt::Display for MapDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.0.mmap.lock();

        writeln!(f, "Physical memory map:")?;
        let mut cur = inner.map_head;
        while let Some(id) = cur {
            let chunk = inner.chunk(id);
            write!(
                f,
                "  * {:#010x} - {:#010x}: {}",
                chunk.location.as_u64(),
                chunk.end().as_u64(),
                chunk.size.as_size()
            )?;
            if !chunk.allocatable {
                write!(f, ", reserved")?;
            }
            if chunk.is_free() {
                writeln!(f, ", free")?;
            } else {
                write!(f, ", owned by")?;
                let mut result = Ok(());
                chunk.owners.for_each(&inner.pids, |pid| {
                    if result.is_ok() {
                        result = write!(f, " {}", pid);
                    }
                });
                result?;
                writeln!(f)?;
            }
            cur = chunk.next_mapitem;
        }

        for (title, head) in [
            ("Free low memory:", inner.free_lowmem),
            ("Free high memory:", inner.free_highmem),
        ] {
            writeln!(f, "{}", title)?;
            let mut cur = head;
            while let Some(id) = cur {
                let chunk = inner.chunk(id);
                writeln!(
                    f,
                    "  * {:#010x} ({})",
                    chunk.location.as_u64(),
                    chunk.size.as_size()
                )?;
                cur = chunk.next_buddy;
            }
        }

        writeln!(
            f,
            "Spare records: {}, spare owner nodes: {}",
            inner.chunks.spare_records(),
            inner.pids.spare_nodes()
        )
    }
}

/// Construct the kernel-wide manager instance. Called once, early in kernel
/// init, before anything needs physical memory.
pub fn init(boot: &BootInfo, physical_memory_map: usize) -> &'static RamManager {
    static MANAGER: Global<RamManager> = Global::new();
    MANAGER.init(RamManager::new(boot, physical_memory_map))
}

#[cfg(test)]
pub(crate) mod test_support {
    use tern_boot_info::{BootInfo, BootMemoryRegion, CpuInfo, MemoryNature};
    use x86_64::PhysAddr;

    pub(crate) const TOP_OF_RAM: u64 = 16 * 1024 * 1024;

    /// Leak a RAM-sized, page-aligned buffer and return the address at
    /// which "physical" addresses are reachable. Stands in for the kernel's
    /// physical memory map.
    pub(crate) fn fake_ram() -> usize {
        let layout =
            std::alloc::Layout::from_size_align(TOP_OF_RAM as usize, crate::PAGE_SIZE as usize)
                .expect("layout");
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        base as usize
    }

    pub(crate) fn boot_info(regions: Vec<BootMemoryRegion>) -> BootInfo {
        BootInfo::new(
            CpuInfo {
                core_count: 1,
                cache_line_size: 64,
            },
            Box::leak(regions.into_boxed_slice()),
        )
    }

    pub(crate) fn region(location: u64, size: u64, nature: MemoryNature) -> BootMemoryRegion {
        BootMemoryRegion::new(PhysAddr::new(location), size, nature)
    }

    /// 16 MiB machine: reserved low memory, a 1 MiB free window at
    /// 0x100000, kernel above.
    pub(crate) fn small_system() -> BootInfo {
        boot_info(vec![
            region(0, 0x100000, MemoryNature::Reserved),
            region(0x100000, 0x100000, MemoryNature::Free),
            region(0x200000, 0xe00000, MemoryNature::Kernel),
        ])
    }

    /// 16 MiB machine with free memory in both halves.
    pub(crate) fn standard_system() -> BootInfo {
        boot_info(vec![
            region(0, 0x1000, MemoryNature::Reserved),
            region(0x1000, 0x9e000, MemoryNature::Free),
            region(0x9f000, 0x61000, MemoryNature::Reserved),
            region(0x100000, 0x300000, MemoryNature::Kernel),
            region(0x400000, 0xc00000, MemoryNature::Free),
        ])
    }
}
