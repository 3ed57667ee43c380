//! Construction of the chunk map from the loader's coarse memory map.
//!
//! The chicken-and-egg problem lives here: the map's own records need
//! storage, and the only storage available is the memory being mapped. The
//! bootstrap path therefore sizes a worst-case record pool up front, carves
//! it out of the first free high-memory region that can hold it, and then
//! describes that carve in the very map the pool stores.

use core::mem;

use log::info;
use tern_boot_info::{memory_map, BootInfo, MemoryNature};
use tern_common::fmt::ByteSizeExt;
use x86_64::PhysAddr;

use crate::chunk::{ChunkId, MemoryChunk, Pid};
use crate::map::MapInner;
use crate::pool::{ChunkPool, PidNode, PidPool};
use crate::{LOW_MEMORY_LIMIT, PAGE_SIZE};

/// Headroom on top of the worst-case initial record count, so the map can
/// keep splitting chunks for a while before recycled records are the only
/// source.
const MAP_SLACK: usize = 16;

/// One page's worth of spare records, pre-carved so the first allocation
/// after boot never has to re-enter this path.
const SPARE_RECORDS: usize = PAGE_SIZE as usize / mem::size_of::<MemoryChunk>();

/// Capacity of the ownership-node reserve.
const PID_POOL_NODES: usize = PAGE_SIZE as usize / mem::size_of::<PidNode>();

/// Record capacity of the pool for a map with `entries` coarse regions.
/// Every region can be split at the 1 MiB boundary and around the pool
/// storage itself, hence the factor of two.
fn pool_capacity(entries: usize) -> usize {
    entries * 2 + MAP_SLACK + SPARE_RECORDS
}

/// Bytes of physical memory the bootstrap carve claims for a map with
/// `entries` coarse regions.
pub(crate) fn pool_storage_bytes(entries: usize) -> u64 {
    let raw = pool_capacity(entries) * mem::size_of::<MemoryChunk>()
        + PID_POOL_NODES * mem::size_of::<PidNode>();
    (raw as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Build the fine-grained chunk map.
///
/// `physical_memory_map` is the virtual address at which physical memory is
/// mapped; the pool carve is the only memory the manager ever dereferences.
///
/// # Panics
/// If the boot memory map is malformed, or no free high-memory region can
/// hold the record pool. Neither condition has a meaningful recovery this
/// early in boot.
pub(crate) fn build(boot: &BootInfo, physical_memory_map: usize) -> MapInner {
    boot.assert_valid();
    let regions = boot.memory_map();
    if let Err(error) = memory_map::validate(regions) {
        panic!("unusable boot memory map: {}", error);
    }

    let top_of_ram = memory_map::top_of_ram(regions);
    info!(
        "{} boot memory regions, top of RAM at {:#x}",
        regions.len(),
        top_of_ram.as_u64()
    );

    // Worst-case storage for the fine map, rounded to whole pages
    let chunk_capacity = pool_capacity(regions.len());
    let storage_bytes = pool_storage_bytes(regions.len());
    info!("Need {} for the chunk pool", storage_bytes.as_size());

    // Carve the pool out of the top of the first free high-memory region
    // that can hold it, so the start of free memory stays available for
    // callers
    let mut carve: Option<PhysAddr> = None;
    for region in regions {
        if !region.is_free() || region.location().as_u64() < LOW_MEMORY_LIMIT {
            continue;
        }
        let top = region.end().align_down(PAGE_SIZE);
        if top.as_u64() >= region.location().as_u64() + storage_bytes {
            carve = Some(top - storage_bytes);
            break;
        }
    }
    let storage_start = match carve {
        Some(start) => start,
        None => panic!(
            "no free high-memory region can hold the {} chunk pool",
            storage_bytes.as_size()
        ),
    };
    let storage_end = storage_start + storage_bytes;
    info!(
        "Using {:#x} - {:#x} for the chunk pool",
        storage_start.as_u64(),
        storage_end.as_u64()
    );

    let base = (physical_memory_map + storage_start.as_u64() as usize) as *mut u8;
    // Safety: the range was just chosen from a free region of the validated
    // memory map, and the map below records it as kernel-owned before any
    // allocation can hand it out
    let (chunks, pids) = unsafe {
        let chunks = ChunkPool::carve(base as *mut MemoryChunk, chunk_capacity);
        let pid_base = base.add(chunk_capacity * mem::size_of::<MemoryChunk>()) as *mut PidNode;
        (chunks, PidPool::carve(pid_base, PID_POOL_NODES))
    };

    let mut inner = MapInner {
        chunks,
        pids,
        map_head: None,
        phy_highmmap: None,
        free_lowmem: None,
        free_highmem: None,
    };

    // Materialize the fine map: one chunk per piece of each coarse region,
    // cut at the 1 MiB boundary and around the pool storage. Zero-length
    // pieces are dropped as they arise.
    let mut tail: Option<ChunkId> = None;
    for region in regions {
        let start = region.location().as_u64();
        let end = region.end().as_u64();

        let mut cuts = [start, end, end, end, end];
        let mut count = 1;
        for boundary in [LOW_MEMORY_LIMIT, storage_start.as_u64(), storage_end.as_u64()] {
            if boundary > start && boundary < end {
                cuts[count] = boundary;
                count += 1;
            }
        }
        cuts[count] = end;
        count += 1;
        cuts[..count].sort_unstable();

        for pair in cuts[..count].windows(2) {
            let (piece_start, piece_end) = (pair[0], pair[1]);
            if piece_start == piece_end {
                continue;
            }

            // Coalesce runs of free memory spanning several coarse entries,
            // except across the pool-carve cuts, which exist precisely to
            // keep those ranges on their own records
            if region.nature() == MemoryNature::Free
                && piece_start != storage_start.as_u64()
                && piece_start != storage_end.as_u64()
                && piece_start != LOW_MEMORY_LIMIT
            {
                if let Some(t) = tail {
                    let extendable = {
                        let prev = inner.chunk(t);
                        prev.is_free()
                            && prev.allocatable
                            && prev.end().as_u64() == piece_start
                    };
                    if extendable {
                        inner.chunks.get_mut(t).size += piece_end - piece_start;
                        continue;
                    }
                }
            }

            let id = inner
                .chunks
                .allocate()
                .expect("pool is sized for the worst-case initial map");
            {
                let chunk = inner.chunks.get_mut(id);
                chunk.location = PhysAddr::new(piece_start);
                chunk.size = piece_end - piece_start;
                chunk.allocatable = region.nature() != MemoryNature::Reserved;
            }
            if matches!(
                region.nature(),
                MemoryNature::Bootstrap | MemoryNature::Kernel
            ) {
                let added = inner
                    .chunks
                    .get_mut(id)
                    .owners
                    .add(Pid::KERNEL, &mut inner.pids);
                debug_assert!(added);
            }

            match tail {
                Some(t) => inner.chunks.get_mut(t).next_mapitem = Some(id),
                None => inner.map_head = Some(id),
            }
            tail = Some(id);
        }
    }

    // One walk to place the low/high boundary marker and thread the free
    // chains in address order
    let mut last_low: Option<ChunkId> = None;
    let mut last_high: Option<ChunkId> = None;
    let mut cur = inner.map_head;
    while let Some(id) = cur {
        let (low, free) = {
            let chunk = inner.chunk(id);
            (chunk.is_low(), chunk.is_free() && chunk.allocatable)
        };

        if inner.phy_highmmap.is_none() && !low {
            inner.phy_highmmap = Some(id);
        }

        if free {
            if low {
                match last_low {
                    Some(p) => inner.chunks.get_mut(p).next_buddy = Some(id),
                    None => inner.free_lowmem = Some(id),
                }
                last_low = Some(id);
            } else {
                match last_high {
                    Some(p) => inner.chunks.get_mut(p).next_buddy = Some(id),
                    None => inner.free_highmem = Some(id),
                }
                last_high = Some(id);
            }
        }

        cur = inner.chunk(id).next_mapitem;
    }

    // Finally, claim the pool's own storage: the cuts above guarantee a
    // chunk covering exactly the carve
    let pool_chunk = inner
        .find_thischunk(storage_start)
        .expect("the pool carve must appear in the map");
    debug_assert_eq!(inner.chunk(pool_chunk).size, storage_bytes);
    inner.chain_remove(pool_chunk);
    let added = inner
        .chunks
        .get_mut(pool_chunk)
        .owners
        .add(Pid::KERNEL, &mut inner.pids);
    debug_assert!(added);

    inner
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{boot_info, fake_ram, TOP_OF_RAM};
    use tern_boot_info::BootMemoryRegion;

    fn standard_regions() -> Vec<BootMemoryRegion> {
        vec![
            region(0, 0x1000, MemoryNature::Reserved),
            region(0x1000, 0x9e000, MemoryNature::Free),
            region(0x9f000, 0x61000, MemoryNature::Reserved),
            region(0x100000, 0x300000, MemoryNature::Kernel),
            region(0x400000, 0xc00000, MemoryNature::Free),
        ]
    }

    fn region(location: u64, size: u64, nature: MemoryNature) -> BootMemoryRegion {
        BootMemoryRegion::new(PhysAddr::new(location), size, nature)
    }

    #[test]
    fn test_partition_and_chains() {
        let (boot, offset) = (boot_info(standard_regions()), fake_ram());
        let inner = build(&boot, offset);
        inner.assert_invariants(TOP_OF_RAM);

        // Low memory: one free chunk covering the conventional range
        let low_head = inner.free_lowmem.expect("low free chain");
        assert_eq!(inner.chunk(low_head).location, PhysAddr::new(0x1000));
        assert_eq!(inner.chunk(low_head).size, 0x9e000);
        assert!(inner.chunk(low_head).next_buddy.is_none());

        // High memory: the free region minus the pool carve at its top
        let pool_bytes = pool_storage_bytes(5);
        let high_head = inner.free_highmem.expect("high free chain");
        assert_eq!(inner.chunk(high_head).location, PhysAddr::new(0x400000));
        assert_eq!(inner.chunk(high_head).size, 0xc00000 - pool_bytes);
        assert!(inner.chunk(high_head).next_buddy.is_none());

        assert_eq!(inner.free_bytes(true), 0x9e000);
        assert_eq!(inner.free_bytes(false), 0xc00000 - pool_bytes);
    }

    #[test]
    fn test_pool_carve_is_kernel_owned() {
        let (boot, offset) = (boot_info(standard_regions()), fake_ram());
        let inner = build(&boot, offset);

        let pool_bytes = pool_storage_bytes(5);
        let carve = PhysAddr::new(0x1000000 - pool_bytes);
        let id = inner.find_thischunk(carve).expect("pool chunk in map");
        assert_eq!(inner.chunk(id).size, pool_bytes);
        assert!(inner.chunk(id).allocatable);
        assert!(inner.chunk(id).owners.contains(Pid::KERNEL, &inner.pids));
        assert!(inner.chunk(id).next_buddy.is_none());
    }

    #[test]
    fn test_boundary_marker() {
        let (boot, offset) = (boot_info(standard_regions()), fake_ram());
        let inner = build(&boot, offset);

        let boundary = inner.phy_highmmap.expect("boundary marker");
        assert_eq!(inner.chunk(boundary).location, PhysAddr::new(0x100000));
    }

    #[test]
    fn test_kernel_regions_are_owned() {
        let (boot, offset) = (boot_info(standard_regions()), fake_ram());
        let inner = build(&boot, offset);

        let kernel = inner
            .find_thischunk(PhysAddr::new(0x100000))
            .expect("kernel chunk");
        assert!(inner.chunk(kernel).owners.contains(Pid::KERNEL, &inner.pids));
        assert!(inner.chunk(kernel).allocatable);

        let reserved = inner.find_thischunk(PhysAddr::new(0)).expect("bios chunk");
        assert!(inner.chunk(reserved).is_free());
        assert!(!inner.chunk(reserved).allocatable);
    }

    #[test]
    fn test_spares_are_prepared() {
        let (boot, offset) = (boot_info(standard_regions()), fake_ram());
        let inner = build(&boot, offset);

        // A page's worth of records is on hand, and the pid reserve is
        // untouched: bootstrap owners all fit the inline slots
        assert!(inner.chunks.spare_records() >= SPARE_RECORDS);
        assert_eq!(inner.pids.spare_nodes(), PID_POOL_NODES);
    }

    #[test]
    fn test_region_straddling_the_boundary_is_cut() {
        let (boot, offset) = (
            boot_info(vec![
                region(0, 0xf0000, MemoryNature::Reserved),
                region(0xf0000, 0x20000, MemoryNature::Free),
                region(0x110000, 0xef0000, MemoryNature::Free),
            ]),
            fake_ram(),
        );
        let inner = build(&boot, offset);
        inner.assert_invariants(TOP_OF_RAM);

        // The straddling free region became a low piece and a high piece,
        // and the high piece coalesced with the free region after it
        let low = inner.free_lowmem.expect("low free chain");
        assert_eq!(inner.chunk(low).location, PhysAddr::new(0xf0000));
        assert_eq!(inner.chunk(low).size, 0x10000);

        let pool_bytes = pool_storage_bytes(3);
        let high = inner.free_highmem.expect("high free chain");
        assert_eq!(inner.chunk(high).location, PhysAddr::new(0x100000));
        assert_eq!(inner.chunk(high).size, 0xf00000 - pool_bytes);
        assert!(inner.chunk(high).next_buddy.is_none());
    }

    #[test]
    #[should_panic(expected = "no free high-memory region")]
    fn test_no_room_for_the_pool_is_fatal() {
        let (boot, offset) = (
            boot_info(vec![
                region(0, 0x100000, MemoryNature::Free),
                region(0x100000, 0xf00000, MemoryNature::Kernel),
            ]),
            fake_ram(),
        );
        build(&boot, offset);
    }

    #[test]
    #[should_panic(expected = "unusable boot memory map")]
    fn test_malformed_map_is_fatal() {
        let (boot, offset) = (
            boot_info(vec![region(0x1000, 0x100000, MemoryNature::Free)]),
            fake_ram(),
        );
        build(&boot, offset);
    }
}
