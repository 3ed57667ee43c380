//! The coarse physical memory map handed over by the loader.
//!
//! The map is delivered as a pointer + count pair of [`BootMemoryRegion`]
//! records, sorted by address, without overlaps, covering all of physical
//! memory from address 0 to the top of detected RAM. The kernel's memory
//! manager consumes it exactly once, at construction.

use core::fmt;
use core::str;

use x86_64::PhysAddr;

/// Coarse classification of a boot-time memory region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryNature {
    /// Conventional memory, free for the kernel to use
    Free = 0,
    /// Reserved by firmware or hardware (BIOS data, MMIO windows). The
    /// allocator must never hand this out.
    Reserved = 1,
    /// Data belonging to the bootstrap loader, reclaimable once the kernel
    /// no longer needs the handoff structures.
    Bootstrap = 2,
    /// The kernel image and any loaded modules
    Kernel = 3,
}

/// One record of the loader-provided memory map.
///
/// `name` is a NUL-terminated byte string describing the region (for example
/// the ELF segment it was loaded from), or null.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BootMemoryRegion {
    location: u64,
    size: u64,
    nature: MemoryNature,
    name: *const u8,
}

impl BootMemoryRegion {
    pub fn new(location: PhysAddr, size: u64, nature: MemoryNature) -> BootMemoryRegion {
        BootMemoryRegion {
            location: location.as_u64(),
            size,
            nature,
            name: core::ptr::null(),
        }
    }

    pub fn with_name(mut self, name: *const u8) -> BootMemoryRegion {
        self.name = name;
        self
    }

    /// Starting address of the region
    pub fn location(&self) -> PhysAddr {
        PhysAddr::new(self.location)
    }

    /// Size of the region, in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Ending address of the region (exclusive)
    pub fn end(&self) -> PhysAddr {
        PhysAddr::new(self.location + self.size)
    }

    pub fn nature(&self) -> MemoryNature {
        self.nature
    }

    pub fn is_free(&self) -> bool {
        self.nature == MemoryNature::Free
    }

    /// The loader-assigned region name, if there is one and it is valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        if self.name.is_null() {
            return None;
        }

        // Safety: the loader guarantees `name` points to a NUL-terminated
        // string that lives as long as the handoff structures
        unsafe {
            let mut len = 0;
            while *self.name.add(len) != 0 {
                len += 1;
            }
            let bytes = core::slice::from_raw_parts(self.name, len);
            str::from_utf8(bytes).ok()
        }
    }
}

impl fmt::Display for BootMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} - {:#010x}: {:?}",
            self.location,
            self.location + self.size,
            self.nature
        )?;
        if let Some(name) = self.name() {
            write!(f, " ({})", name)?;
        }
        Ok(())
    }
}

/// Ways the loader-provided map can be unusable. Any of these is fatal for
/// the kernel; there is no meaningful recovery from a broken memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The map contains no entries at all
    Empty,
    /// Coverage does not begin at physical address 0
    DoesNotStartAtZero,
    /// The entry at this index starts before the previous one ends (the map
    /// is unsorted or self-overlapping)
    Overlapping { index: usize },
    /// There is unmapped address space between this entry and the previous
    /// one
    Gap { index: usize },
    /// The entry at this index has zero size
    EmptyRegion { index: usize },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::Empty => write!(f, "memory map has no entries"),
            MapError::DoesNotStartAtZero => {
                write!(f, "memory map does not start at physical address 0")
            }
            MapError::Overlapping { index } => {
                write!(f, "memory map entry {} overlaps its predecessor", index)
            }
            MapError::Gap { index } => {
                write!(f, "memory map has a hole before entry {}", index)
            }
            MapError::EmptyRegion { index } => {
                write!(f, "memory map entry {} is empty", index)
            }
        }
    }
}

/// Check that `regions` forms a well-formed memory map: nonempty, sorted,
/// gapless, overlap-free coverage starting at address 0.
pub fn validate(regions: &[BootMemoryRegion]) -> Result<(), MapError> {
    let first = regions.first().ok_or(MapError::Empty)?;
    if first.location() != PhysAddr::new(0) {
        return Err(MapError::DoesNotStartAtZero);
    }

    let mut expected = PhysAddr::new(0);
    for (index, region) in regions.iter().enumerate() {
        if region.size() == 0 {
            return Err(MapError::EmptyRegion { index });
        }
        if region.location() < expected {
            return Err(MapError::Overlapping { index });
        }
        if region.location() > expected {
            return Err(MapError::Gap { index });
        }
        expected = region.end();
    }

    Ok(())
}

/// Top of detected RAM: the exclusive end of the last entry.
pub fn top_of_ram(regions: &[BootMemoryRegion]) -> PhysAddr {
    regions.last().map(BootMemoryRegion::end).unwrap_or(PhysAddr::new(0))
}

#[cfg(test)]
mod test {
    use super::*;

    fn region(location: u64, size: u64, nature: MemoryNature) -> BootMemoryRegion {
        BootMemoryRegion::new(PhysAddr::new(location), size, nature)
    }

    #[test]
    fn test_valid_map() {
        let map = [
            region(0, 0x1000, MemoryNature::Reserved),
            region(0x1000, 0xff000, MemoryNature::Free),
            region(0x100000, 0x100000, MemoryNature::Kernel),
        ];
        assert_eq!(validate(&map), Ok(()));
        assert_eq!(top_of_ram(&map), PhysAddr::new(0x200000));
    }

    #[test]
    fn test_empty_map() {
        assert_eq!(validate(&[]), Err(MapError::Empty));
    }

    #[test]
    fn test_map_must_start_at_zero() {
        let map = [region(0x1000, 0x1000, MemoryNature::Free)];
        assert_eq!(validate(&map), Err(MapError::DoesNotStartAtZero));
    }

    #[test]
    fn test_gap_detected() {
        let map = [
            region(0, 0x1000, MemoryNature::Reserved),
            region(0x2000, 0x1000, MemoryNature::Free),
        ];
        assert_eq!(validate(&map), Err(MapError::Gap { index: 1 }));
    }

    #[test]
    fn test_overlap_detected() {
        let map = [
            region(0, 0x2000, MemoryNature::Reserved),
            region(0x1000, 0x1000, MemoryNature::Free),
        ];
        assert_eq!(validate(&map), Err(MapError::Overlapping { index: 1 }));
    }

    #[test]
    fn test_zero_length_entry_rejected() {
        let map = [
            region(0, 0x1000, MemoryNature::Reserved),
            region(0x1000, 0, MemoryNature::Free),
        ];
        assert_eq!(validate(&map), Err(MapError::EmptyRegion { index: 1 }));
    }

    #[test]
    fn test_region_name() {
        static NAME: &[u8] = b".text\0";
        let named = region(0, 0x1000, MemoryNature::Kernel).with_name(NAME.as_ptr());
        assert_eq!(named.name(), Some(".text"));
        assert_eq!(region(0, 0x1000, MemoryNature::Free).name(), None);
    }
}
