//! Memory region metadata for the guest address space.
//!
//! A [`MemoryRegion`] describes a maximal run of pages sharing the same state,
//! protection, tag and enclosing reservation. The region map in
//! [`MemoryManager`](super::MemoryManager) is pure metadata: page contents live in the
//! CPU engine's memory, which the manager mirrors its committed set into.
//!
//! # Protection model
//!
//! [`MemoryProtection`] flags are modeled after Windows `PAGE_*` protection constants
//! and convert losslessly in both directions, including the `PAGE_GUARD` modifier and
//! `PAGE_NOACCESS` (the empty flag set).

use bitflags::bitflags;

/// Guest page size (4 KiB).
pub const PAGE_SIZE: u64 = 0x1000;

/// Granularity for hintless reservations (64 KiB), matching NT's allocation granularity.
pub const ALLOCATION_GRANULARITY: u64 = 0x10000;

bitflags! {
    /// Memory protection flags for address space regions.
    ///
    /// These flags control what operations are permitted on a region. An empty set is
    /// the no-access protection. [`GUARD`](Self::GUARD) is a modifier: the first access
    /// to a guard page raises a guard-page violation and clears the flag, which is how
    /// thread stacks grow on NT.
    ///
    /// # Common Combinations
    ///
    /// - [`READ_WRITE`](Self::READ_WRITE) - Data sections (`.data`, `.bss`), heaps, stacks
    /// - [`READ_EXECUTE`](Self::READ_EXECUTE) - Code sections (`.text`)
    /// - [`READ`](Self::READ) - Read-only sections (`.rdata`), mapped image headers
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Region is a guard page (raises an exception on first access).
        const GUARD = 0x100;
        /// Read and write access (common for data sections).
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access (common for code sections).
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryProtection {
    /// Windows PAGE_* protection constants.
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_WRITECOPY: u32 = 0x08;
    const PAGE_EXECUTE: u32 = 0x10;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;
    const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
    const PAGE_GUARD: u32 = 0x100;

    /// Converts a Windows `PAGE_*` protection constant to `MemoryProtection` flags.
    ///
    /// The `PAGE_GUARD` modifier carries over; `PAGE_WRITECOPY` variants map to their
    /// plain writable equivalents (copy-on-write is collapsed at commit time).
    #[must_use]
    pub fn from_windows(page_protect: u32) -> Self {
        let mut protection = match page_protect & 0xFF {
            Self::PAGE_NOACCESS => Self::empty(),
            Self::PAGE_READONLY => Self::READ,
            Self::PAGE_READWRITE | Self::PAGE_WRITECOPY => Self::READ_WRITE,
            Self::PAGE_EXECUTE => Self::EXECUTE,
            Self::PAGE_EXECUTE_READ => Self::READ_EXECUTE,
            Self::PAGE_EXECUTE_READWRITE | Self::PAGE_EXECUTE_WRITECOPY => {
                Self::READ_WRITE_EXECUTE
            }
            _ => Self::READ_WRITE,
        };

        if page_protect & Self::PAGE_GUARD != 0 {
            protection |= Self::GUARD;
        }

        protection
    }

    /// Converts `MemoryProtection` flags to the equivalent Windows `PAGE_*` constant.
    #[must_use]
    pub fn to_windows(self) -> u32 {
        let r = self.contains(Self::READ);
        let w = self.contains(Self::WRITE);
        let x = self.contains(Self::EXECUTE);

        let base = match (r, w, x) {
            (false, false, false) => Self::PAGE_NOACCESS,
            (true, false, false) => Self::PAGE_READONLY,
            (_, true, false) => Self::PAGE_READWRITE,
            (false, false, true) => Self::PAGE_EXECUTE,
            (true, false, true) => Self::PAGE_EXECUTE_READ,
            (_, true, true) => Self::PAGE_EXECUTE_READWRITE,
        };

        if self.contains(Self::GUARD) {
            base | Self::PAGE_GUARD
        } else {
            base
        }
    }

    /// Returns `true` if an ordinary data read is permitted.
    #[must_use]
    pub fn allows_read(self) -> bool {
        self.contains(Self::READ) && !self.contains(Self::GUARD)
    }

    /// Returns `true` if an ordinary data write is permitted.
    #[must_use]
    pub fn allows_write(self) -> bool {
        self.contains(Self::WRITE) && !self.contains(Self::GUARD)
    }
}

/// Commitment state of a region's pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    /// Address range is reserved but has no backing pages.
    Reserved,
    /// Pages are committed (zero-filled on commit) and mapped into the engine.
    Committed,
}

/// What a region is used for. Reported through `query` as the NT memory type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionTag {
    /// Ordinary private allocation.
    Private,
    /// Part of a mapped PE image.
    Image,
    /// A thread stack.
    Stack,
    /// A guest heap allocation.
    Heap,
    /// A mapped data file or section view.
    MappedFile,
}

impl RegionTag {
    /// Returns the NT `MEM_*` memory-type constant for this tag.
    #[must_use]
    pub fn to_windows(self) -> u32 {
        match self {
            RegionTag::Image => 0x0100_0000,                      // MEM_IMAGE
            RegionTag::MappedFile => 0x0004_0000,                 // MEM_MAPPED
            RegionTag::Private | RegionTag::Stack | RegionTag::Heap => 0x0002_0000, // MEM_PRIVATE
        }
    }
}

/// A maximal run of pages sharing base, length, protection, state and tag.
///
/// Invariants maintained by the [`MemoryManager`](super::MemoryManager):
/// regions never overlap, base and size are page aligned, adjacent regions with
/// identical attributes are coalesced, and every region records the allocation
/// base and original protection of the reservation it was carved from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base virtual address (page aligned).
    pub base: u64,
    /// Size in bytes (page multiple).
    pub size: u64,
    /// Commitment state.
    pub state: RegionState,
    /// Current protection of every page in the region.
    pub protection: MemoryProtection,
    /// Usage tag.
    pub tag: RegionTag,
    /// Base of the reservation this region belongs to.
    pub allocation_base: u64,
    /// Protection the enclosing reservation was created with.
    pub allocation_protection: MemoryProtection,
}

impl MemoryRegion {
    /// Returns the end address (exclusive) of this region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Returns `true` if the address falls within this region.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    /// Returns `true` if the region's pages are committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state == RegionState::Committed
    }

    /// Returns `true` if `other` directly follows this region with identical
    /// attributes, i.e. the two can be coalesced into one.
    #[must_use]
    pub fn can_merge(&self, other: &MemoryRegion) -> bool {
        self.end() == other.base
            && self.state == other.state
            && self.protection == other.protection
            && self.tag == other.tag
            && self.allocation_base == other.allocation_base
            && self.allocation_protection == other.allocation_protection
    }
}

/// Region information as NT `NtQueryVirtualMemory` information class 0 reports it.
///
/// Field encodings use the raw NT constants (`MEM_COMMIT`, `PAGE_READWRITE`, ...)
/// so the value can be copied into a guest `MEMORY_BASIC_INFORMATION` verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBasicInformation {
    /// Page-aligned base of the queried region.
    pub base_address: u64,
    /// Base of the enclosing reservation (0 for free ranges).
    pub allocation_base: u64,
    /// `PAGE_*` protection the reservation was created with.
    pub allocation_protect: u32,
    /// Size of the run of pages sharing these attributes.
    pub region_size: u64,
    /// `MEM_COMMIT`, `MEM_RESERVE` or `MEM_FREE`.
    pub state: u32,
    /// Current `PAGE_*` protection (0 for free and reserved ranges).
    pub protect: u32,
    /// `MEM_PRIVATE`, `MEM_MAPPED` or `MEM_IMAGE` (0 for free ranges).
    pub kind: u32,
}

impl MemoryBasicInformation {
    /// NT `MEM_COMMIT` state constant.
    pub const MEM_COMMIT: u32 = 0x1000;
    /// NT `MEM_RESERVE` state constant.
    pub const MEM_RESERVE: u32 = 0x2000;
    /// NT `MEM_FREE` state constant.
    pub const MEM_FREE: u32 = 0x10000;
}

/// Aligns an address down to a page boundary.
#[must_use]
pub fn page_align_down(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

/// Aligns an address up to a page boundary.
#[must_use]
pub fn page_align_up(address: u64) -> u64 {
    (address + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_from_windows() {
        assert_eq!(MemoryProtection::from_windows(0x01), MemoryProtection::empty());
        assert_eq!(MemoryProtection::from_windows(0x02), MemoryProtection::READ);
        assert_eq!(MemoryProtection::from_windows(0x04), MemoryProtection::READ_WRITE);
        assert_eq!(MemoryProtection::from_windows(0x20), MemoryProtection::READ_EXECUTE);
        assert_eq!(
            MemoryProtection::from_windows(0x40),
            MemoryProtection::READ_WRITE_EXECUTE
        );
        assert_eq!(
            MemoryProtection::from_windows(0x104),
            MemoryProtection::READ_WRITE | MemoryProtection::GUARD
        );
    }

    #[test]
    fn test_protection_to_windows_round_trip() {
        for raw in [0x01u32, 0x02, 0x04, 0x10, 0x20, 0x40, 0x102, 0x104] {
            let prot = MemoryProtection::from_windows(raw);
            assert_eq!(prot.to_windows(), raw, "round trip failed for {raw:#x}");
        }
    }

    #[test]
    fn test_guard_blocks_ordinary_access() {
        let guarded = MemoryProtection::READ_WRITE | MemoryProtection::GUARD;
        assert!(!guarded.allows_read());
        assert!(!guarded.allows_write());
        assert!(MemoryProtection::READ_WRITE.allows_write());
        assert!(!MemoryProtection::READ.allows_write());
    }

    #[test]
    fn test_region_merge_rules() {
        let a = MemoryRegion {
            base: 0x1000,
            size: 0x1000,
            state: RegionState::Committed,
            protection: MemoryProtection::READ_WRITE,
            tag: RegionTag::Private,
            allocation_base: 0x1000,
            allocation_protection: MemoryProtection::READ_WRITE,
        };
        let mut b = MemoryRegion {
            base: 0x2000,
            ..a.clone()
        };
        assert!(a.can_merge(&b));

        b.protection = MemoryProtection::READ;
        assert!(!a.can_merge(&b));

        b.protection = MemoryProtection::READ_WRITE;
        b.allocation_base = 0x2000;
        assert!(!a.can_merge(&b));
    }

    #[test]
    fn test_page_alignment() {
        assert_eq!(page_align_down(0x1234), 0x1000);
        assert_eq!(page_align_up(0x1234), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
    }
}
