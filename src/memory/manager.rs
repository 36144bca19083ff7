//! Authoritative virtual-memory map for the emulated process.
//!
//! The [`MemoryManager`] owns the region map and pushes every change to the committed
//! set down into the CPU engine's page tables, so that after any operation the engine's
//! mappings mirror the committed regions and their protection exactly. Page contents
//! live in the engine; the manager holds metadata only.
//!
//! # Semantics
//!
//! Operations follow NT virtual-memory semantics: address space is `reserve`d in
//! 64 KiB-granular allocations, pages inside a reservation are `commit`ted
//! (zero-filled, idempotently), `protect` changes committed pages and returns the
//! previous protection of the first page, `decommit` returns pages to the reserved
//! state and `release` tears down a whole reservation. `query` reports regions the way
//! `NtQueryVirtualMemory` information class 0 does, including free runs.
//!
//! # Access paths
//!
//! Guest-semantics [`read`](MemoryManager::read) and [`write`](MemoryManager::write)
//! honor page protection (a write to a read-only page fails with a guest fault, never a
//! host error). The privileged variants bypass protection for the kernel side but still
//! require committed pages.

use std::collections::BTreeMap;

use crate::{
    cpu::CpuEngine,
    memory::region::{
        page_align_down, page_align_up, MemoryBasicInformation, MemoryProtection, MemoryRegion,
        RegionState, RegionTag, ALLOCATION_GRANULARITY, PAGE_SIZE,
    },
    Error, Result,
};

/// Lowest address handed out by hintless reservations.
const DEFAULT_FLOOR: u64 = 0x10000;

/// Exclusive top of the emulated user address space.
const DEFAULT_CEILING: u64 = 0x7FFF_FFFE_0000;

/// Page-granular virtual address space manager for the guest.
///
/// Tracks reservations and commits in an ordered map keyed by region base, giving
/// O(log n) address lookup. Regions are split on boundary-crossing operations and
/// adjacent regions with identical attributes are coalesced after every mutation.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    /// Region map keyed by base address. Free space is implicit (gaps).
    regions: BTreeMap<u64, MemoryRegion>,
    /// Lowest address first-fit searches start from.
    floor: u64,
    /// Exclusive upper bound of the usable address space.
    ceiling: u64,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    /// Creates an empty address space map with the default floor and ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            floor: DEFAULT_FLOOR,
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Reserves a page-aligned range of the guest address space.
    ///
    /// If `hint` is non-zero the reservation is attempted exactly there and fails if
    /// the range is occupied. With a zero hint the lowest free range above the floor
    /// that fits is used, aligned to the 64 KiB allocation granularity.
    ///
    /// Returns the reservation base.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero size or an unaligned hint
    /// - [`Error::InvalidAddress`] if the hinted range conflicts with an existing region
    /// - [`Error::AddressSpaceExhausted`] if no free range fits
    pub fn reserve(
        &mut self,
        hint: u64,
        size: u64,
        protection: MemoryProtection,
        tag: RegionTag,
    ) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidParameter("reservation size is zero".into()));
        }
        if hint != 0 && hint % PAGE_SIZE != 0 {
            return Err(Error::InvalidParameter(format!(
                "reservation hint {hint:#x} is not page aligned"
            )));
        }

        let size = page_align_up(size);
        let base = if hint != 0 {
            if hint.checked_add(size).is_none_or(|end| end > self.ceiling) {
                return Err(Error::InvalidParameter(format!(
                    "reservation {hint:#x}+{size:#x} exceeds the address space"
                )));
            }
            if !self.is_range_free(hint, size) {
                return Err(Error::InvalidAddress {
                    address: hint,
                    reason: "reservation conflicts with an existing region".into(),
                });
            }
            hint
        } else {
            self.find_free(size, ALLOCATION_GRANULARITY)
                .ok_or(Error::AddressSpaceExhausted(size))?
        };

        self.regions.insert(
            base,
            MemoryRegion {
                base,
                size,
                state: RegionState::Reserved,
                protection,
                tag,
                allocation_base: base,
                allocation_protection: protection,
            },
        );

        Ok(base)
    }

    /// Commits pages inside an existing reservation, zero-filled, with the requested
    /// protection, and maps them into the CPU engine.
    ///
    /// Committing already-committed pages is idempotent and updates their protection.
    /// The range is validated in full before anything changes: a commit reaching
    /// beyond the reservation fails without partially committing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero size
    /// - [`Error::InvalidAddress`] if any page of the range is outside a single
    ///   reservation
    pub fn commit(
        &mut self,
        cpu: &mut dyn CpuEngine,
        base: u64,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidParameter("commit size is zero".into()));
        }
        let start = page_align_down(base);
        let end = page_align_up(base + size);

        // Validate fully before mutating: never partial-commit.
        self.allocation_covering(start, end)?;

        self.split_at(start);
        self.split_at(end);

        let keys: Vec<u64> = self
            .regions
            .range(start..end)
            .map(|(base, _)| *base)
            .collect();
        for key in keys {
            let region = self.regions.get_mut(&key).expect("region key just listed");
            match region.state {
                RegionState::Reserved => {
                    region.state = RegionState::Committed;
                    region.protection = protection;
                    cpu.map_memory(region.base, region.size, protection);
                }
                RegionState::Committed => {
                    if region.protection != protection {
                        region.protection = protection;
                        cpu.protect_memory(region.base, region.size, protection);
                    }
                }
            }
        }

        self.coalesce(start, end);
        Ok(())
    }

    /// Changes the protection of committed pages and returns the previous protection
    /// of the first page, following `NtProtectVirtualMemory` semantics.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero size
    /// - [`Error::InvalidAddress`] if any page in the range is not committed
    pub fn protect(
        &mut self,
        cpu: &mut dyn CpuEngine,
        base: u64,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection> {
        if size == 0 {
            return Err(Error::InvalidParameter("protect size is zero".into()));
        }
        let start = page_align_down(base);
        let end = page_align_up(base + size);

        if !self.is_range_committed(start, end - start) {
            return Err(Error::InvalidAddress {
                address: start,
                reason: "protect range contains pages that are not committed".into(),
            });
        }

        let old = self
            .region_at(start)
            .map(|region| region.protection)
            .expect("committed range has a region");

        self.split_at(start);
        self.split_at(end);

        let keys: Vec<u64> = self
            .regions
            .range(start..end)
            .map(|(base, _)| *base)
            .collect();
        for key in keys {
            let region = self.regions.get_mut(&key).expect("region key just listed");
            if region.protection != protection {
                region.protection = protection;
                cpu.protect_memory(region.base, region.size, protection);
            }
        }

        self.coalesce(start, end);
        Ok(old)
    }

    /// Returns committed pages to the reserved state and unmaps them from the engine.
    ///
    /// A zero `size` decommits the whole reservation; `base` must then be the
    /// allocation base. Decommitting pages that are already reserved is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not covered by a single
    /// reservation.
    pub fn decommit(&mut self, cpu: &mut dyn CpuEngine, base: u64, size: u64) -> Result<()> {
        let (start, end) = if size == 0 {
            let allocation = self.allocation_extent(base)?;
            if allocation.0 != base {
                return Err(Error::InvalidParameter(format!(
                    "zero-size decommit requires the allocation base, got {base:#x}"
                )));
            }
            allocation
        } else {
            let start = page_align_down(base);
            let end = page_align_up(base + size);
            self.allocation_covering(start, end)?;
            (start, end)
        };

        self.split_at(start);
        self.split_at(end);

        let keys: Vec<u64> = self
            .regions
            .range(start..end)
            .map(|(base, _)| *base)
            .collect();
        for key in keys {
            let region = self.regions.get_mut(&key).expect("region key just listed");
            if region.state == RegionState::Committed {
                cpu.unmap_memory(region.base, region.size);
                region.state = RegionState::Reserved;
            }
        }

        self.coalesce(start, end);
        Ok(())
    }

    /// Releases an entire reservation, unmapping any committed pages.
    ///
    /// `base` must be the allocation base of an existing reservation; a mismatched
    /// base fails and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `base` is not an allocation base.
    pub fn release(&mut self, cpu: &mut dyn CpuEngine, base: u64) -> Result<()> {
        let (start, end) = self.allocation_extent(base)?;
        if start != base {
            return Err(Error::InvalidParameter(format!(
                "release base {base:#x} does not match the allocation base {start:#x}"
            )));
        }

        let keys: Vec<u64> = self
            .regions
            .range(start..end)
            .map(|(base, _)| *base)
            .collect();
        for key in keys {
            let region = self.regions.remove(&key).expect("region key just listed");
            if region.state == RegionState::Committed {
                cpu.unmap_memory(region.base, region.size);
            }
        }
        Ok(())
    }

    /// Reports the region covering `address` the way `NtQueryVirtualMemory`
    /// information class 0 does. Free gaps are reported as `MEM_FREE` runs
    /// extending to the next region or the top of the address space.
    #[must_use]
    pub fn query(&self, address: u64) -> MemoryBasicInformation {
        let page = page_align_down(address);

        if let Some(region) = self.region_at(address) {
            return MemoryBasicInformation {
                base_address: region.base,
                allocation_base: region.allocation_base,
                allocation_protect: region.allocation_protection.to_windows(),
                region_size: region.size,
                state: match region.state {
                    RegionState::Committed => MemoryBasicInformation::MEM_COMMIT,
                    RegionState::Reserved => MemoryBasicInformation::MEM_RESERVE,
                },
                protect: match region.state {
                    RegionState::Committed => region.protection.to_windows(),
                    RegionState::Reserved => 0,
                },
                kind: region.tag.to_windows(),
            };
        }

        let next_base = self
            .regions
            .range(page..)
            .next()
            .map_or(self.ceiling, |(base, _)| *base);
        MemoryBasicInformation {
            base_address: page,
            allocation_base: 0,
            allocation_protect: 0,
            region_size: next_base - page,
            state: MemoryBasicInformation::MEM_FREE,
            protect: 0,
            kind: 0,
        }
    }

    /// Reads guest memory with guest access semantics: every page of the range must
    /// be committed and readable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GuestFault`] when protection forbids the read.
    pub fn read(&self, cpu: &mut dyn CpuEngine, address: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(address, buf.len() as u64, false)?;
        self.read_privileged(cpu, address, buf)
    }

    /// Writes guest memory with guest access semantics: every page of the range must
    /// be committed and writable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GuestFault`] when protection forbids the write.
    pub fn write(&mut self, cpu: &mut dyn CpuEngine, address: u64, data: &[u8]) -> Result<()> {
        self.check_access(address, data.len() as u64, true)?;
        self.write_privileged(cpu, address, data)
    }

    /// Reads guest memory in privileged mode, bypassing protection but still
    /// requiring committed pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not committed.
    pub fn read_privileged(
        &self,
        cpu: &mut dyn CpuEngine,
        address: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !cpu.read_memory(address, buf) {
            return Err(Error::InvalidAddress {
                address,
                reason: format!("read of {:#x} bytes crosses unmapped pages", buf.len()),
            });
        }
        Ok(())
    }

    /// Writes guest memory in privileged mode, bypassing protection but still
    /// requiring committed pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not committed.
    pub fn write_privileged(
        &mut self,
        cpu: &mut dyn CpuEngine,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !cpu.write_memory(address, data) {
            return Err(Error::InvalidAddress {
                address,
                reason: format!("write of {:#x} bytes crosses unmapped pages", data.len()),
            });
        }
        Ok(())
    }

    /// Reads a NUL-terminated byte string from guest memory (privileged).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the string runs off committed memory
    /// before a terminator within `max_len` bytes.
    pub fn read_string(
        &self,
        cpu: &mut dyn CpuEngine,
        address: u64,
        max_len: usize,
    ) -> Result<String> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        while bytes.len() < max_len {
            let mut byte = [0u8; 1];
            self.read_privileged(cpu, cursor, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
            cursor += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads a NUL-terminated UTF-16 string from guest memory (privileged).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the string runs off committed memory
    /// before a terminator within `max_len` code units.
    pub fn read_wide_string(
        &self,
        cpu: &mut dyn CpuEngine,
        address: u64,
        max_len: usize,
    ) -> Result<String> {
        let mut units = Vec::new();
        let mut cursor = address;
        while units.len() < max_len {
            let mut unit = [0u8; 2];
            self.read_privileged(cpu, cursor, &mut unit)?;
            let value = u16::from_le_bytes(unit);
            if value == 0 {
                break;
            }
            units.push(value);
            cursor += 2;
        }
        Ok(widestring::U16Str::from_slice(&units).to_string_lossy())
    }

    /// Returns the region containing `address`, if any.
    #[must_use]
    pub fn region_at(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(address))
    }

    /// Returns `true` if every page of `[address, address + size)` is committed.
    #[must_use]
    pub fn is_range_committed(&self, address: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let end = page_align_up(address + size);
        let mut cursor = page_align_down(address);
        while cursor < end {
            match self.region_at(cursor) {
                Some(region) if region.is_committed() => cursor = region.end(),
                _ => return false,
            }
        }
        true
    }

    /// Returns an iterator over all regions in ascending base order.
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// Unmaps every committed region from the engine and clears the map.
    ///
    /// Used by snapshot restore before replaying a saved region set.
    pub fn clear(&mut self, cpu: &mut dyn CpuEngine) {
        for region in self.regions.values() {
            if region.is_committed() {
                cpu.unmap_memory(region.base, region.size);
            }
        }
        self.regions.clear();
    }

    /// Inserts a region verbatim and maps it into the engine if committed.
    ///
    /// Used by snapshot restore; the caller guarantees non-overlap.
    pub fn insert_region(&mut self, cpu: &mut dyn CpuEngine, region: MemoryRegion) {
        if region.is_committed() {
            cpu.map_memory(region.base, region.size, region.protection);
        }
        self.regions.insert(region.base, region);
    }

    /// Checks guest access permission for a byte range.
    fn check_access(&self, address: u64, size: u64, write: bool) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = page_align_up(address + size);
        let mut cursor = page_align_down(address);
        while cursor < end {
            let region = self.region_at(cursor);
            let allowed = region.is_some_and(|region| {
                region.is_committed()
                    && if write {
                        region.protection.allows_write()
                    } else {
                        region.protection.allows_read()
                    }
            });
            if !allowed {
                return Err(Error::GuestFault {
                    address: cursor.max(address),
                    write,
                });
            }
            cursor = region.expect("allowed implies region").end();
        }
        Ok(())
    }

    /// Returns `true` if `[base, base + size)` intersects no region.
    fn is_range_free(&self, base: u64, size: u64) -> bool {
        let end = base + size;
        // A region starting before `end` and ending after `base` overlaps.
        self.regions
            .range(..end)
            .next_back()
            .is_none_or(|(_, region)| region.end() <= base)
    }

    /// First-fit search for a free range of `size` bytes at `align`ment, lowest
    /// address first above the floor.
    fn find_free(&self, size: u64, align: u64) -> Option<u64> {
        let mut candidate = self.floor.next_multiple_of(align);
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.base >= candidate && region.base - candidate >= size {
                return Some(candidate);
            }
            candidate = region.end().next_multiple_of(align);
        }
        if candidate + size <= self.ceiling {
            Some(candidate)
        } else {
            None
        }
    }

    /// Verifies `[start, end)` is fully covered by regions of one reservation and
    /// returns its allocation base.
    fn allocation_covering(&self, start: u64, end: u64) -> Result<u64> {
        let first = self.region_at(start).ok_or(Error::InvalidAddress {
            address: start,
            reason: "range is not backed by a reservation".into(),
        })?;
        let allocation_base = first.allocation_base;

        let mut cursor = first.end();
        while cursor < end {
            match self.region_at(cursor) {
                Some(region) if region.allocation_base == allocation_base => {
                    cursor = region.end();
                }
                _ => {
                    return Err(Error::InvalidAddress {
                        address: cursor,
                        reason: "range extends beyond the reservation".into(),
                    })
                }
            }
        }
        Ok(allocation_base)
    }

    /// Returns the `[start, end)` extent of the reservation containing `address`.
    fn allocation_extent(&self, address: u64) -> Result<(u64, u64)> {
        let allocation_base = self
            .region_at(address)
            .map(|region| region.allocation_base)
            .ok_or(Error::InvalidAddress {
                address,
                reason: "address is not backed by a reservation".into(),
            })?;

        let mut start = allocation_base;
        let mut end = allocation_base;
        for region in self.regions.range(allocation_base..).map(|(_, r)| r) {
            if region.allocation_base != allocation_base {
                break;
            }
            start = start.min(region.base);
            end = end.max(region.end());
        }
        Ok((start, end))
    }

    /// Splits the region spanning `address` so that `address` becomes a region base.
    fn split_at(&mut self, address: u64) {
        let Some(region) = self.region_at(address) else {
            return;
        };
        if region.base == address {
            return;
        }

        let mut low = region.clone();
        let mut high = region.clone();
        low.size = address - low.base;
        high.base = address;
        high.size = region.end() - address;

        self.regions.insert(low.base, low);
        self.regions.insert(high.base, high);
    }

    /// Coalesces adjacent identical regions around the mutated range.
    fn coalesce(&mut self, start: u64, end: u64) {
        // Widen one region in each direction so boundary merges are seen.
        let scan_start = self
            .regions
            .range(..start)
            .next_back()
            .map_or(start, |(base, _)| *base);

        let mut cursor = scan_start;
        while let Some(region) = self.regions.get(&cursor).cloned() {
            if cursor >= end {
                break;
            }
            let next_base = region.end();
            match self.regions.get(&next_base) {
                Some(next) if region.can_merge(next) => {
                    let merged_size = region.size + next.size;
                    self.regions.remove(&next_base);
                    let entry = self.regions.get_mut(&cursor).expect("merge target exists");
                    entry.size = merged_size;
                    // Stay on the same region, it may merge again.
                }
                Some(_) => cursor = next_base,
                // Gap: hop to the next region inside the scanned range.
                None => match self.regions.range(next_base..).next().map(|(base, _)| *base) {
                    Some(base) if base < end => cursor = base,
                    _ => break,
                },
            }
        }
    }
}
