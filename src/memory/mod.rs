//! Page-granular virtual memory for the emulated process.
//!
//! This module owns the authoritative map of the guest address space:
//!
//! - [`MemoryManager`] - reservations, commits, protections, queries and guest/privileged
//!   access paths, mirrored into the CPU engine's page tables
//! - [`MemoryRegion`] - metadata for a maximal run of pages with identical attributes
//! - [`MemoryProtection`] - R/W/X/guard flags with lossless Windows `PAGE_*` conversion
//! - [`MemoryBasicInformation`] - query results shaped like `NtQueryVirtualMemory` class 0
//!
//! # Invariants
//!
//! After any operation: regions are sorted by base and never overlap; adjacent regions
//! with identical attributes are coalesced; the union of committed regions equals the
//! set of pages mapped in the CPU engine, protection included. Operations that fail
//! leave the map untouched (no partial commits).

mod manager;
mod region;

pub use manager::MemoryManager;
pub use region::{
    page_align_down, page_align_up, MemoryBasicInformation, MemoryProtection, MemoryRegion,
    RegionState, RegionTag, ALLOCATION_GRANULARITY, PAGE_SIZE,
};
