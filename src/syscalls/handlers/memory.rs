//! Virtual memory services.

use crate::{
    memory::{page_align_down, page_align_up, MemoryBasicInformation, MemoryProtection, RegionTag},
    process::Handle,
    syscalls::{NtStatus, SyscallContext, SyscallOutcome},
    Error, Result,
};

const MEM_COMMIT: u64 = 0x1000;
const MEM_RESERVE: u64 = 0x2000;
const MEM_DECOMMIT: u64 = 0x4000;
const MEM_RELEASE: u64 = 0x8000;

/// Size of `MEMORY_BASIC_INFORMATION` on x64.
const MEMORY_BASIC_INFORMATION_SIZE: u64 = 0x30;

fn require_current_process(handle: u64) -> Option<NtStatus> {
    if handle == Handle::CURRENT_PROCESS {
        None
    } else {
        // Remote process memory is out of reach by design.
        Some(NtStatus::INVALID_HANDLE)
    }
}

fn memory_error_status(error: &Error) -> Option<NtStatus> {
    match error {
        Error::InvalidParameter(_) => Some(NtStatus::INVALID_PARAMETER),
        Error::InvalidAddress { .. } => Some(NtStatus::CONFLICTING_ADDRESSES),
        Error::AddressSpaceExhausted(_) => Some(NtStatus::NO_MEMORY),
        _ => None,
    }
}

/// `NtAllocateVirtualMemory(ProcessHandle, *BaseAddress, ZeroBits, *RegionSize, AllocationType, Protect)`
pub fn nt_allocate_virtual_memory(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let process_handle = ctx.arg(0);
    let base_ptr = ctx.arg(1);
    let size_ptr = ctx.arg(3);
    let allocation_type = ctx.arg(4);
    let protect = ctx.arg(5);

    if let Some(status) = require_current_process(process_handle) {
        return Ok(SyscallOutcome::Complete(status));
    }

    let base = ctx.read_u64(base_ptr)?;
    let size = ctx.read_u64(size_ptr)?;
    if size == 0 || allocation_type & (MEM_RESERVE | MEM_COMMIT) == 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let protection = MemoryProtection::from_windows(protect as u32);

    let (result_base, result_size) = if allocation_type & MEM_RESERVE != 0 {
        let reserved = match ctx.memory.reserve(base, size, protection, RegionTag::Private) {
            Ok(reserved) => reserved,
            Err(error) => {
                return match memory_error_status(&error) {
                    Some(status) => Ok(SyscallOutcome::Complete(status)),
                    None => Err(error),
                }
            }
        };
        let aligned = page_align_up(size);
        if allocation_type & MEM_COMMIT != 0 {
            if let Err(error) = ctx.memory.commit(ctx.cpu, reserved, aligned, protection) {
                let _ = ctx.memory.release(ctx.cpu, reserved);
                return match memory_error_status(&error) {
                    Some(status) => Ok(SyscallOutcome::Complete(status)),
                    None => Err(error),
                };
            }
        }
        (reserved, aligned)
    } else {
        // Commit into an existing reservation.
        if base == 0 {
            return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
        }
        let start = page_align_down(base);
        let end = page_align_up(base + size);
        if let Err(error) = ctx.memory.commit(ctx.cpu, start, end - start, protection) {
            return match memory_error_status(&error) {
                Some(status) => Ok(SyscallOutcome::Complete(status)),
                None => Err(error),
            };
        }
        (start, end - start)
    };

    ctx.write_u64(base_ptr, result_base)?;
    ctx.write_u64(size_ptr, result_size)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtFreeVirtualMemory(ProcessHandle, *BaseAddress, *RegionSize, FreeType)`
pub fn nt_free_virtual_memory(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let process_handle = ctx.arg(0);
    let base_ptr = ctx.arg(1);
    let size_ptr = ctx.arg(2);
    let free_type = ctx.arg(3);

    if let Some(status) = require_current_process(process_handle) {
        return Ok(SyscallOutcome::Complete(status));
    }

    let base = ctx.read_u64(base_ptr)?;
    let size = ctx.read_u64(size_ptr)?;

    let result = match free_type {
        MEM_RELEASE => {
            if size != 0 {
                return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
            }
            ctx.memory.release(ctx.cpu, page_align_down(base))
        }
        MEM_DECOMMIT => ctx.memory.decommit(ctx.cpu, page_align_down(base), size),
        _ => return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER)),
    };

    match result {
        Ok(()) => {
            ctx.write_u64(base_ptr, page_align_down(base))?;
            ctx.write_u64(size_ptr, if size == 0 { 0 } else { page_align_up(size) })?;
            Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
        }
        Err(Error::InvalidParameter(_)) => {
            Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER))
        }
        Err(Error::InvalidAddress { .. }) => {
            Ok(SyscallOutcome::Complete(NtStatus::MEMORY_NOT_ALLOCATED))
        }
        Err(error) => Err(error),
    }
}

/// `NtProtectVirtualMemory(ProcessHandle, *BaseAddress, *RegionSize, NewProtect, *OldProtect)`
pub fn nt_protect_virtual_memory(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let process_handle = ctx.arg(0);
    let base_ptr = ctx.arg(1);
    let size_ptr = ctx.arg(2);
    let new_protect = ctx.arg(3);
    let old_ptr = ctx.arg(4);

    if let Some(status) = require_current_process(process_handle) {
        return Ok(SyscallOutcome::Complete(status));
    }

    let base = ctx.read_u64(base_ptr)?;
    let size = ctx.read_u64(size_ptr)?;
    let protection = MemoryProtection::from_windows(new_protect as u32);

    let old = match ctx.memory.protect(ctx.cpu, base, size, protection) {
        Ok(old) => old,
        Err(Error::InvalidParameter(_)) => {
            return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER))
        }
        Err(Error::InvalidAddress { .. }) => {
            return Ok(SyscallOutcome::Complete(NtStatus::NOT_COMMITTED))
        }
        Err(error) => return Err(error),
    };

    let start = page_align_down(base);
    ctx.write_u64(base_ptr, start)?;
    ctx.write_u64(size_ptr, page_align_up(base + size) - start)?;
    ctx.write_u32(old_ptr, old.to_windows())?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtQueryVirtualMemory(ProcessHandle, BaseAddress, InfoClass, Buffer, Length, *ReturnLength)`
pub fn nt_query_virtual_memory(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let process_handle = ctx.arg(0);
    let address = ctx.arg(1);
    let info_class = ctx.arg(2);
    let buffer = ctx.arg(3);
    let length = ctx.arg(4);
    let return_length = ctx.arg(5);

    if let Some(status) = require_current_process(process_handle) {
        return Ok(SyscallOutcome::Complete(status));
    }
    if info_class != 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_INFO_CLASS));
    }
    if length < MEMORY_BASIC_INFORMATION_SIZE {
        return Ok(SyscallOutcome::Complete(NtStatus::INFO_LENGTH_MISMATCH));
    }

    let info: MemoryBasicInformation = ctx.memory.query(address);
    ctx.write_u64(buffer, info.base_address)?;
    ctx.write_u64(buffer + 0x08, info.allocation_base)?;
    ctx.write_u32(buffer + 0x10, info.allocation_protect)?;
    ctx.write_u32(buffer + 0x14, 0)?; // PartitionId + padding
    ctx.write_u64(buffer + 0x18, info.region_size)?;
    ctx.write_u32(buffer + 0x20, info.state)?;
    ctx.write_u32(buffer + 0x24, info.protect)?;
    ctx.write_u32(buffer + 0x28, info.kind)?;
    ctx.write_u32(buffer + 0x2C, 0)?;
    ctx.write_u64_opt(return_length, MEMORY_BASIC_INFORMATION_SIZE)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}
