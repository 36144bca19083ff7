//! I/O services for the console and the read-only filesystem view.

use std::io::{Read, Seek, SeekFrom};

use crate::{
    process::{FileBacking, KernelObject},
    syscalls::{NtStatus, SyscallContext, SyscallOutcome},
    Result,
};

/// Largest single transfer accepted, matching the cap NT places on one
/// user-buffer I/O request.
const MAX_IO_TRANSFER: u64 = 0x7FFF_F000;

/// `IO_STATUS_BLOCK`: status at +0, information at +8.
fn write_iosb(
    ctx: &mut SyscallContext<'_>,
    iosb: u64,
    status: NtStatus,
    information: u64,
) -> Result<()> {
    if iosb != 0 {
        ctx.write_u64(iosb, u64::from(status.0))?;
        ctx.write_u64(iosb + 8, information)?;
    }
    Ok(())
}

/// Validates a guest transfer request before any host-side buffer is sized
/// from it: the length must be within the NT per-call cap and the buffer range
/// fully committed. Returns the rejecting status, if any.
///
/// The committed-range check bounds later staging allocations by memory the
/// guest actually has, never by the raw 64-bit register value.
fn validate_transfer(ctx: &SyscallContext<'_>, buffer: u64, length: u64) -> Option<NtStatus> {
    if length > MAX_IO_TRANSFER {
        return Some(NtStatus::INVALID_PARAMETER);
    }
    if !ctx.memory.is_range_committed(buffer, length) {
        return Some(NtStatus::ACCESS_VIOLATION);
    }
    None
}

/// `NtWriteFile(Handle, Event, ApcRoutine, ApcContext, *IoStatusBlock, Buffer, Length, *ByteOffset, Key)`
pub fn nt_write_file(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let iosb = ctx.arg(4);
    let buffer = ctx.arg(5);
    let length = ctx.arg(6);

    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let object = entry.object;
    let backing = match ctx.process.objects.get(object) {
        Some(KernelObject::File(file)) => file.backing.clone(),
        Some(_) => return Ok(SyscallOutcome::Complete(NtStatus::OBJECT_TYPE_MISMATCH)),
        None => return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE)),
    };

    match backing {
        FileBacking::Stdout | FileBacking::Stderr => {
            if length == 0 {
                write_iosb(ctx, iosb, NtStatus::SUCCESS, 0)?;
                return Ok(SyscallOutcome::Complete(NtStatus::SUCCESS));
            }
            if let Some(status) = validate_transfer(ctx, buffer, length) {
                return Ok(SyscallOutcome::Complete(status));
            }
            let mut data = vec![0u8; length as usize];
            ctx.memory.read(ctx.cpu, buffer, &mut data)?;
            ctx.emit_stdout(&data);
            write_iosb(ctx, iosb, NtStatus::SUCCESS, length)?;
            Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
        }
        FileBacking::Stdin => Ok(SyscallOutcome::Complete(NtStatus::ACCESS_DENIED)),
        // The filesystem view is read-only.
        FileBacking::Host(_) => Ok(SyscallOutcome::Complete(NtStatus::ACCESS_DENIED)),
    }
}

/// `NtReadFile(Handle, Event, ApcRoutine, ApcContext, *IoStatusBlock, Buffer, Length, *ByteOffset, Key)`
pub fn nt_read_file(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let iosb = ctx.arg(4);
    let buffer = ctx.arg(5);
    let length = ctx.arg(6);

    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let object = entry.object;
    let (backing, position) = match ctx.process.objects.get(object) {
        Some(KernelObject::File(file)) => (file.backing.clone(), file.position),
        Some(_) => return Ok(SyscallOutcome::Complete(NtStatus::OBJECT_TYPE_MISMATCH)),
        None => return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE)),
    };

    match backing {
        // Console input is not wired up; readers observe a clean end of input.
        FileBacking::Stdin => {
            write_iosb(ctx, iosb, NtStatus::END_OF_FILE, 0)?;
            Ok(SyscallOutcome::Complete(NtStatus::END_OF_FILE))
        }
        FileBacking::Stdout | FileBacking::Stderr => {
            Ok(SyscallOutcome::Complete(NtStatus::ACCESS_DENIED))
        }
        FileBacking::Host(path) => {
            if length == 0 {
                write_iosb(ctx, iosb, NtStatus::SUCCESS, 0)?;
                return Ok(SyscallOutcome::Complete(NtStatus::SUCCESS));
            }
            if let Some(status) = validate_transfer(ctx, buffer, length) {
                return Ok(SyscallOutcome::Complete(status));
            }
            let mut data = vec![0u8; length as usize];
            let read = match std::fs::File::open(&path) {
                Ok(mut file) => {
                    if file.seek(SeekFrom::Start(position)).is_err() {
                        0
                    } else {
                        file.read(&mut data).unwrap_or(0)
                    }
                }
                Err(_) => {
                    return Ok(SyscallOutcome::Complete(NtStatus::OBJECT_NAME_NOT_FOUND))
                }
            };
            if read == 0 {
                write_iosb(ctx, iosb, NtStatus::END_OF_FILE, 0)?;
                return Ok(SyscallOutcome::Complete(NtStatus::END_OF_FILE));
            }
            ctx.memory.write(ctx.cpu, buffer, &data[..read])?;
            if let Some(KernelObject::File(file)) = ctx.process.objects.get_mut(object) {
                file.position += read as u64;
            }
            write_iosb(ctx, iosb, NtStatus::SUCCESS, read as u64)?;
            Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
        }
    }
}
