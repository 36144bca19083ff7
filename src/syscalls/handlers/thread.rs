//! Thread services: creation, termination, suspension, sleeping, yielding and APCs.

use crate::{
    process::{Apc, Handle, HandleType, KernelObject, WaitKind},
    syscalls::{handlers::wait_on_objects, NtStatus, SyscallContext, SyscallOutcome, TimeoutArg},
    Result,
};

/// `THREAD_ALL_ACCESS`.
const THREAD_ACCESS: u32 = 0x1F_FFFF;

/// `THREAD_CREATE_FLAGS_CREATE_SUSPENDED`.
const CREATE_SUSPENDED: u64 = 0x1;

/// Resolves a thread handle (or the current-thread pseudo-handle) to a TID.
fn resolve_thread(ctx: &SyscallContext<'_>, raw: u64) -> Result<Option<u32>> {
    if raw == Handle::CURRENT_THREAD || raw == 0 {
        return Ok(Some(ctx.current_tid()?));
    }
    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(None);
    };
    match ctx.process.objects.get(entry.object) {
        Some(KernelObject::Thread(tid)) => Ok(Some(*tid)),
        _ => Ok(None),
    }
}

/// `NtCreateThreadEx(*Handle, Access, ObjectAttributes, Process, StartRoutine,
/// Argument, CreateFlags, ZeroBits, StackSize, MaximumStackSize, AttributeList)`
pub fn nt_create_thread_ex(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let handle_ptr = ctx.arg(0);
    let process_handle = ctx.arg(3);
    let start_routine = ctx.arg(4);
    let argument = ctx.arg(5);
    let create_flags = ctx.arg(6);
    let stack_size = ctx.arg(8);

    if process_handle != Handle::CURRENT_PROCESS {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    }
    if start_routine == 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }

    let suspended = create_flags & CREATE_SUSPENDED != 0;
    let tid = ctx.process.create_thread(
        ctx.cpu,
        ctx.memory,
        start_routine,
        argument,
        stack_size,
        suspended,
    )?;

    // The returned handle references the thread's own kernel object.
    let object = ctx.process.threads[&tid].object;
    ctx.process.objects.add_ref(object);
    let handle = ctx
        .process
        .handles
        .insert(object, HandleType::Thread, THREAD_ACCESS, false);
    ctx.write_u64(handle_ptr, u64::from(handle.raw()))?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtTerminateThread(Handle, ExitStatus)`
pub fn nt_terminate_thread(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let exit_status = ctx.arg(1) as u32;

    let Some(tid) = resolve_thread(ctx, raw)? else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let current = ctx.current_tid()?;
    ctx.process
        .terminate_thread(ctx.cpu, ctx.memory, tid, exit_status)?;
    if tid == current {
        *ctx.switch_pending = true;
    }
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtSuspendThread(Handle, *PreviousSuspendCount)`
pub fn nt_suspend_thread(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let previous_ptr = ctx.arg(1);

    let Some(tid) = resolve_thread(ctx, raw)? else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    match ctx.process.suspend_thread(tid) {
        Ok(previous) => {
            ctx.write_u32_opt(previous_ptr, previous)?;
            if tid == ctx.current_tid()? {
                *ctx.switch_pending = true;
            }
            Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
        }
        Err(_) => Ok(SyscallOutcome::Complete(NtStatus::THREAD_IS_TERMINATING)),
    }
}

/// `NtResumeThread(Handle, *PreviousSuspendCount)`
pub fn nt_resume_thread(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let previous_ptr = ctx.arg(1);

    let Some(tid) = resolve_thread(ctx, raw)? else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    match ctx.process.resume_thread(tid) {
        Ok(previous) => {
            ctx.write_u32_opt(previous_ptr, previous)?;
            Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
        }
        Err(_) => Ok(SyscallOutcome::Complete(NtStatus::THREAD_IS_TERMINATING)),
    }
}

/// `NtDelayExecution(Alertable, *Interval)`
pub fn nt_delay_execution(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let alertable = ctx.arg(0) != 0;
    let interval_ptr = ctx.arg(1);

    if interval_ptr == 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let timeout = ctx.timeout(interval_ptr)?;
    if timeout == TimeoutArg::Immediate {
        // A zero-length delay degrades to a voluntary yield.
        *ctx.switch_pending = true;
        return Ok(SyscallOutcome::Complete(NtStatus::SUCCESS));
    }
    wait_on_objects(ctx, Vec::new(), WaitKind::Any, alertable, timeout)
}

/// `NtYieldExecution()`
pub fn nt_yield_execution(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let has_other_runnable = {
        let process = &ctx.process;
        process
            .ready_queue
            .iter()
            .any(|tid| process.threads.get(tid).is_some_and(|t| t.is_runnable()))
    };
    if has_other_runnable {
        *ctx.switch_pending = true;
        Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
    } else {
        Ok(SyscallOutcome::Complete(NtStatus::NO_YIELD_PERFORMED))
    }
}

/// `NtQueueApcThread(Handle, ApcRoutine, Argument1, Argument2, Argument3)`
pub fn nt_queue_apc_thread(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let routine = ctx.arg(1);
    let argument1 = ctx.arg(2);
    let argument2 = ctx.arg(3);
    let argument3 = ctx.arg(4);

    let Some(tid) = resolve_thread(ctx, raw)? else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let Some(thread) = ctx.process.threads.get_mut(&tid) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    if thread.is_terminated() {
        return Ok(SyscallOutcome::Complete(NtStatus::THREAD_IS_TERMINATING));
    }
    thread.user_apcs.push_back(Apc {
        routine,
        argument1,
        argument2,
        argument3,
    });
    // Alertable waiters wake with STATUS_USER_APC.
    ctx.process.check_waits();
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtTestAlert()`
pub fn nt_test_alert(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let tid = ctx.current_tid()?;
    let thread = ctx
        .process
        .threads
        .get_mut(&tid)
        .expect("current thread exists");
    if thread.user_apcs.is_empty() {
        Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
    } else {
        // Delivery drains the queue; the runtime's dispatcher in the guest picks
        // the routines up through the alert status.
        thread.user_apcs.clear();
        Ok(SyscallOutcome::Complete(NtStatus::ALERTED))
    }
}

/// `NtQueryInformationThread(Handle, InfoClass, Buffer, Length, *ReturnLength)`
pub fn nt_query_information_thread(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let info_class = ctx.arg(1);
    let buffer = ctx.arg(2);
    let length = ctx.arg(3);
    let return_length = ctx.arg(4);

    let Some(tid) = resolve_thread(ctx, raw)? else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    if info_class != 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_INFO_CLASS));
    }
    // THREAD_BASIC_INFORMATION
    if length < 0x30 {
        return Ok(SyscallOutcome::Complete(NtStatus::INFO_LENGTH_MISMATCH));
    }
    let (teb, affinity, priority, exit_code) = {
        let thread = ctx.process.threads.get(&tid).expect("resolved above");
        (
            thread.teb,
            thread.affinity,
            thread.priority,
            thread.exit_code,
        )
    };
    ctx.write_u32(buffer, exit_code.unwrap_or(0x103))?; // STATUS_PENDING while alive
    ctx.write_u32(buffer + 0x04, 0)?;
    ctx.write_u64(buffer + 0x08, teb)?;
    ctx.write_u64(buffer + 0x10, crate::process::EMULATED_PID)?;
    ctx.write_u64(buffer + 0x18, u64::from(tid))?;
    ctx.write_u64(buffer + 0x20, affinity)?;
    ctx.write_u32(buffer + 0x28, priority as u32)?;
    ctx.write_u32(buffer + 0x2C, priority as u32)?;
    ctx.write_u64_opt(return_length, 0x30)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}
