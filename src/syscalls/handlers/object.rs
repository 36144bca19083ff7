//! Synchronization object services: events, mutants, semaphores, timers, waits,
//! handle closing and duplication.

use crate::{
    process::{
        EventObject, Handle, KernelObject, MutantObject, SemaphoreObject, TimerObject, WaitKind,
    },
    syscalls::{handlers::wait_on_objects, NtStatus, SyscallContext, SyscallOutcome, TimeoutArg},
    Result,
};

/// `EVENT_ALL_ACCESS`, granted to every created object handle.
const DEFAULT_ACCESS: u32 = 0x1F_0003;

/// `MAXIMUM_WAIT_OBJECTS`.
const MAX_WAIT_OBJECTS: u64 = 64;

/// `NtCreateEvent(*Handle, Access, ObjectAttributes, EventType, InitialState)`
pub fn nt_create_event(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let handle_ptr = ctx.arg(0);
    let access = ctx.arg(1) as u32;
    let event_type = ctx.arg(3);
    let initial_state = ctx.arg(4);

    // EVENT_TYPE: 0 = NotificationEvent, 1 = SynchronizationEvent.
    if event_type > 1 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let handle = ctx.process.insert_object(
        KernelObject::Event(EventObject {
            manual_reset: event_type == 0,
            signaled: initial_state != 0,
        }),
        if access == 0 { DEFAULT_ACCESS } else { access },
        false,
    );
    ctx.write_u64(handle_ptr, u64::from(handle.raw()))?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

fn with_event(
    ctx: &mut SyscallContext<'_>,
    raw: u64,
    apply: impl FnOnce(&mut EventObject) -> u32,
) -> Result<(NtStatus, u32)> {
    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok((NtStatus::INVALID_HANDLE, 0));
    };
    let object = entry.object;
    match ctx.process.objects.get_mut(object) {
        Some(KernelObject::Event(event)) => {
            let previous = apply(event);
            ctx.process.check_waits();
            Ok((NtStatus::SUCCESS, previous))
        }
        Some(_) => Ok((NtStatus::OBJECT_TYPE_MISMATCH, 0)),
        None => Ok((NtStatus::INVALID_HANDLE, 0)),
    }
}

/// `NtSetEvent(Handle, *PreviousState)`
pub fn nt_set_event(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let previous_ptr = ctx.arg(1);
    let (status, previous) = with_event(ctx, raw, |event| {
        let previous = u32::from(event.signaled);
        event.signaled = true;
        previous
    })?;
    if status == NtStatus::SUCCESS {
        ctx.write_u32_opt(previous_ptr, previous)?;
    }
    Ok(SyscallOutcome::Complete(status))
}

/// `NtResetEvent(Handle, *PreviousState)`
pub fn nt_reset_event(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let previous_ptr = ctx.arg(1);
    let (status, previous) = with_event(ctx, raw, |event| {
        let previous = u32::from(event.signaled);
        event.signaled = false;
        previous
    })?;
    if status == NtStatus::SUCCESS {
        ctx.write_u32_opt(previous_ptr, previous)?;
    }
    Ok(SyscallOutcome::Complete(status))
}

/// `NtClearEvent(Handle)`
pub fn nt_clear_event(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let (status, _) = with_event(ctx, raw, |event| {
        event.signaled = false;
        0
    })?;
    Ok(SyscallOutcome::Complete(status))
}

/// `NtPulseEvent(Handle, *PreviousState)`
///
/// Releases current waiters, then leaves the event unsignaled.
pub fn nt_pulse_event(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let previous_ptr = ctx.arg(1);
    let (status, previous) = with_event(ctx, raw, |event| {
        let previous = u32::from(event.signaled);
        event.signaled = true;
        previous
    })?;
    if status != NtStatus::SUCCESS {
        return Ok(SyscallOutcome::Complete(status));
    }
    // The wake pass ran inside with_event; drop the signal again.
    let entry = ctx.handle_entry(raw).expect("validated above");
    let object = entry.object;
    if let Some(KernelObject::Event(event)) = ctx.process.objects.get_mut(object) {
        event.signaled = false;
    }
    ctx.write_u32_opt(previous_ptr, previous)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtQueryEvent(Handle, InfoClass, Buffer, Length, *ReturnLength)`
pub fn nt_query_event(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let info_class = ctx.arg(1);
    let buffer = ctx.arg(2);
    let length = ctx.arg(3);
    let return_length = ctx.arg(4);

    if info_class != 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_INFO_CLASS));
    }
    if length < 8 {
        return Ok(SyscallOutcome::Complete(NtStatus::INFO_LENGTH_MISMATCH));
    }
    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let Some(KernelObject::Event(event)) = ctx.process.objects.get(entry.object) else {
        return Ok(SyscallOutcome::Complete(NtStatus::OBJECT_TYPE_MISMATCH));
    };
    let (event_type, state) = (u32::from(!event.manual_reset), u32::from(event.signaled));
    ctx.write_u32(buffer, event_type)?;
    ctx.write_u32(buffer + 4, state)?;
    ctx.write_u64_opt(return_length, 8)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtCreateMutant(*Handle, Access, ObjectAttributes, InitialOwner)`
pub fn nt_create_mutant(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let handle_ptr = ctx.arg(0);
    let access = ctx.arg(1) as u32;
    let initial_owner = ctx.arg(3);

    let owner = if initial_owner != 0 {
        Some(ctx.current_tid()?)
    } else {
        None
    };
    let handle = ctx.process.insert_object(
        KernelObject::Mutant(MutantObject {
            owner,
            recursion: u32::from(owner.is_some()),
            abandoned: false,
        }),
        if access == 0 { DEFAULT_ACCESS } else { access },
        false,
    );
    ctx.write_u64(handle_ptr, u64::from(handle.raw()))?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtReleaseMutant(Handle, *PreviousCount)`
pub fn nt_release_mutant(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let previous_ptr = ctx.arg(1);
    let tid = ctx.current_tid()?;

    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let object = entry.object;
    let status = match ctx.process.objects.get_mut(object) {
        Some(KernelObject::Mutant(mutant)) => match mutant.release(tid) {
            Some(previous) => {
                ctx.write_u32_opt(previous_ptr, previous)?;
                ctx.process.check_waits();
                NtStatus::SUCCESS
            }
            None => NtStatus::MUTANT_NOT_OWNED,
        },
        Some(_) => NtStatus::OBJECT_TYPE_MISMATCH,
        None => NtStatus::INVALID_HANDLE,
    };
    Ok(SyscallOutcome::Complete(status))
}

/// `NtCreateSemaphore(*Handle, Access, ObjectAttributes, InitialCount, MaximumCount)`
pub fn nt_create_semaphore(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let handle_ptr = ctx.arg(0);
    let access = ctx.arg(1) as u32;
    let initial = ctx.arg(3) as i64;
    let maximum = ctx.arg(4) as i64;

    if maximum <= 0 || initial < 0 || initial > maximum {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let handle = ctx.process.insert_object(
        KernelObject::Semaphore(SemaphoreObject {
            count: initial as u32,
            maximum: maximum as u32,
        }),
        if access == 0 { DEFAULT_ACCESS } else { access },
        false,
    );
    ctx.write_u64(handle_ptr, u64::from(handle.raw()))?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtReleaseSemaphore(Handle, ReleaseCount, *PreviousCount)`
pub fn nt_release_semaphore(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let release_count = ctx.arg(1) as u32;
    let previous_ptr = ctx.arg(2);

    if release_count == 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let object = entry.object;
    let status = match ctx.process.objects.get_mut(object) {
        Some(KernelObject::Semaphore(semaphore)) => {
            let exceeded = semaphore
                .count
                .checked_add(release_count)
                .is_none_or(|total| total > semaphore.maximum);
            if exceeded {
                NtStatus::SEMAPHORE_LIMIT_EXCEEDED
            } else {
                let previous = semaphore.count;
                semaphore.count += release_count;
                ctx.write_u32_opt(previous_ptr, previous)?;
                ctx.process.check_waits();
                NtStatus::SUCCESS
            }
        }
        Some(_) => NtStatus::OBJECT_TYPE_MISMATCH,
        None => NtStatus::INVALID_HANDLE,
    };
    Ok(SyscallOutcome::Complete(status))
}

/// `NtCreateTimer(*Handle, Access, ObjectAttributes, TimerType)`
pub fn nt_create_timer(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let handle_ptr = ctx.arg(0);
    let access = ctx.arg(1) as u32;
    let timer_type = ctx.arg(3);

    if timer_type > 1 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let handle = ctx.process.insert_object(
        KernelObject::Timer(TimerObject {
            manual_reset: timer_type == 0,
            signaled: false,
            due_time: None,
        }),
        if access == 0 { DEFAULT_ACCESS } else { access },
        false,
    );
    ctx.write_u64(handle_ptr, u64::from(handle.raw()))?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtSetTimer(Handle, *DueTime, ApcRoutine, ApcContext, Resume, Period, *PreviousState)`
pub fn nt_set_timer(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let due_ptr = ctx.arg(1);
    let previous_ptr = ctx.arg(6);

    if due_ptr == 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }
    let due = match ctx.timeout(due_ptr)? {
        TimeoutArg::Infinite => None,
        TimeoutArg::Immediate => Some(ctx.process.clocks.steady_time()),
        TimeoutArg::Deadline(deadline) => Some(deadline),
    };

    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let object = entry.object;
    let status = match ctx.process.objects.get_mut(object) {
        Some(KernelObject::Timer(timer)) => {
            let previous = u32::from(timer.signaled);
            timer.signaled = false;
            timer.due_time = due;
            ctx.write_u32_opt(previous_ptr, previous)?;
            ctx.process.check_waits();
            NtStatus::SUCCESS
        }
        Some(_) => NtStatus::OBJECT_TYPE_MISMATCH,
        None => NtStatus::INVALID_HANDLE,
    };
    Ok(SyscallOutcome::Complete(status))
}

/// `NtCancelTimer(Handle, *CurrentState)`
pub fn nt_cancel_timer(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let state_ptr = ctx.arg(1);

    let Some(entry) = ctx.handle_entry(raw) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let object = entry.object;
    let status = match ctx.process.objects.get_mut(object) {
        Some(KernelObject::Timer(timer)) => {
            let state = u32::from(timer.signaled);
            timer.due_time = None;
            ctx.write_u32_opt(state_ptr, state)?;
            NtStatus::SUCCESS
        }
        Some(_) => NtStatus::OBJECT_TYPE_MISMATCH,
        None => NtStatus::INVALID_HANDLE,
    };
    Ok(SyscallOutcome::Complete(status))
}

/// `NtWaitForSingleObject(Handle, Alertable, *Timeout)`
pub fn nt_wait_for_single_object(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let alertable = ctx.arg(1) != 0;
    let timeout_ptr = ctx.arg(2);

    let Some(object) = ctx.waitable_object(raw)? else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let timeout = ctx.timeout(timeout_ptr)?;
    wait_on_objects(ctx, vec![object], WaitKind::Any, alertable, timeout)
}

/// `NtWaitForMultipleObjects(Count, *Handles, WaitType, Alertable, *Timeout)`
pub fn nt_wait_for_multiple_objects(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let count = ctx.arg(0);
    let handles_ptr = ctx.arg(1);
    let wait_type = ctx.arg(2);
    let alertable = ctx.arg(3) != 0;
    let timeout_ptr = ctx.arg(4);

    if count == 0 || count > MAX_WAIT_OBJECTS || wait_type > 1 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_PARAMETER));
    }

    let mut objects = Vec::with_capacity(count as usize);
    for index in 0..count {
        let raw = ctx.read_u64(handles_ptr + index * 8)?;
        let Some(object) = ctx.waitable_object(raw)? else {
            return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
        };
        objects.push(object);
    }

    // WAIT_TYPE: 0 = WaitAll, 1 = WaitAny.
    let kind = if wait_type == 0 {
        WaitKind::All
    } else {
        WaitKind::Any
    };
    let timeout = ctx.timeout(timeout_ptr)?;
    wait_on_objects(ctx, objects, kind, alertable, timeout)
}

/// `NtClose(Handle)`
pub fn nt_close(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let status = if ctx.process.close_handle(raw) {
        NtStatus::SUCCESS
    } else {
        NtStatus::INVALID_HANDLE
    };
    Ok(SyscallOutcome::Complete(status))
}

/// `NtDuplicateObject(SrcProcess, SrcHandle, DstProcess, *DstHandle, Access, Attributes, Options)`
pub fn nt_duplicate_object(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let source_process = ctx.arg(0);
    let source_handle = ctx.arg(1);
    let target_process = ctx.arg(2);
    let target_ptr = ctx.arg(3);
    let access = ctx.arg(4) as u32;

    if source_process != Handle::CURRENT_PROCESS || target_process != Handle::CURRENT_PROCESS {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    }
    let Some(entry) = ctx.handle_entry(source_handle) else {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    };
    let (object, ty, inherited_access, inherit) =
        (entry.object, entry.ty, entry.access, entry.inherit);

    ctx.process.objects.add_ref(object);
    let duplicated = ctx.process.handles.insert(
        object,
        ty,
        if access == 0 { inherited_access } else { access },
        inherit,
    );
    ctx.write_u64(target_ptr, u64::from(duplicated.raw()))?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}
