//! Process-level and system-information services.

use crate::{
    cpu::{CpuEngine, X64Register},
    process::{Handle, WaitState, EMULATED_PID},
    syscalls::{NtStatus, SyscallContext, SyscallOutcome},
    Result,
};

/// Steady-clock tick rate reported through `NtQueryPerformanceCounter` (100ns).
const PERFORMANCE_FREQUENCY: u64 = 10_000_000;

/// x64 `CONTEXT` field offsets used by exception dispatch and `NtContinue`.
pub mod context_layout {
    /// `ContextFlags`.
    pub const FLAGS: u64 = 0x30;
    /// `MxCsr`.
    pub const MXCSR: u64 = 0x34;
    /// `EFlags`.
    pub const EFLAGS: u64 = 0x44;
    /// `Rax`; the integer file continues in the canonical order through `R15`.
    pub const RAX: u64 = 0x78;
    /// `Rip`.
    pub const RIP: u64 = 0xF8;
    /// Total structure size.
    pub const SIZE: u64 = 0x4D0;
}

/// Integer register order inside the x64 `CONTEXT` structure starting at
/// [`context_layout::RAX`].
pub const CONTEXT_GPR_ORDER: [X64Register; 16] = [
    X64Register::Rax,
    X64Register::Rcx,
    X64Register::Rdx,
    X64Register::Rbx,
    X64Register::Rsp,
    X64Register::Rbp,
    X64Register::Rsi,
    X64Register::Rdi,
    X64Register::R8,
    X64Register::R9,
    X64Register::R10,
    X64Register::R11,
    X64Register::R12,
    X64Register::R13,
    X64Register::R14,
    X64Register::R15,
];

/// `NtTerminateProcess(Handle, ExitStatus)`
pub fn nt_terminate_process(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let exit_status = ctx.arg(1) as u32;

    // Handle 0 terminates all threads of the caller; the pseudo-handle the whole
    // process. Either way the emulated process is over.
    if raw != 0 && raw != Handle::CURRENT_PROCESS {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    }
    for thread in ctx.process.threads.values_mut() {
        if !thread.is_terminated() {
            thread.state = WaitState::Terminated;
            thread.wait = None;
            thread.exit_code.get_or_insert(exit_status);
        }
    }
    ctx.process.ready_queue.clear();
    ctx.process.exit_status = Some(exit_status);
    Ok(SyscallOutcome::Exit(exit_status))
}

/// `NtQueryInformationProcess(Handle, InfoClass, Buffer, Length, *ReturnLength)`
pub fn nt_query_information_process(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let raw = ctx.arg(0);
    let info_class = ctx.arg(1);
    let buffer = ctx.arg(2);
    let length = ctx.arg(3);
    let return_length = ctx.arg(4);

    if raw != Handle::CURRENT_PROCESS {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_HANDLE));
    }
    if info_class != 0 {
        return Ok(SyscallOutcome::Complete(NtStatus::INVALID_INFO_CLASS));
    }
    // PROCESS_BASIC_INFORMATION
    if length < 0x30 {
        return Ok(SyscallOutcome::Complete(NtStatus::INFO_LENGTH_MISMATCH));
    }
    let exit_status = ctx.process.exit_status.unwrap_or(0x103);
    ctx.write_u32(buffer, exit_status)?;
    ctx.write_u32(buffer + 0x04, 0)?;
    ctx.write_u64(buffer + 0x08, ctx.process.peb)?;
    ctx.write_u64(buffer + 0x10, 1)?; // AffinityMask
    ctx.write_u32(buffer + 0x18, 8)?; // BasePriority
    ctx.write_u32(buffer + 0x1C, 0)?;
    ctx.write_u64(buffer + 0x20, EMULATED_PID)?;
    ctx.write_u64(buffer + 0x28, 0)?; // InheritedFromUniqueProcessId
    ctx.write_u64_opt(return_length, 0x30)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtQueryPerformanceCounter(*Counter, *Frequency)`
pub fn nt_query_performance_counter(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let counter_ptr = ctx.arg(0);
    let frequency_ptr = ctx.arg(1);

    let counter = ctx.process.clocks.steady_time();
    ctx.write_u64(counter_ptr, counter)?;
    ctx.write_u64_opt(frequency_ptr, PERFORMANCE_FREQUENCY)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtQuerySystemTime(*SystemTime)`
pub fn nt_query_system_time(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let time_ptr = ctx.arg(0);
    let now = ctx.process.clocks.system_time();
    ctx.write_u64(time_ptr, now)?;
    Ok(SyscallOutcome::Complete(NtStatus::SUCCESS))
}

/// `NtRaiseException(*ExceptionRecord, *Context, FirstChance)`
pub fn nt_raise_exception(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let record_ptr = ctx.arg(0);

    // EXCEPTION_RECORD: code at +0, address at +0x10.
    let code = ctx.read_u32(record_ptr)?;
    let address = ctx.read_u64(record_ptr + 0x10)?;
    Ok(SyscallOutcome::Raise {
        code: NtStatus(code),
        address,
    })
}

/// `NtContinue(*Context, TestAlert)`
///
/// Replaces the caller's register file from a guest `CONTEXT` structure. The
/// dispatcher leaves RAX and RIP untouched afterwards.
pub fn nt_continue(ctx: &mut SyscallContext<'_>) -> Result<SyscallOutcome> {
    let context_ptr = ctx.arg(0);

    for (index, reg) in CONTEXT_GPR_ORDER.iter().enumerate() {
        let value = ctx.read_u64(context_ptr + context_layout::RAX + index as u64 * 8)?;
        ctx.cpu.write_u64(*reg, value);
    }
    let rip = ctx.read_u64(context_ptr + context_layout::RIP)?;
    ctx.cpu.write_u64(X64Register::Rip, rip);
    let eflags = ctx.read_u32(context_ptr + context_layout::EFLAGS)?;
    ctx.cpu.write_u64(X64Register::Rflags, u64::from(eflags));
    let mxcsr = ctx.read_u32(context_ptr + context_layout::MXCSR)?;
    ctx.cpu
        .write_reg(X64Register::Mxcsr, &mxcsr.to_le_bytes());

    Ok(SyscallOutcome::Continue)
}
