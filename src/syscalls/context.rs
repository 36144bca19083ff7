//! The dispatch context handed to syscall handlers.
//!
//! A [`SyscallContext`] borrows every subsystem a handler may touch: the CPU engine
//! for register access, the memory manager for validated guest pointers, the module
//! and process state, and the user callbacks. It also decodes arguments per the
//! Windows x86-64 syscall convention: the stub parks the first argument in R10
//! (`syscall` itself clobbers RCX), the next three ride in RDX, R8 and R9, and the
//! remainder live on the guest stack above the shadow space.
//!
//! Guest pointer accessors use guest access semantics, so a handler dereferencing a
//! bad pointer observes the fault and the dispatcher converts it into
//! `STATUS_ACCESS_VIOLATION`, as NT's probe-and-capture does.

use crate::{
    cpu::{CpuEngine, X64Register},
    emulator::EmulatorCallbacks,
    memory::MemoryManager,
    module::ModuleManager,
    process::{HandleEntry, ObjectId, ProcessContext},
    syscalls::NtStatus,
    Result,
};

/// How a timeout argument (`PLARGE_INTEGER`) decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutArg {
    /// Null pointer: wait forever.
    Infinite,
    /// Zero interval: poll; never block.
    Immediate,
    /// Wait until this steady-clock tick.
    Deadline(u64),
}

/// Borrowed view of the emulator a syscall handler operates on.
pub struct SyscallContext<'a> {
    /// The CPU engine executing the guest.
    pub cpu: &'a mut dyn CpuEngine,
    /// Guest virtual memory.
    pub memory: &'a mut MemoryManager,
    /// Mapped modules and stub trampolines.
    pub modules: &'a mut ModuleManager,
    /// The process model.
    pub process: &'a mut ProcessContext,
    /// User callbacks (`on_syscall`, `on_stdout`).
    pub callbacks: &'a mut EmulatorCallbacks,
    /// Buffered stdout sink used when `buffer_stdout` is set.
    pub stdout_buffer: &'a mut Vec<u8>,
    /// Whether stdout is buffered instead of delivered through the callback.
    pub buffer_stdout: bool,
    /// Set by handlers that want the scheduler to switch before re-entering the
    /// current thread.
    pub switch_pending: &'a mut bool,
}

impl SyscallContext<'_> {
    /// Returns syscall argument `index` decoded per the Win64 convention.
    pub fn arg(&mut self, index: usize) -> u64 {
        match index {
            0 => self.cpu.read_u64(X64Register::R10),
            1 => self.cpu.read_u64(X64Register::Rdx),
            2 => self.cpu.read_u64(X64Register::R8),
            3 => self.cpu.read_u64(X64Register::R9),
            _ => {
                let rsp = self.cpu.read_u64(X64Register::Rsp);
                let slot = rsp + 0x28 + 8 * (index as u64 - 4);
                let mut buf = [0u8; 8];
                if self.memory.read(self.cpu, slot, &mut buf).is_err() {
                    return 0;
                }
                u64::from_le_bytes(buf)
            }
        }
    }

    /// Returns the TID of the thread issuing the syscall.
    pub fn current_tid(&self) -> Result<u32> {
        Ok(self.process.active_thread()?.id)
    }

    /// Reads a u32 through a guest pointer (protection validated).
    pub fn read_u32(&mut self, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.memory.read(self.cpu, address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a u64 through a guest pointer (protection validated).
    pub fn read_u64(&mut self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.memory.read(self.cpu, address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a u32 through a guest pointer (protection validated).
    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<()> {
        self.memory.write(self.cpu, address, &value.to_le_bytes())
    }

    /// Writes a u64 through a guest pointer (protection validated).
    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        self.memory.write(self.cpu, address, &value.to_le_bytes())
    }

    /// Writes a u64 through a guest pointer only if it is non-null.
    pub fn write_u64_opt(&mut self, address: u64, value: u64) -> Result<()> {
        if address != 0 {
            self.write_u64(address, value)?;
        }
        Ok(())
    }

    /// Writes a u32 through a guest pointer only if it is non-null.
    pub fn write_u32_opt(&mut self, address: u64, value: u32) -> Result<()> {
        if address != 0 {
            self.write_u32(address, value)?;
        }
        Ok(())
    }

    /// Resolves a guest handle value against the handle table (pseudo-handles are
    /// not table handles and return `None`).
    pub fn handle_entry(&self, raw: u64) -> Option<&HandleEntry> {
        self.process.resolve_handle(raw)
    }

    /// Resolves a handle value to a waitable object id, mapping the
    /// current-thread pseudo-handle to the active thread's object.
    pub fn waitable_object(&self, raw: u64) -> Result<Option<ObjectId>> {
        if raw == crate::process::Handle::CURRENT_THREAD {
            return Ok(Some(self.process.active_thread()?.object));
        }
        Ok(self.process.resolve_handle(raw).map(|entry| entry.object))
    }

    /// Decodes an optional `LARGE_INTEGER` timeout into a steady-clock deadline.
    ///
    /// Negative values are relative intervals in 100ns units; positive values are
    /// absolute wall-clock times; zero means poll.
    pub fn timeout(&mut self, pointer: u64) -> Result<TimeoutArg> {
        if pointer == 0 {
            return Ok(TimeoutArg::Infinite);
        }
        let raw = self.read_u64(pointer)? as i64;
        Ok(self.interval_to_deadline(raw))
    }

    /// Converts a raw `LARGE_INTEGER` interval into a deadline.
    pub fn interval_to_deadline(&self, raw: i64) -> TimeoutArg {
        if raw == 0 {
            return TimeoutArg::Immediate;
        }
        let steady_now = self.process.clocks.steady_time();
        if raw < 0 {
            TimeoutArg::Deadline(steady_now + raw.unsigned_abs())
        } else {
            let system_now = self.process.clocks.system_time();
            let delta = (raw as u64).saturating_sub(system_now);
            TimeoutArg::Deadline(steady_now + delta)
        }
    }

    /// Writes emitted stdout bytes to the configured sink.
    pub fn emit_stdout(&mut self, bytes: &[u8]) {
        if self.buffer_stdout {
            self.stdout_buffer.extend_from_slice(bytes);
        } else if let Some(on_stdout) = self.callbacks.on_stdout.as_mut() {
            on_stdout(bytes);
        }
    }
}

/// Result of one syscall handler invocation.
#[derive(Debug)]
pub enum SyscallOutcome {
    /// The service completed; write the status to RAX and resume the caller.
    Complete(NtStatus),
    /// The calling thread recorded a wait and must be descheduled; the completion
    /// status reaches RAX when the thread is switched back in.
    Pending,
    /// The process terminates with this exit status.
    Exit(u32),
    /// Raise an NT exception into the calling thread instead of returning.
    Raise {
        /// Exception code.
        code: NtStatus,
        /// Faulting/raising address reported in the exception record.
        address: u64,
    },
    /// `NtContinue`: the register file was replaced wholesale; neither RAX nor
    /// RIP may be touched by the dispatcher.
    Continue,
}
