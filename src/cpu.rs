//! The interface the emulator core requires from an external CPU emulation engine.
//!
//! The engine is a separate library (a JIT or interpreter for x86-64 guest code); this
//! crate only talks to it through the [`CpuEngine`] trait. The trait covers four concerns:
//!
//! - **Execution control**: [`CpuEngine::run`] executes up to N instructions and reports
//!   why it stopped as a [`CpuExit`]; [`CpuEngine::stop`] requests an early return.
//! - **Register access**: untyped, sized reads and writes via [`X64Register`] ids, plus
//!   an opaque, versioned blob of the complete register file for thread switching and
//!   snapshots.
//! - **Guest page tables**: map/unmap/protect operations the memory manager mirrors its
//!   committed set into.
//! - **Privileged memory access**: protection-bypassing reads and writes used by the
//!   kernel side.
//!
//! # Exit events instead of callbacks
//!
//! Engines that deliver hooks via callbacks (instruction executed, `syscall` retired,
//! access violation) are adapted by returning from `run` at the hook point with the
//! matching [`CpuExit`]. The emulator's run loop is the hook trampoline: it services the
//! exit and re-enters `run`. An instruction-count budget passed to `run` takes the place
//! of a per-instruction hook for quantum scheduling.

use crate::{memory::MemoryProtection, Result};

/// Identifies a guest register for untyped access through [`CpuEngine::read_reg`] and
/// [`CpuEngine::write_reg`].
///
/// The set covers what the emulated kernel itself needs: the integer file for syscall
/// argument decoding and thread setup, RIP/RFLAGS, segment selectors and the FS/GS base
/// registers for TEB addressing, and the SSE control word. Full FPU/SSE/AVX state moves
/// only through the opaque [`CpuEngine::save_registers`] blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum X64Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    FsBase,
    GsBase,
    Mxcsr,
}

impl X64Register {
    /// Returns the register width in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            X64Register::Cs
            | X64Register::Ss
            | X64Register::Ds
            | X64Register::Es
            | X64Register::Fs
            | X64Register::Gs => 2,
            X64Register::Mxcsr => 4,
            _ => 8,
        }
    }
}

/// The kind of memory access that caused a violation exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// A data read from a page without read permission (or an unmapped page).
    Read,
    /// A data write to a page without write permission (or an unmapped page).
    Write,
    /// An instruction fetch from a page without execute permission.
    Execute,
}

/// Why a [`CpuEngine::run`] call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuExit {
    /// The instruction budget passed to `run` was exhausted.
    InstructionLimit,

    /// The guest retired a `syscall` instruction. RIP still points at the
    /// `syscall`; the dispatcher advances it after writing the result.
    Syscall,

    /// The guest accessed memory in a way its page protection forbids.
    AccessViolation {
        /// The faulting guest virtual address.
        address: u64,
        /// What kind of access faulted.
        access: AccessKind,
    },

    /// A software interrupt or CPU exception other than a page fault
    /// (e.g. `int3`, `ud2`, divide error).
    Interrupt {
        /// The interrupt/exception vector number.
        vector: u8,
    },

    /// [`CpuEngine::stop`] was called while the engine was running.
    Stopped,

    /// The guest executed `hlt` or an equivalent terminal instruction.
    Halted,
}

/// The result of one [`CpuEngine::run`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuStep {
    /// Why execution stopped.
    pub exit: CpuExit,
    /// How many instructions actually retired during the call.
    pub executed: u64,
}

/// Operations the emulator core requires from the external CPU engine.
///
/// Implementations wrap a concrete backend. The core never assumes anything about the
/// backend beyond this contract, and the engine never calls back into the core; all
/// coordination happens through [`CpuExit`] values returned from [`run`](Self::run).
///
/// # Register blobs
///
/// [`save_registers`](Self::save_registers) captures the complete register file
/// (GPRs, RIP, RFLAGS, segments, FS/GS bases, FPU/SSE/AVX) as an opaque byte blob that
/// only the same engine implementation can interpret. The core stores blobs per thread
/// and inside snapshots; it never inspects them.
pub trait CpuEngine {
    /// Executes up to `max_instructions` guest instructions (0 means unlimited) and
    /// reports why execution stopped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Engine`] if the backend fails in a way that is not
    /// expressible as a [`CpuExit`].
    fn run(&mut self, max_instructions: u64) -> Result<CpuStep>;

    /// Requests that the current or next `run` call return [`CpuExit::Stopped`] at the
    /// next safe point.
    fn stop(&mut self);

    /// Reads a register into `buf`, returning the number of bytes written.
    ///
    /// `buf` may be shorter than the register; the low-order bytes are copied.
    fn read_reg(&mut self, reg: X64Register, buf: &mut [u8]) -> usize;

    /// Writes a register from `data`, returning the number of bytes consumed.
    ///
    /// `data` may be shorter than the register; the remaining high-order bytes
    /// are zeroed.
    fn write_reg(&mut self, reg: X64Register, data: &[u8]) -> usize;

    /// Captures the complete register file as an opaque, versioned blob.
    fn save_registers(&mut self) -> Vec<u8>;

    /// Restores a register file previously captured by
    /// [`save_registers`](Self::save_registers) on the same engine type.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Engine`] if the blob is malformed or from an
    /// incompatible engine version.
    fn restore_registers(&mut self, blob: &[u8]) -> Result<()>;

    /// Maps guest pages at `base` with the given protection. Returns `false` if the
    /// range overlaps an existing mapping.
    fn map_memory(&mut self, base: u64, size: u64, protection: MemoryProtection) -> bool;

    /// Unmaps guest pages at `base`. Returns `false` if the range is not mapped.
    fn unmap_memory(&mut self, base: u64, size: u64) -> bool;

    /// Changes the protection of mapped guest pages. Returns `false` if any page in
    /// the range is not mapped.
    fn protect_memory(&mut self, base: u64, size: u64, protection: MemoryProtection) -> bool;

    /// Reads guest memory, bypassing protection. Returns `false` if any byte of the
    /// range is unmapped.
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> bool;

    /// Writes guest memory, bypassing protection. Returns `false` if any byte of the
    /// range is unmapped.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> bool;

    /// Reads a register as a zero-extended 64-bit value.
    fn read_u64(&mut self, reg: X64Register) -> u64 {
        let mut buf = [0u8; 8];
        self.read_reg(reg, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Writes a register from a 64-bit value (truncated to the register width).
    fn write_u64(&mut self, reg: X64Register, value: u64) {
        self.write_reg(reg, &value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_sizes() {
        assert_eq!(X64Register::Rax.size(), 8);
        assert_eq!(X64Register::Rip.size(), 8);
        assert_eq!(X64Register::FsBase.size(), 8);
        assert_eq!(X64Register::Cs.size(), 2);
        assert_eq!(X64Register::Mxcsr.size(), 4);
    }
}
