//! The syscall dispatcher: the boundary between guest code and the emulated kernel.
//!
//! The CPU engine stops at every retired `syscall` instruction; the dispatcher then
//! classifies the site (stub trampoline vs. real service), decodes the service
//! number from RAX and the arguments per the Win64 convention, routes to the
//! handler, writes the resulting NTSTATUS back into RAX and advances RIP past the
//! instruction. Handlers that record a wait return [`SyscallOutcome::Pending`] and
//! the thread is descheduled instead of resumed.
//!
//! Unknown service numbers and stub-trampoline intercepts are reported through the
//! `on_syscall` callback, whose verdict decides between continuing with success,
//! skipping with a caller-chosen status, or aborting emulation.

mod context;
mod status;
mod table;

pub mod handlers;

pub use context::{SyscallContext, SyscallOutcome, TimeoutArg};
pub use status::NtStatus;
pub use table::{ServiceTable, SyscallEntry, SyscallHandler};

use crate::{
    cpu::{CpuEngine, X64Register},
    emulator::SyscallVerdict,
    Error, Result,
};

/// Length of the `syscall` instruction, skipped after dispatch.
const SYSCALL_LENGTH: u64 = 2;

/// Sentinel service id reported to `on_syscall` for stub-trampoline intercepts,
/// where no service number was involved.
pub const STUB_SERVICE_ID: u32 = u32::MAX;

/// What the dispatcher did with one intercepted `syscall`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// The service completed; the guest resumes after the instruction.
    Completed(NtStatus),
    /// The calling thread was descheduled; a switch must happen before resuming.
    Descheduled,
    /// The process terminated with this exit status.
    ProcessExit(u32),
    /// An exception must be raised into the calling thread.
    RaiseException {
        /// Exception code.
        code: NtStatus,
        /// Address reported in the exception record.
        address: u64,
    },
}

/// Stateless router from intercepted `syscall` instructions to handlers.
#[derive(Debug)]
pub struct SyscallDispatcher {
    table: ServiceTable,
}

impl Default for SyscallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallDispatcher {
    /// Creates a dispatcher with the default service table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ServiceTable::windows_default(),
        }
    }

    /// Creates a dispatcher over a custom service table.
    #[must_use]
    pub fn with_table(table: ServiceTable) -> Self {
        Self { table }
    }

    /// Returns the service table.
    #[must_use]
    pub fn table(&self) -> &ServiceTable {
        &self.table
    }

    /// Returns the service table for registration.
    pub fn table_mut(&mut self) -> &mut ServiceTable {
        &mut self.table
    }

    /// Services one `syscall` exit reported by the engine.
    ///
    /// `verbose` enables per-call logging of the service name, decoded arguments
    /// and result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Engine`] when an `on_syscall` verdict aborts emulation,
    /// and propagates emulation errors from handlers. Guest faults raised by
    /// handlers are converted to `STATUS_ACCESS_VIOLATION` completions, never
    /// surfaced to the host.
    pub fn dispatch(
        &self,
        ctx: &mut SyscallContext<'_>,
        verbose: bool,
    ) -> Result<DispatchResult> {
        let rip = ctx.cpu.read_u64(X64Register::Rip);

        if ctx.modules.is_stub_address(rip) {
            return self.dispatch_stub(ctx, rip);
        }

        let id = ctx.cpu.read_u64(X64Register::Rax) as u32;
        let Some(entry) = self.table.get(id) else {
            return self.dispatch_unknown(ctx, id, rip);
        };

        if verbose {
            let mut rendered = String::new();
            for index in 0..entry.arity as usize {
                if index > 0 {
                    rendered.push_str(", ");
                }
                rendered.push_str(&format!("{:#x}", ctx.arg(index)));
            }
            log::debug!("{}({rendered})", entry.name);
        }

        let outcome = match (entry.handler)(ctx) {
            Ok(outcome) => outcome,
            // A bad guest pointer inside a handler is the guest's problem.
            Err(Error::GuestFault { .. }) | Err(Error::InvalidAddress { .. }) => {
                SyscallOutcome::Complete(NtStatus::ACCESS_VIOLATION)
            }
            Err(error) => return Err(error),
        };

        match outcome {
            SyscallOutcome::Complete(status) => {
                if verbose {
                    log::debug!("{} -> {status}", entry.name);
                }
                self.complete(ctx, rip, status);
                Ok(DispatchResult::Completed(status))
            }
            SyscallOutcome::Pending => {
                // The wait result lands in RAX when the thread switches back in;
                // RIP must already point past the syscall by then.
                ctx.cpu.write_u64(X64Register::Rip, rip + SYSCALL_LENGTH);
                if verbose {
                    log::debug!("{} -> pending (thread descheduled)", entry.name);
                }
                Ok(DispatchResult::Descheduled)
            }
            SyscallOutcome::Exit(code) => {
                if verbose {
                    log::debug!("{} -> process exit {code:#x}", entry.name);
                }
                Ok(DispatchResult::ProcessExit(code))
            }
            SyscallOutcome::Raise { code, address } => {
                ctx.cpu.write_u64(X64Register::Rip, rip + SYSCALL_LENGTH);
                Ok(DispatchResult::RaiseException { code, address })
            }
            SyscallOutcome::Continue => {
                // NtContinue installed a complete register file; leave it alone.
                Ok(DispatchResult::Completed(NtStatus::SUCCESS))
            }
        }
    }

    /// Handles execution reaching a stub trampoline: reports the export through
    /// `on_syscall` and emulates the trampoline's `ret`.
    fn dispatch_stub(&self, ctx: &mut SyscallContext<'_>, rip: u64) -> Result<DispatchResult> {
        let (module, symbol) = match ctx.modules.stub_export(rip) {
            Some((module, symbol)) => (module.to_string(), symbol.to_string()),
            None => (String::new(), String::new()),
        };
        log::trace!("stub intercept {module}!{symbol} at {rip:#x}");

        let verdict = match ctx.callbacks.on_syscall.as_mut() {
            Some(on_syscall) => on_syscall(STUB_SERVICE_ID, rip, &module, &symbol),
            None => SyscallVerdict::Skip(NtStatus::NOT_IMPLEMENTED),
        };
        let status = match verdict {
            SyscallVerdict::Continue => NtStatus::SUCCESS,
            SyscallVerdict::Skip(status) => status,
            SyscallVerdict::Abort => {
                return Err(Error::Engine(format!(
                    "emulation aborted at stub {module}!{symbol}"
                )))
            }
        };

        // Emulate the trampoline's `ret`: pop the return address.
        let rsp = ctx.cpu.read_u64(X64Register::Rsp);
        let return_address = ctx.read_u64(rsp)?;
        ctx.cpu.write_u64(X64Register::Rsp, rsp + 8);
        ctx.cpu.write_u64(X64Register::Rip, return_address);
        ctx.cpu.write_u64(X64Register::Rax, u64::from(status.0));
        Ok(DispatchResult::Completed(status))
    }

    /// Handles a service number missing from the table.
    fn dispatch_unknown(
        &self,
        ctx: &mut SyscallContext<'_>,
        id: u32,
        rip: u64,
    ) -> Result<DispatchResult> {
        let module = ctx
            .modules
            .get_by_address(rip)
            .map(|module| module.name.clone())
            .unwrap_or_default();
        log::warn!("unknown syscall {id:#x} at {rip:#x} ({module})");

        let verdict = match ctx.callbacks.on_syscall.as_mut() {
            Some(on_syscall) => on_syscall(id, rip, &module, ""),
            None => SyscallVerdict::Skip(NtStatus::NOT_IMPLEMENTED),
        };
        let status = match verdict {
            SyscallVerdict::Continue => NtStatus::SUCCESS,
            SyscallVerdict::Skip(status) => status,
            SyscallVerdict::Abort => {
                return Err(Error::Engine(format!("emulation aborted at syscall {id:#x}")))
            }
        };
        self.complete(ctx, rip, status);
        Ok(DispatchResult::Completed(status))
    }

    /// Writes the status to RAX and steps past the `syscall` instruction.
    fn complete(&self, ctx: &mut SyscallContext<'_>, rip: u64, status: NtStatus) {
        ctx.cpu.write_u64(X64Register::Rax, u64::from(status.0));
        ctx.cpu.write_u64(X64Register::Rip, rip + SYSCALL_LENGTH);
    }
}
