//! Implementations of the emulated NT system services.
//!
//! Every handler is a plain function from [`SyscallContext`] to a
//! [`SyscallOutcome`]; the service table wires them to their service numbers.
//! Handlers are free to read and write guest memory through the validated
//! accessors, allocate handles, record waits and request thread switches.

pub mod io;
pub mod memory;
pub mod object;
pub mod process;
pub mod thread;

use crate::{
    process::{ObjectId, WaitKind, WaitRequest, WaitState},
    syscalls::{NtStatus, SyscallContext, SyscallOutcome, TimeoutArg},
    Result,
};

/// Shared wait path for `NtWaitForSingleObject`, `NtWaitForMultipleObjects` and
/// `NtDelayExecution`.
///
/// The wait request is recorded on the current thread and re-evaluated once. A
/// wait that is immediately satisfiable (or polls with a zero timeout) completes
/// without a thread switch; anything else deschedules the caller.
pub(crate) fn wait_on_objects(
    ctx: &mut SyscallContext<'_>,
    objects: Vec<ObjectId>,
    kind: WaitKind,
    alertable: bool,
    timeout: TimeoutArg,
) -> Result<SyscallOutcome> {
    let tid = ctx.current_tid()?;

    let deadline = match timeout {
        TimeoutArg::Infinite => None,
        // A zero timeout is an already-expired deadline: the evaluation pass
        // below completes it with STATUS_TIMEOUT (or the signaled result)
        // without ever blocking.
        TimeoutArg::Immediate => Some(ctx.process.clocks.steady_time()),
        TimeoutArg::Deadline(deadline) => Some(deadline),
    };

    ctx.process.begin_wait(
        tid,
        WaitRequest {
            objects,
            kind,
            deadline,
            alertable,
        },
    );
    ctx.process.check_waits();

    let thread = ctx
        .process
        .threads
        .get_mut(&tid)
        .expect("current thread exists");
    if thread.state == WaitState::Runnable {
        // Completed inline; the thread keeps running, so take the status back
        // out of the switch-in slot and return it directly.
        let status = thread.pending_status.take().unwrap_or(NtStatus::SUCCESS);
        ctx.process.ready_queue.retain(|queued| *queued != tid);
        Ok(SyscallOutcome::Complete(status))
    } else {
        *ctx.switch_pending = true;
        Ok(SyscallOutcome::Pending)
    }
}
