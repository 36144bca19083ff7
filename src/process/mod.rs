//! The process context: threads, kernel objects, handles, clocks and scheduling.
//!
//! This module models one running NT process:
//!
//! - [`ProcessContext`] - the singleton owner of all per-process state
//! - [`EmulatedThread`] - register blobs, stacks, TEBs, waits, APCs
//! - [`KernelObject`] / [`ObjectTable`] - the tagged object arena
//! - [`Handle`] / [`HandleTable`] - generation-counted handle values
//! - [`ProcessClocks`] - wall + steady virtual clocks (host or relative time)
//! - cooperative round-robin scheduling with deadline fast-forward and deadlock
//!   detection ([`ScheduleDecision`])

mod clock;
mod context;
mod handle;
mod object;
mod scheduler;
mod thread;

pub use clock::ProcessClocks;
pub use context::{
    peb, process_params, teb, ProcessContext, DEFAULT_STACK_SIZE, EMULATED_PID,
};
pub use handle::{Handle, HandleEntry, HandleTable, HandleType};
pub use object::{
    EventObject, FileBacking, FileObject, KernelObject, MutantObject, ObjectEntry, ObjectId,
    ObjectTable, SectionObject, SemaphoreObject, TimerObject,
};
pub use scheduler::ScheduleDecision;
pub use thread::{Apc, EmulatedThread, WaitKind, WaitRequest, WaitState};
