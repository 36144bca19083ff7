#![doc(html_no_source)]
#![deny(missing_docs)]

//! # ntcradle
//!
//! A user-mode emulator that executes unmodified Windows x86-64 application binaries on a
//! foreign host operating system. `ntcradle` drives an external CPU emulation engine and
//! synthesizes the NT user-mode environment around it: virtual memory with NT
//! reserve/commit semantics, PE module loading with import binding, threads with
//! cooperative scheduling, kernel objects behind a generation-counted handle table, the
//! registry and filesystem views, and the system-call surface user code actually reaches.
//!
//! # Architecture
//!
//! The crate is organized into the subsystems of an emulated NT kernel:
//!
//! - **CPU seam** ([`crate::cpu`]): the [`CpuEngine`] trait the external engine
//!   implements, with execution reported back as [`CpuExit`] events
//! - **Memory manager** ([`crate::memory`]): the authoritative region map, mirrored into
//!   the engine's page tables
//! - **Module manager** ([`crate::module`]): PE parsing, mapping, relocation, import
//!   binding and stub trampolines
//! - **Process context** ([`crate::process`]): threads, TEB/PEB, kernel objects, handles,
//!   virtual clocks and the cooperative scheduler
//! - **Syscall dispatcher** ([`crate::syscalls`]): service table, Win64 argument
//!   decoding, NTSTATUS marshaling
//! - **Facade** ([`crate::emulator`]): world construction, the run loop, snapshots and
//!   callbacks
//!
//! # Usage
//!
//! ```rust,ignore
//! use ntcradle::prelude::*;
//!
//! let settings = EmulatorSettings {
//!     emulation_root: "/srv/win-root".into(),
//!     use_relative_time: true,
//!     ..Default::default()
//! };
//! let mut emulator = Emulator::new(settings, make_cpu_engine());
//! emulator.callbacks.on_stdout = Some(Box::new(|bytes| {
//!     print!("{}", String::from_utf8_lossy(bytes));
//! }));
//!
//! emulator.load_application(&ApplicationSettings {
//!     application: r"C:\app\hello.exe".to_string(),
//!     ..Default::default()
//! })?;
//!
//! match emulator.start(None, 0)? {
//!     EmulationOutcome::Exited(code) => println!("guest exited with {code:#x}"),
//!     other => println!("run ended: {other:?}"),
//! }
//! # Ok::<(), ntcradle::Error>(())
//! ```
//!
//! # Determinism
//!
//! With `use_relative_time` enabled, virtual clocks advance from the retired-instruction
//! count and the scheduler is deterministic for a fixed instruction quantum: a run can be
//! reproduced exactly, and [`Emulator::save_snapshot`] / [`Emulator::restore_snapshot`]
//! are an identity on the complete observable state.
//!
//! # Scope
//!
//! The CPU engine itself, the CLI, the debugger frontend and fuzzing harnesses live
//! outside this crate; `ntcradle` targets NT service behavior observable to ordinary
//! user code, not kernel-mode or hardware emulation.

pub(crate) mod error;

pub mod cpu;
pub mod emulator;
pub mod memory;
pub mod module;
pub mod prelude;
pub mod process;
pub mod snapshot;
pub mod syscalls;

#[cfg(test)]
pub(crate) mod test;

pub use error::Error;

pub use cpu::{AccessKind, CpuEngine, CpuExit, CpuStep, X64Register};
pub use emulator::{
    ApplicationSettings, EmulationOutcome, Emulator, EmulatorCallbacks, EmulatorSettings,
    SyscallVerdict,
};
pub use syscalls::NtStatus;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
