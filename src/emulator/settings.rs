//! Emulator configuration and host callbacks.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::syscalls::NtStatus;

/// What an `on_syscall` callback decided about an intercepted service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallVerdict {
    /// Treat the service as handled successfully.
    Continue,
    /// Skip the service, returning this status to the guest.
    Skip(NtStatus),
    /// Abort emulation with an engine error.
    Abort,
}

/// Callback receiving intercepted syscalls: `(service_id, address, module, name)`.
///
/// For unknown service numbers `name` is empty and `service_id` is the raw RAX
/// value; for stub-trampoline intercepts `service_id` is
/// [`STUB_SERVICE_ID`](crate::syscalls::STUB_SERVICE_ID) and `module`/`name`
/// identify the stubbed export.
pub type OnSyscall = dyn FnMut(u32, u64, &str, &str) -> SyscallVerdict;

/// Callback receiving guest writes to standard output.
pub type OnStdout = dyn FnMut(&[u8]);

/// Host callbacks the emulator fans out to.
#[derive(Default)]
pub struct EmulatorCallbacks {
    /// Intercept unknown or stubbed syscalls.
    pub on_syscall: Option<Box<OnSyscall>>,
    /// Observe guest standard output.
    pub on_stdout: Option<Box<OnStdout>>,
}

impl std::fmt::Debug for EmulatorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorCallbacks")
            .field("on_syscall", &self.on_syscall.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .finish()
    }
}

/// Emulator-wide configuration.
#[derive(Clone, Debug)]
pub struct EmulatorSettings {
    /// Host path backing the guest root filesystem view.
    pub emulation_root: PathBuf,
    /// Host directory for the registry hive backend.
    pub registry_directory: PathBuf,
    /// Log each syscall with decoded arguments and result.
    pub verbose_calls: bool,
    /// Suppress all emulator log output.
    pub disable_logging: bool,
    /// Defer logging until the primary image's entry point is reached.
    pub silent_until_main: bool,
    /// Advance virtual clocks from the retired-instruction count instead of host
    /// time (deterministic runs).
    pub use_relative_time: bool,
    /// Bidirectional emulator-port ↔ host-port rewriting for socket APIs.
    pub port_mappings: HashMap<u16, u16>,
    /// Mount table: guest NT path prefixes → host paths.
    pub path_mappings: HashMap<String, PathBuf>,
    /// Modules to fully emulate from real files; all others resolve to stubs.
    pub modules: BTreeSet<String>,
    /// Instructions per scheduling quantum.
    pub instruction_quantum: u64,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            emulation_root: PathBuf::from("."),
            registry_directory: PathBuf::from("./registry"),
            verbose_calls: false,
            disable_logging: false,
            silent_until_main: false,
            use_relative_time: false,
            port_mappings: HashMap::new(),
            path_mappings: HashMap::new(),
            modules: BTreeSet::new(),
            instruction_quantum: 100_000,
        }
    }
}

/// The application to emulate.
#[derive(Clone, Debug, Default)]
pub struct ApplicationSettings {
    /// Guest path of the executable (NT style, e.g. `C:\app\app.exe`).
    pub application: String,
    /// Guest working directory.
    pub working_directory: String,
    /// Command-line arguments (UTF-8; converted to UTF-16 for the guest).
    pub arguments: Vec<String>,
}

/// How a [`start`](crate::emulator::Emulator::start) run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmulationOutcome {
    /// The process exited with this status.
    Exited(u32),
    /// The instruction budget was exhausted.
    InstructionLimit,
    /// The wall-clock timeout elapsed.
    Timeout,
    /// [`stop`](crate::cpu::CpuEngine::stop) interrupted the run.
    Stopped,
}
