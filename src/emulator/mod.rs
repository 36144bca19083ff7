//! The emulator facade: world construction, the run loop, thread switching,
//! snapshots and user-visible flags.
//!
//! [`Emulator`] owns the CPU engine and the four kernel subsystems (memory,
//! modules, process, syscall dispatcher) and orchestrates them: it sets up the
//! process (PEB, process parameters, standard handles, primary image, main
//! thread), drives the engine one scheduling quantum at a time, services the
//! engine's exit events (syscalls, access violations, interrupts), performs
//! cooperative thread switches at yield points, and converts guest faults into NT
//! exceptions dispatched inside the guest.

mod serialize;
mod settings;

pub use settings::{
    ApplicationSettings, EmulationOutcome, EmulatorCallbacks, EmulatorSettings, OnStdout,
    OnSyscall, SyscallVerdict,
};

use std::time::{Duration, Instant};

use crate::{
    cpu::{AccessKind, CpuEngine, CpuExit, X64Register},
    memory::{page_align_down, MemoryManager, MemoryProtection, RegionTag, PAGE_SIZE},
    module::ModuleManager,
    process::{
        peb, process_params, FileBacking, FileObject, KernelObject, ProcessContext,
    },
    syscalls::{
        handlers::process::{context_layout, CONTEXT_GPR_ORDER},
        DispatchResult, NtStatus, SyscallContext, SyscallDispatcher,
    },
    Error, Result,
};

/// `EXCEPTION_RECORD64` size.
const EXCEPTION_RECORD_SIZE: u64 = 0x98;

/// Scratch skipped below the faulting RSP before the exception frame.
const EXCEPTION_SCRATCH: u64 = 0x200;

/// A user-mode Windows x86-64 emulator instance.
///
/// Instance-scoped: multiple emulators coexist in one host process without
/// interference. The emulator is single-threaded on the host; all guest threads
/// are multiplexed cooperatively over the one CPU engine.
pub struct Emulator {
    cpu: Box<dyn CpuEngine>,
    /// Guest virtual memory.
    pub memory: MemoryManager,
    /// Mapped modules.
    pub modules: ModuleManager,
    /// The process model.
    pub process: ProcessContext,
    /// Syscall routing.
    pub dispatcher: SyscallDispatcher,
    /// Host callbacks.
    pub callbacks: EmulatorCallbacks,

    /// Log each syscall with decoded arguments.
    pub verbose_calls: bool,
    /// Collect stdout into an internal buffer instead of the callback.
    pub buffer_stdout: bool,
    /// Fuzzing mode: downgrade fatal guest conditions to clean exits.
    pub fuzzing: bool,

    disable_logging: bool,
    silent_until_main: bool,
    use_relative_time: bool,
    quantum: u64,
    port_mappings: std::collections::HashMap<u16, u16>,

    switch_pending: bool,
    reached_main: bool,
    entry_point: u64,
    stdout_buffer: Vec<u8>,
    snapshot: Option<Vec<u8>>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("entry_point", &self.entry_point)
            .field("active_tid", &self.process.active_tid)
            .field("modules", &self.modules.modules().count())
            .finish_non_exhaustive()
    }
}

impl Emulator {
    /// Creates an emulator with an empty guest world.
    ///
    /// Call [`load_application`](Self::load_application) or
    /// [`load_application_image`](Self::load_application_image) to populate it.
    #[must_use]
    pub fn new(settings: EmulatorSettings, cpu: Box<dyn CpuEngine>) -> Self {
        let modules = ModuleManager::new(
            settings.emulation_root.clone(),
            settings
                .path_mappings
                .iter()
                .map(|(guest, host)| (guest.clone(), host.clone()))
                .collect(),
            settings
                .modules
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
        );

        Self {
            cpu,
            memory: MemoryManager::new(),
            modules,
            process: ProcessContext::new(settings.use_relative_time),
            dispatcher: SyscallDispatcher::new(),
            callbacks: EmulatorCallbacks::default(),
            verbose_calls: settings.verbose_calls,
            buffer_stdout: false,
            fuzzing: false,
            disable_logging: settings.disable_logging,
            silent_until_main: settings.silent_until_main,
            use_relative_time: settings.use_relative_time,
            quantum: settings.instruction_quantum.max(1),
            port_mappings: settings.port_mappings,
            switch_pending: false,
            reached_main: false,
            entry_point: 0,
            stdout_buffer: Vec::new(),
            snapshot: None,
        }
    }

    /// Returns the CPU engine.
    pub fn cpu(&mut self) -> &mut dyn CpuEngine {
        self.cpu.as_mut()
    }

    /// Privileged read of guest memory (kernel semantics, protection bypassed).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not committed.
    pub fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read_privileged(self.cpu.as_mut(), address, buf)
    }

    /// Privileged write of guest memory (kernel semantics, protection bypassed).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not committed.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.memory.write_privileged(self.cpu.as_mut(), address, data)
    }

    /// Reads a u64 from guest memory (privileged).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not committed.
    pub fn read_memory_u64(&mut self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_memory(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Loads and sets up an application from the filesystem view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the executable cannot be read, or an
    /// [`Error::ImageLoad`] from mapping.
    pub fn load_application(&mut self, app: &ApplicationSettings) -> Result<()> {
        let host_path = self.modules.resolve_guest_path(&app.application);
        let bytes = std::fs::read(&host_path)?;
        let name = app
            .application
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or("app.exe")
            .to_string();
        self.load_application_image(&bytes, &name, app)
    }

    /// Sets up the process around an application image provided as bytes
    /// (used by tests and fuzzing harnesses).
    ///
    /// Builds the PEB and process parameters (command line, standard handles),
    /// maps the primary image with its dependencies, and creates the main thread
    /// at the image entry point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] on mapping failures.
    pub fn load_application_image(
        &mut self,
        bytes: &[u8],
        name: &str,
        app: &ApplicationSettings,
    ) -> Result<()> {
        self.setup_process_parameters(name, app)?;

        let base = self
            .modules
            .map_primary(self.cpu.as_mut(), &mut self.memory, bytes, name)?;
        self.process.image_base = base;
        self.memory.write_privileged(
            self.cpu.as_mut(),
            self.process.peb + peb::IMAGE_BASE,
            &base.to_le_bytes(),
        )?;

        let entry = self
            .modules
            .primary()
            .and_then(|module| module.entry_point)
            .ok_or_else(|| Error::ImageLoad {
                module: name.to_string(),
                reason: "image has no entry point".to_string(),
            })?;
        self.entry_point = entry;

        let peb = self.process.peb;
        let tid = self
            .process
            .create_thread(self.cpu.as_mut(), &mut self.memory, entry, peb, 0, false)?;
        self.activate_thread(tid)?;

        if self.log_active() {
            log::info!("process ready: {name} at {base:#x}, entry {entry:#x}, main thread {tid}");
        }
        Ok(())
    }

    /// Builds the PEB, `RTL_USER_PROCESS_PARAMETERS` and standard handles.
    fn setup_process_parameters(&mut self, name: &str, app: &ApplicationSettings) -> Result<()> {
        let cpu = self.cpu.as_mut();

        let peb_base =
            self.memory
                .reserve(0, PAGE_SIZE, MemoryProtection::READ_WRITE, RegionTag::Private)?;
        self.memory
            .commit(cpu, peb_base, PAGE_SIZE, MemoryProtection::READ_WRITE)?;
        self.process.peb = peb_base;

        let params_base =
            self.memory
                .reserve(0, PAGE_SIZE, MemoryProtection::READ_WRITE, RegionTag::Private)?;
        self.memory
            .commit(cpu, params_base, PAGE_SIZE, MemoryProtection::READ_WRITE)?;

        // Command line: the quoted application path followed by the arguments.
        let mut command_line = String::new();
        command_line.push('"');
        command_line.push_str(if app.application.is_empty() {
            name
        } else {
            &app.application
        });
        command_line.push('"');
        for argument in &app.arguments {
            command_line.push(' ');
            command_line.push_str(argument);
        }
        let command_units: Vec<u16> = widestring::U16String::from_str(&command_line).into_vec();
        let image_units: Vec<u16> = widestring::U16String::from_str(if app.application.is_empty() {
            name
        } else {
            &app.application
        })
        .into_vec();

        let command_buffer = params_base + 0x400;
        let image_buffer = params_base + 0x600;
        self.write_utf16(command_buffer, &command_units)?;
        self.write_utf16(image_buffer, &image_units)?;
        self.write_unicode_string(
            params_base + process_params::COMMAND_LINE,
            command_buffer,
            command_units.len(),
        )?;
        self.write_unicode_string(
            params_base + process_params::IMAGE_PATH_NAME,
            image_buffer,
            image_units.len(),
        )?;
        self.process.command_line = command_units;

        // Standard handles.
        let stdin_handle = self.process.insert_object(
            KernelObject::File(FileObject {
                backing: FileBacking::Stdin,
                position: 0,
            }),
            0x12_0189,
            true,
        );
        let stdout_handle = self.process.insert_object(
            KernelObject::File(FileObject {
                backing: FileBacking::Stdout,
                position: 0,
            }),
            0x12_0196,
            true,
        );
        let stderr_handle = self.process.insert_object(
            KernelObject::File(FileObject {
                backing: FileBacking::Stderr,
                position: 0,
            }),
            0x12_0196,
            true,
        );
        let cpu = self.cpu.as_mut();
        for (offset, handle) in [
            (process_params::STANDARD_INPUT, stdin_handle),
            (process_params::STANDARD_OUTPUT, stdout_handle),
            (process_params::STANDARD_ERROR, stderr_handle),
        ] {
            self.memory.write_privileged(
                cpu,
                params_base + offset,
                &u64::from(handle.raw()).to_le_bytes(),
            )?;
        }

        // PEB fields that exist before the image is known.
        self.memory.write_privileged(
            cpu,
            peb_base + peb::PROCESS_PARAMETERS,
            &params_base.to_le_bytes(),
        )?;
        self.memory
            .write_privileged(cpu, peb_base + peb::LDR, &0u64.to_le_bytes())?;
        self.memory.write_privileged(
            cpu,
            peb_base + peb::NUMBER_OF_PROCESSORS,
            &1u32.to_le_bytes(),
        )?;
        Ok(())
    }

    fn write_utf16(&mut self, address: u64, units: &[u16]) -> Result<()> {
        let mut bytes = Vec::with_capacity(units.len() * 2 + 2);
        for unit in units {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        self.memory
            .write_privileged(self.cpu.as_mut(), address, &bytes)
    }

    fn write_unicode_string(&mut self, address: u64, buffer: u64, units: usize) -> Result<()> {
        let cpu = self.cpu.as_mut();
        let length = (units * 2) as u16;
        self.memory
            .write_privileged(cpu, address, &length.to_le_bytes())?;
        self.memory
            .write_privileged(cpu, address + 2, &(length + 2).to_le_bytes())?;
        self.memory
            .write_privileged(cpu, address + 8, &buffer.to_le_bytes())?;
        Ok(())
    }

    /// Runs the guest until process exit, a stop request, the wall-clock
    /// `timeout`, or an instruction budget of `count` (0 = unlimited), whichever
    /// comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] when no thread can ever run again, and
    /// emulation errors from the engine or the dispatcher. Guest faults are
    /// dispatched into the guest and never surface here.
    pub fn start(&mut self, timeout: Option<Duration>, count: u64) -> Result<EmulationOutcome> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut remaining = if count == 0 { u64::MAX } else { count };

        loop {
            if let Some(code) = self.process.exit_status {
                return Ok(EmulationOutcome::Exited(code));
            }

            let active_runnable = self
                .process
                .active_thread()
                .map(|thread| thread.is_runnable())
                .unwrap_or(false);
            if self.switch_pending || !active_runnable {
                if !self.perform_thread_switch()? {
                    let code = self.process.exit_status.unwrap_or(0);
                    return Ok(EmulationOutcome::Exited(code));
                }
            }

            let budget = self.quantum.min(remaining);
            let step = self.cpu.run(budget)?;
            remaining = remaining.saturating_sub(step.executed);
            if self.use_relative_time {
                self.process.clocks.advance(step.executed);
            }
            if let Ok(thread) = self.process.active_thread_mut() {
                thread.instructions += step.executed;
            }
            self.update_reached_main();

            match step.exit {
                CpuExit::InstructionLimit => {
                    if remaining == 0 {
                        return Ok(EmulationOutcome::InstructionLimit);
                    }
                    // Quantum expiry is a scheduling point.
                    self.switch_pending = true;
                }
                CpuExit::Syscall => self.handle_syscall()?,
                CpuExit::AccessViolation { address, access } => {
                    self.handle_access_violation(address, access)?;
                }
                CpuExit::Interrupt { vector } => self.handle_interrupt(vector)?,
                CpuExit::Stopped => return Ok(EmulationOutcome::Stopped),
                CpuExit::Halted => {
                    let rip = self.cpu.read_u64(X64Register::Rip);
                    self.raise_exception(NtStatus::ILLEGAL_INSTRUCTION, rip, &[])?;
                }
            }

            if remaining == 0 {
                return Ok(EmulationOutcome::InstructionLimit);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(EmulationOutcome::Timeout);
            }
        }
    }

    /// Requests a cooperative switch at the next scheduling point.
    pub fn yield_thread(&mut self) {
        self.switch_pending = true;
    }

    /// Performs a thread switch: completes expired waits, requeues the outgoing
    /// thread if it is still runnable, fast-forwards the clock past idle gaps,
    /// and activates the next runnable thread.
    ///
    /// Returns `false` when every thread has terminated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] when threads are waiting but none can ever be
    /// woken.
    pub fn perform_thread_switch(&mut self) -> Result<bool> {
        self.process.check_waits();

        if let Some(active) = self.process.active_tid {
            let runnable = self
                .process
                .threads
                .get(&active)
                .is_some_and(|thread| thread.is_runnable());
            if runnable {
                self.process.enqueue_ready(active);
            }
        }

        loop {
            match self.process.select_next() {
                crate::process::ScheduleDecision::Run(tid) => {
                    self.activate_thread(tid)?;
                    self.switch_pending = false;
                    return Ok(true);
                }
                crate::process::ScheduleDecision::FastForward(target) => {
                    // Idle until the earliest deadline, then complete the waits
                    // it expires.
                    self.process.clocks.fast_forward_to(target);
                    self.process.check_waits();
                }
                crate::process::ScheduleDecision::Deadlock => {
                    return Err(Error::Deadlock);
                }
                crate::process::ScheduleDecision::AllExited => return Ok(false),
            }
        }
    }

    /// Makes `tid` the active thread: saves the outgoing register file, restores
    /// the incoming one, points GS at the incoming TEB and delivers any pending
    /// wait status into RAX.
    ///
    /// Returns `false` if the thread does not exist.
    ///
    /// # Errors
    ///
    /// Propagates engine blob restore failures.
    pub fn activate_thread(&mut self, tid: u32) -> Result<bool> {
        if !self.process.threads.contains_key(&tid) {
            return Ok(false);
        }

        if self.process.active_tid == Some(tid) {
            // Re-selected without a real switch; a completed wait may still owe
            // the thread its status.
            if let Some(status) = self
                .process
                .threads
                .get_mut(&tid)
                .and_then(|thread| thread.pending_status.take())
            {
                self.cpu.write_u64(X64Register::Rax, u64::from(status.0));
            }
            self.process.ready_queue.retain(|queued| *queued != tid);
            return Ok(true);
        }

        if let Some(outgoing) = self.process.active_tid {
            let blob = self.cpu.save_registers();
            if let Some(thread) = self.process.threads.get_mut(&outgoing) {
                thread.registers = blob;
            }
        }

        let (registers, teb, pending) = {
            let thread = self.process.threads.get_mut(&tid).expect("checked above");
            (
                std::mem::take(&mut thread.registers),
                thread.teb,
                thread.pending_status.take(),
            )
        };
        self.cpu.restore_registers(&registers)?;
        // Keep a copy so snapshots taken mid-run still see the blob.
        self.process
            .threads
            .get_mut(&tid)
            .expect("checked above")
            .registers = registers;
        self.cpu.write_u64(X64Register::GsBase, teb);
        if let Some(status) = pending {
            self.cpu.write_u64(X64Register::Rax, u64::from(status.0));
        }

        self.process.active_tid = Some(tid);
        self.process.ready_queue.retain(|queued| *queued != tid);
        log::trace!("switched to thread {tid}");
        Ok(true)
    }

    /// Services one syscall exit.
    fn handle_syscall(&mut self) -> Result<()> {
        let verbose = self.verbose_calls && self.log_active();
        let mut ctx = SyscallContext {
            cpu: self.cpu.as_mut(),
            memory: &mut self.memory,
            modules: &mut self.modules,
            process: &mut self.process,
            callbacks: &mut self.callbacks,
            stdout_buffer: &mut self.stdout_buffer,
            buffer_stdout: self.buffer_stdout,
            switch_pending: &mut self.switch_pending,
        };

        match self.dispatcher.dispatch(&mut ctx, verbose) {
            Ok(DispatchResult::Completed(_)) => Ok(()),
            Ok(DispatchResult::Descheduled) => {
                self.switch_pending = true;
                Ok(())
            }
            Ok(DispatchResult::ProcessExit(code)) => {
                self.process.exit_status = Some(code);
                Ok(())
            }
            Ok(DispatchResult::RaiseException { code, address }) => {
                self.raise_exception(code, address, &[])
            }
            Err(Error::GuestFault { address, write }) => {
                let access = if write {
                    AccessKind::Write
                } else {
                    AccessKind::Read
                };
                self.handle_access_violation(address, access)
            }
            Err(error) => Err(error),
        }
    }

    /// Services an access-violation exit: guard pages pop their guard and raise
    /// `STATUS_GUARD_PAGE_VIOLATION`; everything else raises
    /// `STATUS_ACCESS_VIOLATION` with the NT parameter layout.
    fn handle_access_violation(&mut self, address: u64, access: AccessKind) -> Result<()> {
        let rip = self.cpu.read_u64(X64Register::Rip);
        let kind = match access {
            AccessKind::Read => 0u64,
            AccessKind::Write => 1,
            AccessKind::Execute => 8,
        };

        let guard = self
            .memory
            .region_at(address)
            .filter(|region| region.protection.contains(MemoryProtection::GUARD))
            .map(|region| region.protection);
        if let Some(protection) = guard {
            let page = page_align_down(address);
            self.memory.protect(
                self.cpu.as_mut(),
                page,
                PAGE_SIZE,
                protection - MemoryProtection::GUARD,
            )?;
            return self.raise_exception(NtStatus::GUARD_PAGE_VIOLATION, rip, &[kind, address]);
        }

        if self.log_active() {
            log::debug!("access violation at {address:#x} (rip {rip:#x})");
        }
        self.raise_exception(NtStatus::ACCESS_VIOLATION, rip, &[kind, address])
    }

    /// Services an interrupt/exception exit.
    fn handle_interrupt(&mut self, vector: u8) -> Result<()> {
        let rip = self.cpu.read_u64(X64Register::Rip);
        let status = match vector {
            0 => NtStatus::INTEGER_DIVIDE_BY_ZERO,
            1 => NtStatus::SINGLE_STEP,
            3 => NtStatus::BREAKPOINT,
            6 => NtStatus::ILLEGAL_INSTRUCTION,
            _ => NtStatus::UNSUCCESSFUL,
        };
        self.raise_exception(status, rip, &[])
    }

    /// Raises an NT exception into the active thread.
    ///
    /// Builds a `CONTEXT` and `EXCEPTION_RECORD` on the guest stack (`CONTEXT`
    /// at the new RSP, record following it) and redirects RIP to ntdll's
    /// `KiUserExceptionDispatcher`. Without a dispatcher in the guest the
    /// process terminates with the exception code.
    pub fn raise_exception(
        &mut self,
        code: NtStatus,
        address: u64,
        parameters: &[u64],
    ) -> Result<()> {
        // Fuzzing wants crashes to surface immediately, not disappear into
        // guest SEH handlers.
        let dispatcher = if self.fuzzing {
            None
        } else {
            self.modules
                .find_by_name("ntdll.dll")
                .map(|module| module.base)
                .and_then(|base| self.modules.get_export(base, "KiUserExceptionDispatcher"))
        };

        let Some(target) = dispatcher else {
            if self.log_active() {
                log::warn!("unhandled exception {code} at {address:#x}; terminating process");
            }
            self.process.exit_status = Some(code.0);
            return Ok(());
        };

        match self.build_exception_frame(target, code, address, parameters) {
            Ok(()) => Ok(()),
            // A nested fault while building the frame (corrupt stack pointer)
            // is unrecoverable for the guest, never an emulation error.
            Err(Error::InvalidAddress { .. } | Error::GuestFault { .. }) => {
                self.process.exit_status = Some(code.0);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Writes the `CONTEXT` + `EXCEPTION_RECORD` frame and redirects execution.
    fn build_exception_frame(
        &mut self,
        target: u64,
        code: NtStatus,
        address: u64,
        parameters: &[u64],
    ) -> Result<()> {
        let rsp = self.cpu.read_u64(X64Register::Rsp);
        let frame = (rsp
            .saturating_sub(EXCEPTION_SCRATCH + context_layout::SIZE + EXCEPTION_RECORD_SIZE))
            & !0xF;
        let context_addr = frame;
        let record_addr = frame + context_layout::SIZE;

        // CONTEXT: ContextFlags = CONTEXT_ALL, the integer file, RIP, EFlags, MxCsr.
        let cpu = self.cpu.as_mut();
        self.memory
            .write_privileged(cpu, context_addr + context_layout::FLAGS, &0x0010_000Fu32.to_le_bytes())?;
        let mxcsr = {
            let mut buf = [0u8; 4];
            cpu.read_reg(X64Register::Mxcsr, &mut buf);
            buf
        };
        self.memory
            .write_privileged(cpu, context_addr + context_layout::MXCSR, &mxcsr)?;
        let rflags = cpu.read_u64(X64Register::Rflags) as u32;
        self.memory
            .write_privileged(cpu, context_addr + context_layout::EFLAGS, &rflags.to_le_bytes())?;
        for (index, reg) in CONTEXT_GPR_ORDER.iter().enumerate() {
            let value = cpu.read_u64(*reg);
            self.memory.write_privileged(
                cpu,
                context_addr + context_layout::RAX + index as u64 * 8,
                &value.to_le_bytes(),
            )?;
        }
        let rip = cpu.read_u64(X64Register::Rip);
        self.memory
            .write_privileged(cpu, context_addr + context_layout::RIP, &rip.to_le_bytes())?;

        // EXCEPTION_RECORD64.
        self.memory
            .write_privileged(cpu, record_addr, &code.0.to_le_bytes())?;
        self.memory
            .write_privileged(cpu, record_addr + 0x04, &0u32.to_le_bytes())?;
        self.memory
            .write_privileged(cpu, record_addr + 0x08, &0u64.to_le_bytes())?;
        self.memory
            .write_privileged(cpu, record_addr + 0x10, &address.to_le_bytes())?;
        self.memory.write_privileged(
            cpu,
            record_addr + 0x18,
            &(parameters.len() as u32).to_le_bytes(),
        )?;
        for (index, parameter) in parameters.iter().take(15).enumerate() {
            self.memory.write_privileged(
                cpu,
                record_addr + 0x20 + index as u64 * 8,
                &parameter.to_le_bytes(),
            )?;
        }

        cpu.write_u64(X64Register::Rsp, frame);
        cpu.write_u64(X64Register::Rip, target);
        if self.log_active() {
            log::debug!("dispatching exception {code} to guest at {target:#x}");
        }
        Ok(())
    }

    /// Arms logging once the primary entry point is first reached.
    fn update_reached_main(&mut self) {
        if self.reached_main || self.entry_point == 0 {
            return;
        }
        let rip = self.cpu.read_u64(X64Register::Rip);
        if rip == self.entry_point
            || self
                .modules
                .primary()
                .is_some_and(|module| rip >= module.base && rip < module.end())
        {
            self.reached_main = true;
        }
    }

    /// Returns `true` if log output is currently allowed.
    #[must_use]
    pub fn log_active(&self) -> bool {
        !self.disable_logging && (!self.silent_until_main || self.reached_main)
    }

    /// Returns the stdout collected while `buffer_stdout` was set.
    #[must_use]
    pub fn buffered_stdout(&self) -> &[u8] {
        &self.stdout_buffer
    }

    /// Maps an emulator port to a host port (or removes the mapping when both
    /// are equal).
    pub fn map_port(&mut self, emulator_port: u16, host_port: u16) {
        if emulator_port != host_port {
            self.port_mappings.insert(emulator_port, host_port);
        } else {
            self.port_mappings.remove(&emulator_port);
        }
    }

    /// Translates an emulator port to the host port it is mapped to.
    #[must_use]
    pub fn get_host_port(&self, emulator_port: u16) -> u16 {
        self.port_mappings
            .get(&emulator_port)
            .copied()
            .unwrap_or(emulator_port)
    }

    /// Translates a host port back to the emulator port mapped onto it.
    #[must_use]
    pub fn get_emulator_port(&self, host_port: u16) -> u16 {
        self.port_mappings
            .iter()
            .find(|(_, mapped)| **mapped == host_port)
            .map(|(port, _)| *port)
            .unwrap_or(host_port)
    }

    /// Captures the single snapshot slot.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn save_snapshot(&mut self) -> Result<()> {
        let stream = self.serialize()?;
        self.snapshot = Some(stream);
        Ok(())
    }

    /// Restores the world from the snapshot slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Snapshot`] if no snapshot was saved or the stream fails
    /// validation.
    pub fn restore_snapshot(&mut self) -> Result<()> {
        let stream = self
            .snapshot
            .clone()
            .ok_or_else(|| Error::Snapshot("no snapshot saved".into()))?;
        self.deserialize(&stream)
    }
}
