//! The process context: the model of one running NT process.
//!
//! [`ProcessContext`] is the single owner of everything per-process: the thread
//! table, kernel object and handle tables, virtual clocks, the deterministic RNG,
//! the PEB location and command line, and the scheduler's ready queue. All
//! cross-references are stable ids (TIDs, handle values, object ids) into the
//! owning tables, never pointers, so the whole context serializes directly.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    cpu::{CpuEngine, X64Register},
    memory::{MemoryManager, MemoryProtection, RegionTag, PAGE_SIZE},
    process::{
        clock::ProcessClocks,
        handle::{Handle, HandleTable},
        object::{KernelObject, ObjectId, ObjectTable},
        thread::{EmulatedThread, WaitState},
    },
    syscalls::NtStatus,
    Error, Result,
};

/// Emulated process id reported to the guest.
pub const EMULATED_PID: u64 = 0x400;

/// Default stack reservation for new threads (1 MiB).
pub const DEFAULT_STACK_SIZE: u64 = 0x10_0000;

/// Bytes committed for each TEB.
const TEB_SIZE: u64 = 0x2000;

/// TEB field offsets the emulator maintains.
pub mod teb {
    /// `NT_TIB.StackBase` - high end of the stack.
    pub const STACK_BASE: u64 = 0x08;
    /// `NT_TIB.StackLimit` - low end of the committed stack.
    pub const STACK_LIMIT: u64 = 0x10;
    /// `NT_TIB.Self` - flat address of the TEB itself.
    pub const SELF: u64 = 0x30;
    /// `ClientId.UniqueProcess`.
    pub const CLIENT_ID_PROCESS: u64 = 0x40;
    /// `ClientId.UniqueThread`.
    pub const CLIENT_ID_THREAD: u64 = 0x48;
    /// `ThreadLocalStoragePointer`.
    pub const TLS_POINTER: u64 = 0x58;
    /// `ProcessEnvironmentBlock`.
    pub const PEB: u64 = 0x60;
    /// `LastErrorValue`.
    pub const LAST_ERROR: u64 = 0x68;
    /// `TlsSlots[64]`.
    pub const TLS_SLOTS: u64 = 0x1480;
}

/// PEB field offsets the emulator maintains.
pub mod peb {
    /// `ImageBaseAddress`.
    pub const IMAGE_BASE: u64 = 0x10;
    /// `Ldr` (loader data; zero in this emulator).
    pub const LDR: u64 = 0x18;
    /// `ProcessParameters`.
    pub const PROCESS_PARAMETERS: u64 = 0x20;
    /// `NumberOfProcessors` mirror kept at its documented offset.
    pub const NUMBER_OF_PROCESSORS: u64 = 0xB8;
}

/// `RTL_USER_PROCESS_PARAMETERS` field offsets.
pub mod process_params {
    /// `StandardInput` handle.
    pub const STANDARD_INPUT: u64 = 0x20;
    /// `StandardOutput` handle.
    pub const STANDARD_OUTPUT: u64 = 0x28;
    /// `StandardError` handle.
    pub const STANDARD_ERROR: u64 = 0x30;
    /// `ImagePathName` UNICODE_STRING.
    pub const IMAGE_PATH_NAME: u64 = 0x60;
    /// `CommandLine` UNICODE_STRING.
    pub const COMMAND_LINE: u64 = 0x70;
}

/// Singleton per-emulator model of the running process.
#[derive(Debug)]
pub struct ProcessContext {
    /// Guest address of the PEB (0 until the process is set up).
    pub peb: u64,
    /// Base of the primary image.
    pub image_base: u64,
    /// Command line as UTF-16 code units.
    pub command_line: Vec<u16>,
    /// Environment block as UTF-16 code units (double-NUL terminated).
    pub environment: Vec<u16>,
    /// Kernel object arena.
    pub objects: ObjectTable,
    /// Handle table.
    pub handles: HandleTable,
    /// Thread table keyed by TID.
    pub threads: BTreeMap<u32, EmulatedThread>,
    /// TID of the active thread (registers live in the engine), if any.
    pub active_tid: Option<u32>,
    /// Round-robin ready queue of runnable TIDs (the active thread is not queued).
    pub ready_queue: VecDeque<u32>,
    /// Virtual clocks.
    pub clocks: ProcessClocks,
    /// Deterministic RNG state (xorshift64*).
    pub rng_state: u64,
    /// Exit status once the process has terminated.
    pub exit_status: Option<u32>,
    next_tid: u32,
}

impl ProcessContext {
    /// Creates an empty process context.
    #[must_use]
    pub fn new(use_relative_time: bool) -> Self {
        Self {
            peb: 0,
            image_base: 0,
            command_line: Vec::new(),
            environment: vec![0, 0],
            objects: ObjectTable::new(),
            handles: HandleTable::new(),
            threads: BTreeMap::new(),
            active_tid: None,
            ready_queue: VecDeque::new(),
            clocks: ProcessClocks::new(use_relative_time),
            rng_state: 0x2545_F491_4F6C_DD1D,
            exit_status: None,
            next_tid: 4,
        }
    }

    /// Returns the active thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveThread`] if no thread is active.
    pub fn active_thread(&self) -> Result<&EmulatedThread> {
        self.active_tid
            .and_then(|tid| self.threads.get(&tid))
            .ok_or(Error::NoActiveThread)
    }

    /// Returns the active thread for mutation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveThread`] if no thread is active.
    pub fn active_thread_mut(&mut self) -> Result<&mut EmulatedThread> {
        self.active_tid
            .and_then(|tid| self.threads.get_mut(&tid))
            .ok_or(Error::NoActiveThread)
    }

    /// Creates a thread: stack with a guard page at the low end, committed and
    /// initialized TEB, registers set up per the Win64 convention (RIP at the
    /// start address, RCX carrying the parameter, 16-byte-aligned stack), and an
    /// entry in the thread table. Runnable threads are enqueued; `suspended`
    /// threads start with a suspend count of one.
    ///
    /// Returns the new TID.
    ///
    /// # Errors
    ///
    /// Propagates memory manager failures (exhausted address space, ...).
    pub fn create_thread(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        start_address: u64,
        parameter: u64,
        stack_size: u64,
        suspended: bool,
    ) -> Result<u32> {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            crate::memory::page_align_up(stack_size).max(2 * PAGE_SIZE)
        };

        let stack_base = memory.reserve(0, stack_size, MemoryProtection::READ_WRITE, RegionTag::Stack)?;
        memory.commit(cpu, stack_base, stack_size, MemoryProtection::READ_WRITE)?;
        // Guard page at the low end of the stack.
        memory.protect(
            cpu,
            stack_base,
            PAGE_SIZE,
            MemoryProtection::READ_WRITE | MemoryProtection::GUARD,
        )?;

        let teb = memory.reserve(0, TEB_SIZE, MemoryProtection::READ_WRITE, RegionTag::Private)?;
        memory.commit(cpu, teb, TEB_SIZE, MemoryProtection::READ_WRITE)?;

        let tid = self.next_tid;
        self.next_tid += 4;

        let stack_top = stack_base + stack_size;
        let write_field = |memory: &mut MemoryManager, cpu: &mut dyn CpuEngine, offset: u64, value: u64| {
            memory.write_privileged(cpu, teb + offset, &value.to_le_bytes())
        };
        write_field(memory, cpu, teb::STACK_BASE, stack_top)?;
        write_field(memory, cpu, teb::STACK_LIMIT, stack_base + PAGE_SIZE)?;
        write_field(memory, cpu, teb::SELF, teb)?;
        write_field(memory, cpu, teb::CLIENT_ID_PROCESS, EMULATED_PID)?;
        write_field(memory, cpu, teb::CLIENT_ID_THREAD, u64::from(tid))?;
        write_field(memory, cpu, teb::PEB, self.peb)?;

        // Build the initial register file on the engine, then capture it as the
        // thread's blob and put the interrupted state back.
        let interrupted = if self.active_tid.is_some() {
            Some(cpu.save_registers())
        } else {
            None
        };

        for reg in [
            X64Register::Rax,
            X64Register::Rbx,
            X64Register::Rdx,
            X64Register::Rsi,
            X64Register::Rdi,
            X64Register::Rbp,
            X64Register::R8,
            X64Register::R9,
            X64Register::R10,
            X64Register::R11,
            X64Register::R12,
            X64Register::R13,
            X64Register::R14,
            X64Register::R15,
        ] {
            cpu.write_u64(reg, 0);
        }
        cpu.write_u64(X64Register::Rip, start_address);
        cpu.write_u64(X64Register::Rcx, parameter);
        // Mimic a `call` into the start routine: RSP ≡ 8 (mod 16), with the
        // scratch the kernel leaves above the initial frame still inside the
        // committed stack.
        cpu.write_u64(X64Register::Rsp, stack_top - 0x208);
        cpu.write_u64(X64Register::Rflags, 0x202);
        cpu.write_u64(X64Register::GsBase, teb);
        let registers = cpu.save_registers();

        if let Some(blob) = interrupted {
            cpu.restore_registers(&blob)?;
        }

        let object = self.objects.insert(KernelObject::Thread(tid));
        let thread = EmulatedThread {
            id: tid,
            object,
            registers,
            teb,
            stack_base,
            stack_size,
            suspend_count: u32::from(suspended),
            priority: 0,
            affinity: 1,
            state: WaitState::Runnable,
            wait: None,
            pending_status: None,
            user_apcs: VecDeque::new(),
            kernel_apcs: VecDeque::new(),
            last_status: NtStatus::SUCCESS,
            exit_code: None,
            instructions: 0,
        };
        self.threads.insert(tid, thread);

        if !suspended {
            self.enqueue_ready(tid);
        }

        log::debug!(
            "created thread {tid} entry={start_address:#x} stack={stack_base:#x}+{stack_size:#x} teb={teb:#x}"
        );
        Ok(tid)
    }

    /// Terminates a thread: marks it terminated, records the exit code, signals
    /// its thread object (releasing all waiters), abandons mutants it owns and
    /// frees its stack. The table entry itself persists until the last handle
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an unknown TID.
    pub fn terminate_thread(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        tid: u32,
        exit_code: u32,
    ) -> Result<()> {
        let (stack_base, already_dead) = {
            let thread = self
                .threads
                .get_mut(&tid)
                .ok_or_else(|| Error::InvalidParameter(format!("unknown thread {tid}")))?;
            let already_dead = thread.is_terminated();
            thread.state = WaitState::Terminated;
            thread.exit_code = Some(exit_code);
            thread.wait = None;
            (thread.stack_base, already_dead)
        };

        if already_dead {
            return Ok(());
        }

        // Mutants held by a dying thread become abandoned.
        let abandoned: Vec<ObjectId> = self
            .objects
            .iter()
            .filter_map(|(id, entry)| match &entry.object {
                KernelObject::Mutant(mutant) if mutant.owner == Some(tid) => Some(id),
                _ => None,
            })
            .collect();
        for id in abandoned {
            if let Some(KernelObject::Mutant(mutant)) = self.objects.get_mut(id) {
                mutant.owner = None;
                mutant.recursion = 0;
                mutant.abandoned = true;
            }
        }

        self.ready_queue.retain(|queued| *queued != tid);
        if self.active_tid == Some(tid) {
            self.active_tid = None;
        }

        // The stack is gone the moment the thread can no longer run.
        let _ = memory.release(cpu, stack_base);

        // Waiters on the thread object (and on freshly abandoned mutants) get
        // another look.
        self.check_waits();

        // The process ends with its last thread.
        if self.exit_status.is_none()
            && self.threads.values().all(EmulatedThread::is_terminated)
        {
            self.exit_status = Some(exit_code);
        }

        log::debug!("thread {tid} terminated with exit code {exit_code:#x}");
        Ok(())
    }

    /// Increments a thread's suspend count; returns the previous count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an unknown or terminated TID.
    pub fn suspend_thread(&mut self, tid: u32) -> Result<u32> {
        let thread = self
            .threads
            .get_mut(&tid)
            .filter(|thread| !thread.is_terminated())
            .ok_or_else(|| Error::InvalidParameter(format!("unknown thread {tid}")))?;
        let previous = thread.suspend_count;
        thread.suspend_count += 1;
        Ok(previous)
    }

    /// Decrements a thread's suspend count; returns the previous count. A thread
    /// whose count returns to zero becomes schedulable again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an unknown or terminated TID.
    pub fn resume_thread(&mut self, tid: u32) -> Result<u32> {
        let thread = self
            .threads
            .get_mut(&tid)
            .filter(|thread| !thread.is_terminated())
            .ok_or_else(|| Error::InvalidParameter(format!("unknown thread {tid}")))?;
        let previous = thread.suspend_count;
        thread.suspend_count = thread.suspend_count.saturating_sub(1);
        let now_runnable = thread.suspend_count == 0 && thread.state == WaitState::Runnable;
        if now_runnable && previous > 0 && self.active_tid != Some(tid) {
            self.enqueue_ready(tid);
        }
        Ok(previous)
    }

    /// Evaluates an object's signal state, resolving thread objects against the
    /// thread table.
    #[must_use]
    pub fn object_signaled(&self, id: ObjectId) -> bool {
        match self.objects.get(id) {
            Some(KernelObject::Thread(tid)) => self
                .threads
                .get(tid)
                .is_none_or(EmulatedThread::is_terminated),
            Some(object) => object.signal_state(),
            None => true,
        }
    }

    /// Consumes an object's signal for a completing wait; returns `true` when an
    /// abandoned mutant was acquired.
    pub fn acquire_object(&mut self, id: ObjectId, tid: u32) -> bool {
        self.objects
            .get_mut(id)
            .map(|object| object.acquire(tid))
            .unwrap_or(false)
    }

    /// Resolves a guest handle value to the entry in the handle table, resolving
    /// the thread pseudo-handle to the active thread's object.
    #[must_use]
    pub fn resolve_handle(&self, raw: u64) -> Option<&crate::process::handle::HandleEntry> {
        if Handle::is_pseudo(raw) {
            return None;
        }
        self.handles.get(Handle::from_raw(raw as u32))
    }

    /// Allocates an object and a handle to it in one step.
    pub fn insert_object(&mut self, object: KernelObject, access: u32, inherit: bool) -> Handle {
        let ty = object.type_tag();
        let id = self.objects.insert(object);
        self.handles.insert(id, ty, access, inherit)
    }

    /// Closes a handle, dropping the object reference. The object is destroyed
    /// when the last handle closes; waiters on a destroyed object are
    /// re-evaluated.
    ///
    /// Returns `false` for an invalid handle.
    pub fn close_handle(&mut self, raw: u64) -> bool {
        if Handle::is_pseudo(raw) {
            // Closing a pseudo-handle is a successful no-op.
            return true;
        }
        let handle = Handle::from_raw(raw as u32);
        let Some(entry) = self.handles.remove(handle) else {
            return false;
        };
        if let Some(object) = self.objects.release(entry.object) {
            log::trace!("destroyed {} object {:?}", object.type_name(), entry.object);
            // Waiters on the vanished object complete: mutant waiters observe
            // abandonment, everything else completes successfully through the
            // re-evaluation below (a missing object reads as signaled).
            if matches!(object, KernelObject::Mutant(_)) {
                let waiting: Vec<(u32, usize)> = self
                    .threads
                    .iter()
                    .filter_map(|(tid, thread)| {
                        thread
                            .wait
                            .as_ref()
                            .and_then(|wait| {
                                wait.objects.iter().position(|&object| object == entry.object)
                            })
                            .map(|index| (*tid, index))
                    })
                    .collect();
                for (tid, index) in waiting {
                    self.complete_wait(tid, NtStatus::ABANDONED_WAIT_0.biased(index));
                }
            }
        }
        self.check_waits();
        true
    }

    /// Steps the deterministic RNG (xorshift64*).
    pub fn next_rand(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Returns the next TID that would be allocated (snapshot support).
    #[must_use]
    pub fn next_tid(&self) -> u32 {
        self.next_tid
    }

    /// Overrides the TID allocator (snapshot restore).
    pub fn set_next_tid(&mut self, next_tid: u32) {
        self.next_tid = next_tid;
    }
}
