//! The service table: NT service number → named handler.
//!
//! Service numbers follow the Windows 10 x64 layout for the services in the low,
//! stable range; numbers above it drift between builds, so those entries use the
//! values of the build the emulator models. The table is data: remapping a service
//! number for a different guest build is a [`ServiceTable::register`] call.

use rustc_hash::FxHashMap;

use crate::syscalls::{context::SyscallOutcome, handlers, SyscallContext};

/// A syscall handler function.
pub type SyscallHandler = fn(&mut SyscallContext<'_>) -> crate::Result<SyscallOutcome>;

/// One service table entry.
#[derive(Clone, Copy)]
pub struct SyscallEntry {
    /// Service name (e.g. `"NtClose"`).
    pub name: &'static str,
    /// The handler implementing it.
    pub handler: SyscallHandler,
    /// Number of arguments, for verbose-mode decoding.
    pub arity: u8,
}

impl std::fmt::Debug for SyscallEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallEntry")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Mapping from NT service index to handler.
#[derive(Debug, Default)]
pub struct ServiceTable {
    entries: FxHashMap<u32, SyscallEntry>,
}

impl ServiceTable {
    /// Builds the default table for the modeled guest build.
    #[must_use]
    pub fn windows_default() -> Self {
        let mut table = Self::default();
        let mut add = |id: u32, name: &'static str, handler: SyscallHandler, arity: u8| {
            table.register(id, SyscallEntry { name, handler, arity });
        };

        add(0x04, "NtWaitForSingleObject", handlers::object::nt_wait_for_single_object, 3);
        add(0x06, "NtReadFile", handlers::io::nt_read_file, 9);
        add(0x08, "NtWriteFile", handlers::io::nt_write_file, 9);
        add(0x0A, "NtReleaseSemaphore", handlers::object::nt_release_semaphore, 3);
        add(0x0E, "NtSetEvent", handlers::object::nt_set_event, 2);
        add(0x0F, "NtClose", handlers::object::nt_close, 1);
        add(0x18, "NtAllocateVirtualMemory", handlers::memory::nt_allocate_virtual_memory, 6);
        add(0x19, "NtQueryInformationProcess", handlers::process::nt_query_information_process, 5);
        add(0x1E, "NtFreeVirtualMemory", handlers::memory::nt_free_virtual_memory, 4);
        add(0x20, "NtReleaseMutant", handlers::object::nt_release_mutant, 2);
        add(0x23, "NtQueryVirtualMemory", handlers::memory::nt_query_virtual_memory, 6);
        add(0x25, "NtQueryInformationThread", handlers::thread::nt_query_information_thread, 5);
        add(0x2C, "NtTerminateProcess", handlers::process::nt_terminate_process, 2);
        add(0x31, "NtQueryPerformanceCounter", handlers::process::nt_query_performance_counter, 2);
        add(0x34, "NtDelayExecution", handlers::thread::nt_delay_execution, 2);
        add(0x3C, "NtDuplicateObject", handlers::object::nt_duplicate_object, 7);
        add(0x3E, "NtClearEvent", handlers::object::nt_clear_event, 1);
        add(0x43, "NtContinue", handlers::process::nt_continue, 2);
        add(0x45, "NtQueueApcThread", handlers::thread::nt_queue_apc_thread, 5);
        add(0x46, "NtYieldExecution", handlers::thread::nt_yield_execution, 0);
        add(0x48, "NtCreateEvent", handlers::object::nt_create_event, 5);
        add(0x50, "NtProtectVirtualMemory", handlers::memory::nt_protect_virtual_memory, 5);
        add(0x52, "NtResumeThread", handlers::thread::nt_resume_thread, 2);
        add(0x53, "NtTerminateThread", handlers::thread::nt_terminate_thread, 2);
        add(0x56, "NtQueryEvent", handlers::object::nt_query_event, 5);
        add(0x5A, "NtWaitForMultipleObjects", handlers::object::nt_wait_for_multiple_objects, 5);
        add(0x61, "NtSetTimer", handlers::object::nt_set_timer, 7);
        add(0x60, "NtCancelTimer", handlers::object::nt_cancel_timer, 2);
        add(0xB3, "NtCreateMutant", handlers::object::nt_create_mutant, 4);
        add(0xC1, "NtCreateSemaphore", handlers::object::nt_create_semaphore, 5);
        add(0xC2, "NtCreateThreadEx", handlers::thread::nt_create_thread_ex, 11);
        add(0xC6, "NtCreateTimer", handlers::object::nt_create_timer, 4);
        add(0x152, "NtPulseEvent", handlers::object::nt_pulse_event, 2);
        add(0x15A, "NtQuerySystemTime", handlers::process::nt_query_system_time, 1);
        add(0x16D, "NtResetEvent", handlers::object::nt_reset_event, 2);
        add(0x163, "NtRaiseException", handlers::process::nt_raise_exception, 3);
        add(0x1BA, "NtSuspendThread", handlers::thread::nt_suspend_thread, 2);
        add(0x1C1, "NtTestAlert", handlers::thread::nt_test_alert, 0);

        table
    }

    /// Registers (or remaps) a service entry.
    pub fn register(&mut self, id: u32, entry: SyscallEntry) {
        self.entries.insert(id, entry);
    }

    /// Looks up a service entry by index.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&SyscallEntry> {
        self.entries.get(&id)
    }

    /// Finds the service index registered for `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| *id)
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
