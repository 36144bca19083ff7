//! Syscall dispatch behavior: unknown services, stub intercepts, zero-timeout
//! waits and status marshaling, driven through scripted guests.

mod common;

use std::sync::{Arc, Mutex};

use common::{make_emulator, service_id, Asm, GuestImage, DATA_VA, R10, R12, R8, R9, RAX, RDX, TEXT_VA};
use ntcradle::{
    ApplicationSettings, EmulationOutcome, NtStatus, SyscallVerdict,
};

const CURRENT_PROCESS: u64 = 0xFFFF_FFFF_FFFF_FFFF;

fn load(emulator: &mut ntcradle::Emulator, image: Vec<u8>) {
    emulator
        .load_application_image(&image, "app.exe", &ApplicationSettings::default())
        .unwrap();
}

#[test]
fn unknown_syscall_reports_and_skips_with_status() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    asm.mov(RAX, 0x1FFF);
    let syscall_site = asm.here();
    asm.syscall()
        .store_reg(DATA_VA, RAX) // capture the delivered status
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    let seen: Arc<Mutex<Vec<(u32, u64, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    emulator.callbacks.on_syscall = Some(Box::new(move |id, address, module, name| {
        sink.lock()
            .unwrap()
            .push((id, address, module.to_string(), name.to_string()));
        SyscallVerdict::Skip(NtStatus::NOT_IMPLEMENTED)
    }));

    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());
    let outcome = emulator.start(None, 0).unwrap();
    assert_eq!(outcome, EmulationOutcome::Exited(0));

    // The callback observed (id, rip, module name, "").
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 0x1FFF);
    assert_eq!(seen[0].1, syscall_site);
    assert_eq!(seen[0].2, "app.exe");
    assert_eq!(seen[0].3, "");

    // The guest saw STATUS_NOT_IMPLEMENTED in RAX and RIP advanced past the
    // instruction (execution continued to the terminate call).
    assert_eq!(
        emulator.read_memory_u64(DATA_VA).unwrap(),
        u64::from(NtStatus::NOT_IMPLEMENTED.0)
    );
}

#[test]
fn unknown_syscall_continue_reads_as_success() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    asm.mov(RAX, 0x1FFF)
        .syscall()
        .store_reg(DATA_VA, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    emulator.callbacks.on_syscall = Some(Box::new(|_, _, _, _| SyscallVerdict::Continue));
    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());
    emulator.start(None, 0).unwrap();

    assert_eq!(emulator.read_memory_u64(DATA_VA).unwrap(), 0);
}

#[test]
fn unknown_syscall_abort_stops_emulation() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    asm.mov(RAX, 0x1FFF).syscall().hlt();

    emulator.callbacks.on_syscall = Some(Box::new(|_, _, _, _| SyscallVerdict::Abort));
    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());

    assert!(matches!(
        emulator.start(None, 0),
        Err(ntcradle::Error::Engine(_))
    ));
}

#[test]
fn zero_timeout_wait_returns_timeout_immediately() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    // Auto-reset event, not signaled.
    asm.mov(R10, DATA_VA)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, 1)
        .store_rsp(0x28, 0)
        .mov(RAX, service_id("NtCreateEvent"))
        .syscall()
        .load(R12, DATA_VA)
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, DATA_VA + 0x20) // timeout cell: zero = poll
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .store_reg(DATA_VA + 0x28, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    let image = GuestImage::new()
        .code(asm.bytes())
        .data_u64(0x20, 0)
        .build();
    load(&mut emulator, image);
    let outcome = emulator.start(None, 0).unwrap();

    assert_eq!(outcome, EmulationOutcome::Exited(0));
    assert_eq!(
        emulator.read_memory_u64(DATA_VA + 0x28).unwrap(),
        u64::from(NtStatus::TIMEOUT.0)
    );
    // No clock movement from waiting: the poll never blocked.
    let threads: Vec<_> = emulator.process.threads.values().collect();
    assert_eq!(threads.len(), 1, "no switch target ever existed");
}

#[test]
fn signaled_wait_completes_inline_with_wait_0() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    asm.mov(R10, DATA_VA)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, 1)
        .store_rsp(0x28, 1) // initially signaled
        .mov(RAX, service_id("NtCreateEvent"))
        .syscall()
        .load(R12, DATA_VA)
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, 0) // infinite timeout, but already signaled
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .store_reg(DATA_VA + 0x28, RAX)
        // A second poll must now time out: the auto-reset event was consumed.
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, DATA_VA + 0x20)
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .store_reg(DATA_VA + 0x30, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    let image = GuestImage::new()
        .code(asm.bytes())
        .data_u64(0x20, 0)
        .build();
    load(&mut emulator, image);
    emulator.start(None, 0).unwrap();

    assert_eq!(emulator.read_memory_u64(DATA_VA + 0x28).unwrap(), 0);
    assert_eq!(
        emulator.read_memory_u64(DATA_VA + 0x30).unwrap(),
        u64::from(NtStatus::TIMEOUT.0)
    );
}

#[test]
fn reset_event_drops_signal_and_reports_previous_state() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    // Notification event, initially signaled.
    asm.mov(R10, DATA_VA)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, 0) // NotificationEvent
        .store_rsp(0x28, 1) // initially signaled
        .mov(RAX, service_id("NtCreateEvent"))
        .syscall()
        .load(R12, DATA_VA)
        // NtResetEvent(handle, &previous)
        .movr(R10, R12)
        .mov(RDX, DATA_VA + 0x38)
        .mov(RAX, service_id("NtResetEvent"))
        .syscall()
        .store_reg(DATA_VA + 0x40, RAX)
        // A poll must now time out: the signal is gone.
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, DATA_VA + 0x20) // timeout cell: zero = poll
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .store_reg(DATA_VA + 0x48, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    let image = GuestImage::new()
        .code(asm.bytes())
        .data_u64(0x20, 0)
        .build();
    load(&mut emulator, image);
    let outcome = emulator.start(None, 0).unwrap();

    assert_eq!(outcome, EmulationOutcome::Exited(0));
    assert_eq!(emulator.read_memory_u64(DATA_VA + 0x40).unwrap(), 0);
    // PreviousState observed the event as signaled.
    let mut previous = [0u8; 4];
    emulator.read_memory(DATA_VA + 0x38, &mut previous).unwrap();
    assert_eq!(u32::from_le_bytes(previous), 1);
    assert_eq!(
        emulator.read_memory_u64(DATA_VA + 0x48).unwrap(),
        u64::from(NtStatus::TIMEOUT.0)
    );
}

#[test]
fn oversized_write_length_is_rejected_not_allocated() {
    let mut emulator = make_emulator(1000);

    // NtWriteFile on stdout with a guest-controlled absurd Length. The service
    // must fail with a status, not size a host buffer from the raw value.
    let mut asm = Asm::new(TEXT_VA);
    asm.load(R12, 0x20000 + 0x28) // StandardOutput from process parameters
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, 0)
        .store_rsp(0x28, 0) // no IO_STATUS_BLOCK
        .store_rsp(0x30, DATA_VA) // buffer
        .store_rsp(0x38, 0xFFFF_FFFF_FFFF_0000) // length
        .store_rsp(0x40, 0)
        .store_rsp(0x48, 0)
        .mov(RAX, service_id("NtWriteFile"))
        .syscall()
        .store_reg(DATA_VA + 0x10, RAX)
        // A committed-but-shorter-than-claimed buffer is also rejected.
        .store_rsp(0x38, 0x100000) // 1 MiB claimed against a 4 KiB section
        .mov(RAX, service_id("NtWriteFile"))
        .syscall()
        .store_reg(DATA_VA + 0x18, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());
    let outcome = emulator.start(None, 0).unwrap();

    assert_eq!(outcome, EmulationOutcome::Exited(0));
    assert_eq!(
        emulator.read_memory_u64(DATA_VA + 0x10).unwrap(),
        u64::from(NtStatus::INVALID_PARAMETER.0)
    );
    assert_eq!(
        emulator.read_memory_u64(DATA_VA + 0x18).unwrap(),
        u64::from(NtStatus::ACCESS_VIOLATION.0)
    );
}

#[test]
fn invalid_handle_status_for_bad_wait() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    asm.mov(R10, 0x12345) // never-issued handle value
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .store_reg(DATA_VA, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());
    emulator.start(None, 0).unwrap();

    assert_eq!(
        emulator.read_memory_u64(DATA_VA).unwrap(),
        u64::from(NtStatus::INVALID_HANDLE.0)
    );
}

#[test]
fn query_virtual_memory_from_the_guest() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    // Query the image base itself.
    asm.mov(R10, CURRENT_PROCESS)
        .mov(RDX, common::IMAGE_BASE)
        .mov(R8, 0) // MemoryBasicInformation
        .mov(R9, DATA_VA) // buffer
        .store_rsp(0x28, 0x30) // length
        .store_rsp(0x30, 0) // no return length
        .mov(RAX, service_id("NtQueryVirtualMemory"))
        .syscall()
        .store_reg(DATA_VA + 0x40, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());
    emulator.start(None, 0).unwrap();

    assert_eq!(emulator.read_memory_u64(DATA_VA + 0x40).unwrap(), 0);
    // MEMORY_BASIC_INFORMATION: BaseAddress, AllocationBase, then state/type.
    assert_eq!(
        emulator.read_memory_u64(DATA_VA).unwrap(),
        common::IMAGE_BASE
    );
    assert_eq!(
        emulator.read_memory_u64(DATA_VA + 8).unwrap(),
        common::IMAGE_BASE
    );
    let state = emulator.read_memory_u64(DATA_VA + 0x20).unwrap() as u32;
    assert_eq!(state, 0x1000); // MEM_COMMIT
    let kind = emulator.read_memory_u64(DATA_VA + 0x28).unwrap() as u32;
    assert_eq!(kind, 0x100_0000); // MEM_IMAGE
}
