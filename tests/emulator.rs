//! End-to-end scenarios: scripted guests executing through the full facade.

mod common;

use std::sync::{Arc, Mutex};

use common::{
    make_emulator, service_id, Asm, GuestImage, DATA_VA, R10, R12, R13, R14, R15, R8, R9, RAX,
    RDATA_VA, RDX, TEXT_VA,
};
use ntcradle::{ApplicationSettings, EmulationOutcome, Error};

const CURRENT_PROCESS: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Address of `RTL_USER_PROCESS_PARAMETERS` in the deterministic test layout:
/// the PEB takes the first reservation (0x10000), the parameter block the next.
const PARAMS_VA: u64 = 0x20000;
const STANDARD_OUTPUT: u64 = PARAMS_VA + 0x28;

fn capture_stdout(emulator: &mut ntcradle::Emulator) -> Arc<Mutex<Vec<u8>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    emulator.callbacks.on_stdout = Some(Box::new(move |bytes| {
        sink.lock().unwrap().extend_from_slice(bytes);
    }));
    captured
}

fn load(emulator: &mut ntcradle::Emulator, image: Vec<u8>) {
    emulator
        .load_application_image(&image, "app.exe", &ApplicationSettings::default())
        .unwrap();
}

/// Guest that writes `hi\n` to standard output and exits cleanly.
fn hello_world_code() -> Vec<u8> {
    let mut asm = Asm::new(TEXT_VA);
    asm.load(R12, STANDARD_OUTPUT)
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, 0)
        .store_rsp(0x28, DATA_VA + 0x20) // IO_STATUS_BLOCK
        .store_rsp(0x30, RDATA_VA) // buffer
        .store_rsp(0x38, 3) // length
        .store_rsp(0x40, 0)
        .store_rsp(0x48, 0)
        .mov(RAX, service_id("NtWriteFile"))
        .syscall()
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();
    asm.bytes()
}

#[test]
fn hello_world_writes_stdout_and_exits_zero() {
    let mut emulator = make_emulator(1000);
    let captured = capture_stdout(&mut emulator);

    let image = GuestImage::new().code(hello_world_code()).rdata(0, b"hi\n").build();
    load(&mut emulator, image);

    let outcome = emulator.start(None, 0).unwrap();
    assert_eq!(outcome, EmulationOutcome::Exited(0));
    assert_eq!(captured.lock().unwrap().as_slice(), b"hi\n");

    // The IO_STATUS_BLOCK reports a 3-byte transfer.
    assert_eq!(emulator.read_memory_u64(DATA_VA + 0x20).unwrap(), 0);
    assert_eq!(emulator.read_memory_u64(DATA_VA + 0x28).unwrap(), 3);
}

/// Builds the event ping-pong guest: the main thread creates two auto-reset
/// events and a second thread, then the two alternate `SetEvent`/`Wait` for
/// `iterations` rounds; main joins the worker and exits 0.
fn ping_pong_image(iterations: u64) -> Vec<u8> {
    let worker_entry = TEXT_VA + 0x300;

    let mut main = Asm::new(TEXT_VA);
    // NtCreateEvent(&data[0], 0, 0, SynchronizationEvent, FALSE)
    main.mov(R10, DATA_VA)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, 1)
        .store_rsp(0x28, 0)
        .mov(RAX, service_id("NtCreateEvent"))
        .syscall();
    // NtCreateEvent(&data[8], ...)
    main.mov(R10, DATA_VA + 8)
        .mov(R9, 1)
        .mov(RAX, service_id("NtCreateEvent"))
        .syscall();
    // NtCreateThreadEx(&data[16], 0, 0, CurrentProcess, worker, 0, 0, ...)
    main.store_rsp(0x28, worker_entry)
        .store_rsp(0x30, 0)
        .store_rsp(0x38, 0)
        .store_rsp(0x40, 0)
        .store_rsp(0x48, 0)
        .store_rsp(0x50, 0)
        .store_rsp(0x58, 0)
        .mov(R10, DATA_VA + 16)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(R9, CURRENT_PROCESS)
        .mov(RAX, service_id("NtCreateThreadEx"))
        .syscall();
    main.load(R12, DATA_VA) // event A
        .load(R13, DATA_VA + 8) // event B
        .mov(R15, iterations);
    let main_loop = main.here();
    main.movr(R10, R12)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtSetEvent"))
        .syscall() // set A
        .movr(R10, R13)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall() // wait B
        .dec_jnz(R15, main_loop);
    // Join the worker, then exit.
    main.load(R14, DATA_VA + 16)
        .movr(R10, R14)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    let main_code = main.bytes();
    assert!(main_code.len() <= 0x300, "main does not fit below the worker");

    let mut worker = Asm::new(worker_entry);
    worker
        .load(R12, DATA_VA)
        .load(R13, DATA_VA + 8)
        .mov(R15, iterations);
    let worker_loop = worker.here();
    worker
        .movr(R10, R12)
        .mov(RDX, 0)
        .mov(R8, 0)
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall() // wait A
        .movr(R10, R13)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtSetEvent"))
        .syscall() // set B
        .dec_jnz(R15, worker_loop);
    worker
        .mov(R10, 0)
        .mov(RDX, 0x2A)
        .mov(RAX, service_id("NtTerminateThread"))
        .syscall();

    let mut code = main_code;
    code.resize(0x300, 0x90);
    code.extend_from_slice(&worker.bytes());
    GuestImage::new().code(code).build()
}

#[test]
fn thread_ping_pong_completes_deterministically() {
    let run = || {
        let mut emulator = make_emulator(1000);
        load(&mut emulator, ping_pong_image(100));
        let outcome = emulator.start(None, 0).unwrap();
        assert_eq!(outcome, EmulationOutcome::Exited(0));

        // Both threads ran and terminated; the worker carried its exit code.
        let threads: Vec<_> = emulator.process.threads.values().collect();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|thread| thread.is_terminated()));
        let worker = threads
            .iter()
            .find(|thread| thread.exit_code == Some(0x2A))
            .expect("worker thread exit code");
        assert!(worker.instructions > 0);

        // Deterministic signature of the run: per-thread instruction counts and
        // the final clock.
        let counts: Vec<u64> = threads.iter().map(|thread| thread.instructions).collect();
        (counts, emulator.process.clocks.steady_time())
    };

    let first = run();
    let second = run();
    assert_eq!(first, second, "fixed quantum and relative time reproduce runs");
}

#[test]
fn memory_protection_fault_terminates_with_access_violation() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
    // NtAllocateVirtualMemory(CurrentProcess, &base, 0, &size, COMMIT|RESERVE, RW)
    asm.mov(R10, CURRENT_PROCESS)
        .mov(RDX, DATA_VA) // base cell = 0x500000
        .mov(R8, 0)
        .mov(R9, DATA_VA + 8) // size cell = 0x1000
        .store_rsp(0x28, 0x3000)
        .store_rsp(0x30, 0x04) // PAGE_READWRITE
        .mov(RAX, service_id("NtAllocateVirtualMemory"))
        .syscall()
        // First write succeeds.
        .store(0x500000, 0xDEAD)
        // NtProtectVirtualMemory(CurrentProcess, &base, &size, PAGE_READONLY, &old)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, DATA_VA)
        .mov(R8, DATA_VA + 8)
        .mov(R9, 0x02)
        .store_rsp(0x28, DATA_VA + 0x10)
        .mov(RAX, service_id("NtProtectVirtualMemory"))
        .syscall()
        // Second write faults; with no SEH dispatcher mapped the process dies
        // with the exception code.
        .store(0x500000, 0xBEEF)
        .hlt();

    let image = GuestImage::new()
        .code(asm.bytes())
        .data_u64(0, 0x500000)
        .data_u64(8, 0x1000)
        .build();
    load(&mut emulator, image);

    let outcome = emulator.start(None, 0).unwrap();
    assert_eq!(outcome, EmulationOutcome::Exited(0xC000_0005));

    // The first write landed; the second never did.
    assert_eq!(emulator.read_memory_u64(0x500000).unwrap(), 0xDEAD);
    // The old protection was reported as PAGE_READWRITE.
    let mut old = [0u8; 4];
    emulator.read_memory(DATA_VA + 0x10, &mut old).unwrap();
    assert_eq!(u32::from_le_bytes(old), 0x04);
}

#[test]
fn sleep_fast_forwards_relative_clock() {
    let mut emulator = make_emulator(1000);

    // 1ms relative delay: negative interval of 10_000 ticks.
    let interval = (-10_000i64) as u64;
    let mut asm = Asm::new(TEXT_VA);
    asm.mov(RDX, DATA_VA) // interval pointer
        .mov(R10, 0) // alertable = false
        .mov(RAX, service_id("NtDelayExecution"))
        .syscall()
        .store_reg(DATA_VA + 0x10, RAX)
        .mov(R10, CURRENT_PROCESS)
        .mov(RDX, 0)
        .mov(RAX, service_id("NtTerminateProcess"))
        .syscall();

    let image = GuestImage::new()
        .code(asm.bytes())
        .data_u64(0, interval)
        .build();
    load(&mut emulator, image);

    let outcome = emulator.start(None, 0).unwrap();
    assert_eq!(outcome, EmulationOutcome::Exited(0));
    assert!(
        emulator.process.clocks.steady_time() >= 10_000,
        "clock fast-forwarded past the sleep deadline"
    );

    // The delay completed with STATUS_SUCCESS.
    assert_eq!(emulator.read_memory_u64(DATA_VA + 0x10).unwrap(), 0);
}

#[test]
fn wait_without_signal_deadlocks() {
    let mut emulator = make_emulator(1000);

    let mut asm = Asm::new(TEXT_VA);
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
        .mov(R8, 0) // infinite timeout
        .mov(RAX, service_id("NtWaitForSingleObject"))
        .syscall()
        .hlt();

    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());
    assert!(matches!(emulator.start(None, 0), Err(Error::Deadlock)));
}

#[test]
fn port_mappings_rewrite_both_directions() {
    let mut emulator = make_emulator(1000);

    emulator.map_port(8080, 80);
    assert_eq!(emulator.get_host_port(8080), 80);
    assert_eq!(emulator.get_emulator_port(80), 8080);
    // Unmapped ports pass through.
    assert_eq!(emulator.get_host_port(443), 443);
    assert_eq!(emulator.get_emulator_port(443), 443);

    // Mapping a port onto itself removes the entry.
    emulator.map_port(8080, 8080);
    assert_eq!(emulator.get_host_port(8080), 8080);
}

#[test]
fn instruction_budget_and_quantum_rotation() {
    let mut emulator = make_emulator(10);

    // A guest spinning forever.
    let mut asm = Asm::new(TEXT_VA);
    let top = asm.here();
    asm.nop().nop().nop().jmp(top);
    load(&mut emulator, GuestImage::new().code(asm.bytes()).build());

    let outcome = emulator.start(None, 250).unwrap();
    assert_eq!(outcome, EmulationOutcome::InstructionLimit);

    let main = emulator.process.threads.values().next().unwrap();
    assert_eq!(main.instructions, 250);
    assert_eq!(emulator.process.clocks.steady_time(), 250);
}
