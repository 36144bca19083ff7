//! # ntcradle Prelude
//!
//! Convenient re-exports of the types nearly every embedder touches: the emulator
//! facade and its configuration, the CPU engine seam, and the core data types of
//! the memory, module, process and syscall subsystems.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all ntcradle operations
pub use crate::Error;

/// The result type used throughout ntcradle
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The emulator facade
pub use crate::emulator::Emulator;

/// Emulator and application configuration
pub use crate::emulator::{
    ApplicationSettings, EmulationOutcome, EmulatorCallbacks, EmulatorSettings, SyscallVerdict,
};

// ================================================================================================
// CPU Engine Seam
// ================================================================================================

/// The interface consumed from the external CPU engine
pub use crate::cpu::{AccessKind, CpuEngine, CpuExit, CpuStep, X64Register};

// ================================================================================================
// Memory
// ================================================================================================

/// Virtual memory management types
pub use crate::memory::{
    MemoryBasicInformation, MemoryManager, MemoryProtection, MemoryRegion, RegionState, RegionTag,
    PAGE_SIZE,
};

// ================================================================================================
// Modules
// ================================================================================================

/// PE image loading types
pub use crate::module::{Module, ModuleManager, PeFile};

// ================================================================================================
// Process
// ================================================================================================

/// Process, thread and kernel object types
pub use crate::process::{
    EmulatedThread, Handle, HandleTable, HandleType, KernelObject, ObjectId, ProcessClocks,
    ProcessContext, WaitKind, WaitState,
};

// ================================================================================================
// Syscalls
// ================================================================================================

/// Syscall dispatch types
pub use crate::syscalls::{
    NtStatus, ServiceTable, SyscallContext, SyscallDispatcher, SyscallOutcome,
};
