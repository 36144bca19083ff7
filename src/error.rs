use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into three classes with strictly separated propagation paths:
///
/// - **Guest faults** ([`Error::GuestFault`]) never reach the host caller directly; the run
///   loop converts them into NT exceptions dispatched inside the emulated process. The
///   variant exists so that internal layers can report them upward to the dispatcher.
/// - **Emulation errors** ([`Error::ImageLoad`], [`Error::InvalidAddress`],
///   [`Error::Snapshot`], [`Error::Engine`], [`Error::Deadlock`], ...) terminate the run
///   loop and surface to the caller of `start`.
/// - **Host I/O errors** ([`Error::FileError`]) are translated to the closest NTSTATUS when
///   they occur inside a syscall handler; outside of one they propagate unchanged.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter failed validation (unaligned address, zero size, bad range).
    ///
    /// Inside syscall handlers this maps to `STATUS_INVALID_PARAMETER`; on the
    /// public API it is returned directly.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An address did not refer to usable guest memory for the attempted operation.
    #[error("Invalid address {address:#x}: {reason}")]
    InvalidAddress {
        /// The guest virtual address that was rejected
        address: u64,
        /// Why the address was rejected
        reason: String,
    },

    /// The guest performed an access that violates page protection.
    ///
    /// This is a guest fault: the run loop turns it into an NT access-violation
    /// exception raised into the active thread, never into a host failure.
    #[error("Guest access violation at {address:#x}")]
    GuestFault {
        /// The faulting guest virtual address
        address: u64,
        /// Whether the faulting access was a write
        write: bool,
    },

    /// A PE image could not be loaded into the emulated address space.
    ///
    /// Carries the module name and the cause. Partial state has been rolled
    /// back when this is returned: regions reserved for the image are released.
    #[error("Failed to load image '{module}': {reason}")]
    ImageLoad {
        /// Name of the module that failed to load
        module: String,
        /// Description of the failure
        reason: String,
    },

    /// The guest address space has no free range large enough for a request.
    #[error("Guest address space exhausted (requested {0:#x} bytes)")]
    AddressSpaceExhausted(u64),

    /// A snapshot byte stream was rejected (bad magic, version, CRC or framing).
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// The CPU emulation engine reported a failure the core cannot recover from.
    #[error("CPU engine error: {0}")]
    Engine(String),

    /// No thread is runnable and no waiting thread has a deadline.
    #[error("Process deadlocked: all threads are waiting without a deadline")]
    Deadlock,

    /// The emulator has no active thread but one is required.
    #[error("No active thread")]
    NoActiveThread,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors raised while reading module files or the
    /// filesystem view backing the guest root.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Other(String),
}
