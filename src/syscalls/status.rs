//! NTSTATUS values returned by emulated system services.

/// A 32-bit NT status code.
///
/// Severity lives in the top two bits: `00` success, `01` informational, `10`
/// warning, `11` error. Comparison and formatting are defined on the raw value;
/// well-known codes print their names.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

#[allow(missing_docs)]
impl NtStatus {
    pub const SUCCESS: NtStatus = NtStatus(0x0000_0000);
    /// `STATUS_WAIT_0`; wait satisfied by object index 0. Indexes bias upward.
    pub const WAIT_0: NtStatus = NtStatus(0x0000_0000);
    pub const ABANDONED_WAIT_0: NtStatus = NtStatus(0x0000_0080);
    pub const USER_APC: NtStatus = NtStatus(0x0000_00C0);
    pub const ALERTED: NtStatus = NtStatus(0x0000_0101);
    pub const TIMEOUT: NtStatus = NtStatus(0x0000_0102);
    pub const PENDING: NtStatus = NtStatus(0x0000_0103);
    pub const NO_YIELD_PERFORMED: NtStatus = NtStatus(0x4000_0024);

    pub const GUARD_PAGE_VIOLATION: NtStatus = NtStatus(0x8000_0001);
    pub const BREAKPOINT: NtStatus = NtStatus(0x8000_0003);
    pub const SINGLE_STEP: NtStatus = NtStatus(0x8000_0004);

    pub const UNSUCCESSFUL: NtStatus = NtStatus(0xC000_0001);
    pub const NOT_IMPLEMENTED: NtStatus = NtStatus(0xC000_0002);
    pub const INVALID_INFO_CLASS: NtStatus = NtStatus(0xC000_0003);
    pub const INFO_LENGTH_MISMATCH: NtStatus = NtStatus(0xC000_0004);
    pub const ACCESS_VIOLATION: NtStatus = NtStatus(0xC000_0005);
    pub const INVALID_HANDLE: NtStatus = NtStatus(0xC000_0008);
    pub const INVALID_PARAMETER: NtStatus = NtStatus(0xC000_000D);
    pub const END_OF_FILE: NtStatus = NtStatus(0xC000_0011);
    pub const NO_MEMORY: NtStatus = NtStatus(0xC000_0017);
    pub const CONFLICTING_ADDRESSES: NtStatus = NtStatus(0xC000_0018);
    pub const UNABLE_TO_FREE_VM: NtStatus = NtStatus(0xC000_001A);
    pub const ILLEGAL_INSTRUCTION: NtStatus = NtStatus(0xC000_001D);
    pub const ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022);
    pub const BUFFER_TOO_SMALL: NtStatus = NtStatus(0xC000_0023);
    pub const OBJECT_TYPE_MISMATCH: NtStatus = NtStatus(0xC000_0024);
    pub const NOT_COMMITTED: NtStatus = NtStatus(0xC000_002D);
    pub const OBJECT_NAME_NOT_FOUND: NtStatus = NtStatus(0xC000_0034);
    pub const MUTANT_NOT_OWNED: NtStatus = NtStatus(0xC000_0046);
    pub const SEMAPHORE_LIMIT_EXCEEDED: NtStatus = NtStatus(0xC000_0047);
    pub const THREAD_IS_TERMINATING: NtStatus = NtStatus(0xC000_004B);
    pub const INVALID_PAGE_PROTECTION: NtStatus = NtStatus(0xC000_0045);
    pub const MEMORY_NOT_ALLOCATED: NtStatus = NtStatus(0xC000_00A0);
    pub const NOT_SUPPORTED: NtStatus = NtStatus(0xC000_00BB);
    pub const INTEGER_DIVIDE_BY_ZERO: NtStatus = NtStatus(0xC000_0094);
    pub const DLL_NOT_FOUND: NtStatus = NtStatus(0xC000_0135);
    pub const ENTRYPOINT_NOT_FOUND: NtStatus = NtStatus(0xC000_0139);
    pub const PROCESS_IS_TERMINATING: NtStatus = NtStatus(0xC000_010A);
    pub const STACK_OVERFLOW: NtStatus = NtStatus(0xC000_00FD);

    /// Returns `true` for success and informational severities.
    #[must_use]
    pub fn is_success(self) -> bool {
        (self.0 >> 30) <= 1
    }

    /// Returns `true` for the error severity.
    #[must_use]
    pub fn is_error(self) -> bool {
        (self.0 >> 30) == 3
    }

    /// Biases a wait-completion status by the index of the satisfying object
    /// (`STATUS_WAIT_0 + index`, `STATUS_ABANDONED_WAIT_0 + index`).
    #[must_use]
    pub fn biased(self, index: usize) -> NtStatus {
        NtStatus(self.0 + index as u32)
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            NtStatus::SUCCESS => "STATUS_SUCCESS",
            NtStatus::ABANDONED_WAIT_0 => "STATUS_ABANDONED_WAIT_0",
            NtStatus::USER_APC => "STATUS_USER_APC",
            NtStatus::ALERTED => "STATUS_ALERTED",
            NtStatus::TIMEOUT => "STATUS_TIMEOUT",
            NtStatus::PENDING => "STATUS_PENDING",
            NtStatus::NO_YIELD_PERFORMED => "STATUS_NO_YIELD_PERFORMED",
            NtStatus::GUARD_PAGE_VIOLATION => "STATUS_GUARD_PAGE_VIOLATION",
            NtStatus::BREAKPOINT => "STATUS_BREAKPOINT",
            NtStatus::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            NtStatus::NOT_IMPLEMENTED => "STATUS_NOT_IMPLEMENTED",
            NtStatus::INVALID_INFO_CLASS => "STATUS_INVALID_INFO_CLASS",
            NtStatus::INFO_LENGTH_MISMATCH => "STATUS_INFO_LENGTH_MISMATCH",
            NtStatus::ACCESS_VIOLATION => "STATUS_ACCESS_VIOLATION",
            NtStatus::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            NtStatus::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            NtStatus::END_OF_FILE => "STATUS_END_OF_FILE",
            NtStatus::NO_MEMORY => "STATUS_NO_MEMORY",
            NtStatus::CONFLICTING_ADDRESSES => "STATUS_CONFLICTING_ADDRESSES",
            NtStatus::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            NtStatus::BUFFER_TOO_SMALL => "STATUS_BUFFER_TOO_SMALL",
            NtStatus::OBJECT_TYPE_MISMATCH => "STATUS_OBJECT_TYPE_MISMATCH",
            NtStatus::NOT_COMMITTED => "STATUS_NOT_COMMITTED",
            NtStatus::OBJECT_NAME_NOT_FOUND => "STATUS_OBJECT_NAME_NOT_FOUND",
            NtStatus::MUTANT_NOT_OWNED => "STATUS_MUTANT_NOT_OWNED",
            NtStatus::SEMAPHORE_LIMIT_EXCEEDED => "STATUS_SEMAPHORE_LIMIT_EXCEEDED",
            NtStatus::THREAD_IS_TERMINATING => "STATUS_THREAD_IS_TERMINATING",
            NtStatus::MEMORY_NOT_ALLOCATED => "STATUS_MEMORY_NOT_ALLOCATED",
            NtStatus::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            NtStatus::DLL_NOT_FOUND => "STATUS_DLL_NOT_FOUND",
            NtStatus::ENTRYPOINT_NOT_FOUND => "STATUS_ENTRYPOINT_NOT_FOUND",
            NtStatus::PROCESS_IS_TERMINATING => "STATUS_PROCESS_IS_TERMINATING",
            NtStatus::STACK_OVERFLOW => "STATUS_STACK_OVERFLOW",
            _ => return None,
        })
    }
}

impl std::fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "NtStatus({:#010x})", self.0),
        }
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#010x})", self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(NtStatus::TIMEOUT.is_success());
        assert!(NtStatus::NO_YIELD_PERFORMED.is_success());
        assert!(!NtStatus::ACCESS_VIOLATION.is_success());
        assert!(NtStatus::ACCESS_VIOLATION.is_error());
        assert!(!NtStatus::GUARD_PAGE_VIOLATION.is_error());
    }

    #[test]
    fn test_wait_bias() {
        assert_eq!(NtStatus::WAIT_0.biased(2), NtStatus(2));
        assert_eq!(NtStatus::ABANDONED_WAIT_0.biased(1), NtStatus(0x81));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(format!("{}", NtStatus::SUCCESS), "STATUS_SUCCESS (0x00000000)");
        assert_eq!(format!("{}", NtStatus(0xC0DE_0001)), "0xc0de0001");
    }
}
