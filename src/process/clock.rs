//! Virtual clocks for the emulated process.
//!
//! Two logical clocks back every time-related service: a wall clock counting 100ns
//! intervals since the NT epoch (1601-01-01) and a monotonic steady clock. Both run
//! in one of two modes:
//!
//! - **Host time**: derived from the host's clocks; wall time moves with reality.
//! - **Relative time**: advanced deterministically from the retired instruction
//!   count, one 100ns tick per instruction. Runs are reproducible and the scheduler
//!   can fast-forward past idle waits.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NT epoch (1601) and the UNIX epoch (1970).
const NT_TO_UNIX_EPOCH_SECONDS: u64 = 11_644_473_600;

/// Fixed wall-clock base used in relative mode so runs are reproducible:
/// 2024-01-01 00:00:00 UTC expressed as NT 100ns ticks.
const RELATIVE_MODE_EPOCH: u64 = (NT_TO_UNIX_EPOCH_SECONDS + 1_704_067_200) * 10_000_000;

/// The process clock pair (wall + steady).
#[derive(Debug, Clone)]
pub struct ProcessClocks {
    relative: bool,
    /// Steady clock in 100ns ticks since process start.
    steady_100ns: u64,
    /// Wall-clock value at steady tick zero.
    system_base_100ns: u64,
    /// Host anchor for host-time mode.
    host_anchor: Option<Instant>,
    /// Accumulated fast-forward offset applied on top of host time.
    offset_100ns: u64,
}

impl ProcessClocks {
    /// Creates the clock pair.
    ///
    /// In relative mode both clocks start from a fixed epoch and only move when
    /// [`advance`](Self::advance) or [`fast_forward_to`](Self::fast_forward_to)
    /// are called. In host mode they follow the host clocks.
    #[must_use]
    pub fn new(use_relative_time: bool) -> Self {
        if use_relative_time {
            Self {
                relative: true,
                steady_100ns: 0,
                system_base_100ns: RELATIVE_MODE_EPOCH,
                host_anchor: None,
                offset_100ns: 0,
            }
        } else {
            let unix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let system_base =
                (NT_TO_UNIX_EPOCH_SECONDS + unix.as_secs()) * 10_000_000 + u64::from(unix.subsec_nanos()) / 100;
            Self {
                relative: false,
                steady_100ns: 0,
                system_base_100ns: system_base,
                host_anchor: Some(Instant::now()),
                offset_100ns: 0,
            }
        }
    }

    /// Returns `true` if the clocks run in deterministic relative mode.
    #[must_use]
    pub fn is_relative(&self) -> bool {
        self.relative
    }

    /// Returns the monotonic steady clock in 100ns ticks.
    #[must_use]
    pub fn steady_time(&self) -> u64 {
        match self.host_anchor {
            Some(anchor) => {
                let elapsed = anchor.elapsed().as_nanos() / 100;
                self.offset_100ns + elapsed as u64
            }
            None => self.steady_100ns,
        }
    }

    /// Returns the wall clock in 100ns ticks since the NT epoch.
    #[must_use]
    pub fn system_time(&self) -> u64 {
        self.system_base_100ns + self.steady_time()
    }

    /// Advances the steady clock by a retired-instruction count (relative mode;
    /// a no-op in host mode where the host clock drives time).
    pub fn advance(&mut self, instructions: u64) {
        if self.relative {
            self.steady_100ns += instructions;
        }
    }

    /// Jumps the steady clock forward to `steady_target` (used when no thread is
    /// runnable and the earliest wait deadline is in the future). Backward targets
    /// are ignored.
    pub fn fast_forward_to(&mut self, steady_target: u64) {
        let now = self.steady_time();
        if steady_target <= now {
            return;
        }
        let delta = steady_target - now;
        if self.relative {
            self.steady_100ns += delta;
        } else {
            self.offset_100ns += delta;
        }
    }

    /// Snapshot accessor: `(relative, steady, system_base, offset)`.
    #[must_use]
    pub fn to_raw(&self) -> (bool, u64, u64, u64) {
        (
            self.relative,
            self.steady_time(),
            self.system_base_100ns,
            self.offset_100ns,
        )
    }

    /// Snapshot restore: reinstates saved clock state. A restored host-mode clock
    /// re-anchors at the current host instant so the steady clock never runs
    /// backwards across a restore.
    #[must_use]
    pub fn from_raw(relative: bool, steady: u64, system_base: u64, _offset: u64) -> Self {
        if relative {
            Self {
                relative,
                steady_100ns: steady,
                system_base_100ns: system_base,
                host_anchor: None,
                offset_100ns: 0,
            }
        } else {
            Self {
                relative,
                steady_100ns: 0,
                system_base_100ns: system_base,
                host_anchor: Some(Instant::now()),
                offset_100ns: steady,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_mode_is_deterministic() {
        let mut clocks = ProcessClocks::new(true);
        assert_eq!(clocks.steady_time(), 0);
        let start = clocks.system_time();

        clocks.advance(10_000_000);
        assert_eq!(clocks.steady_time(), 10_000_000);
        assert_eq!(clocks.system_time() - start, 10_000_000, "one second passed");

        let twin = {
            let mut c = ProcessClocks::new(true);
            c.advance(10_000_000);
            c
        };
        assert_eq!(twin.system_time(), clocks.system_time());
    }

    #[test]
    fn test_fast_forward_never_goes_backward() {
        let mut clocks = ProcessClocks::new(true);
        clocks.advance(500);
        clocks.fast_forward_to(100);
        assert_eq!(clocks.steady_time(), 500);
        clocks.fast_forward_to(9_000);
        assert_eq!(clocks.steady_time(), 9_000);
    }

    #[test]
    fn test_host_mode_moves() {
        let clocks = ProcessClocks::new(false);
        let a = clocks.steady_time();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clocks.steady_time() > a);
    }

    #[test]
    fn test_raw_round_trip_in_relative_mode() {
        let mut clocks = ProcessClocks::new(true);
        clocks.advance(1234);
        let (relative, steady, base, offset) = clocks.to_raw();
        let restored = ProcessClocks::from_raw(relative, steady, base, offset);
        assert_eq!(restored.steady_time(), 1234);
        assert_eq!(restored.system_time(), clocks.system_time());
    }
}
