use core::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// How a single `program_phy` call treats the hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProgramFlags: u8 {
        /// Write the computed dividers to the PLL.
        const COMMIT = 1 << 0;
        /// Arm a timer that restores the original dividers.
        const AUTO_RESET = 1 << 1;
    }
}

impl Default for ProgramFlags {
    fn default() -> Self {
        ProgramFlags::COMMIT | ProgramFlags::AUTO_RESET
    }
}

/// Tunables for one synchronization adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    /// Maximum frequency change per step, in percent.
    pub shift: f64,
    /// Larger shift used when the drift exceeds `step_threshold_us`. Zero disables it.
    pub fast_shift: f64,
    pub step_threshold_us: u64,
    pub wait_between_steps_ms: u64,
    pub flags: ProgramFlags,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            shift: 0.1,
            fast_shift: 0.0,
            step_threshold_us: 1000,
            wait_between_steps_ms: 50,
            flags: ProgramFlags::default(),
        }
    }
}

impl SyncConfig {
    pub fn dry_run(mut self) -> Self {
        self.flags.remove(ProgramFlags::COMMIT);
        self
    }
}

/// Message-bus handshake limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Bound on every wait for the PHY to clear or raise a flag.
    pub timeout: Duration,
    /// Attempts per read or write before giving up.
    pub retries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1),
            retries: 3,
        }
    }
}
