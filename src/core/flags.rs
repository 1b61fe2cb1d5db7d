//! Operational flags of a machine.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Bitset of {Running, Paused, Terminated} stored in one atomic byte.
///
/// Terminated is sticky: no operation clears it once set.
pub struct OperationalFlags {
    bits: AtomicU8,
}

impl OperationalFlags {
    pub const RUNNING: u8 = 0b001;
    pub const PAUSED: u8 = 0b010;
    pub const TERMINATED: u8 = 0b100;

    pub fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.bits() & Self::RUNNING != 0
    }

    pub fn is_paused(&self) -> bool {
        self.bits() & Self::PAUSED != 0
    }

    pub fn is_terminated(&self) -> bool {
        self.bits() & Self::TERMINATED != 0
    }

    /// Sets Running. Returns `false` if it was already set.
    pub fn begin_run(&self) -> bool {
        self.bits.fetch_or(Self::RUNNING, Ordering::AcqRel) & Self::RUNNING == 0
    }

    pub fn end_run(&self) {
        self.bits.fetch_and(!Self::RUNNING, Ordering::AcqRel);
    }

    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.bits.fetch_or(Self::PAUSED, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!Self::PAUSED, Ordering::AcqRel);
        }
    }

    /// Sets Terminated. Returns `true` only for the caller that set it first.
    pub fn mark_terminated(&self) -> bool {
        self.bits.fetch_or(Self::TERMINATED, Ordering::AcqRel) & Self::TERMINATED == 0
    }
}

impl Default for OperationalFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationalFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationalFlags")
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
