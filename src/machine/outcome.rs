//! Results of machine operations.

/// What a state method asks for once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the machine alive; it runs again when its timer expires.
    Continue,
    /// Terminate the machine.
    Terminate,
}

/// Result of [`crate::machine::MachineCx::change_state`] and
/// [`crate::machine::Interface::change_state`].
///
/// Guard denials are ordinary outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Success,
    UnableToExit,
    UnableToEnter,
    Terminated,
}

impl ChangeOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of one run invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The state method ran and the machine stays alive.
    Completed,
    /// A run was already in progress; nothing happened.
    StillRunning,
    /// Re-validation under the lock found the machine no longer due.
    NotDue,
    /// The machine is terminated (by this run or earlier).
    Terminated,
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Manual,
    Command,
    StateChange,
    Continuous,
}

/// Per-tick decision produced by [`crate::machine::Machine::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Idle,
    Run,
    /// The lifespan ran out; the machine has been marked terminated and its
    /// teardown must be scheduled.
    Expire,
}
