//! Execution context handed to state methods and command handlers.

use crate::machine::engine::Machine;
use crate::machine::interface::Interface;
use crate::machine::logic::MachineLogic;
use crate::machine::outcome::{ChangeOutcome, Trigger};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// One-shot override of the timer re-armed after the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextRun {
    After(Duration),
    At(DateTime<Utc>),
}

/// The lock-protected part of a machine.
pub(crate) struct Inner<L: MachineLogic> {
    pub(crate) logic: L,
    pub(crate) state: L::State,
    pub(crate) rerun: bool,
    pub(crate) next_run: Option<NextRun>,
    /// Set by whichever path marked the machine terminated while holding the
    /// lock; the holder finishes the teardown before releasing it.
    pub(crate) closing: bool,
    /// Panic raised by the exception sink, resumed after the lock is released.
    pub(crate) escalated: Option<Box<dyn Any + Send>>,
    pub(crate) runs: u64,
}

impl<L: MachineLogic> Inner<L> {
    pub(crate) fn new(logic: L, state: Option<L::State>) -> Self {
        let state = state.unwrap_or_else(|| logic.initial_state());
        Self {
            logic,
            state,
            rerun: false,
            next_run: None,
            closing: false,
            escalated: None,
            runs: 0,
        }
    }
}

/// Access to a machine from inside its own lock.
///
/// Dereferences to the machine's logic so state methods can read and update
/// their own fields directly.
pub struct MachineCx<'a, L: MachineLogic> {
    machine: &'a Machine<L>,
    inner: &'a mut Inner<L>,
    trigger: Trigger,
    now: DateTime<Utc>,
}

impl<'a, L: MachineLogic> MachineCx<'a, L> {
    pub(crate) fn new(
        machine: &'a Machine<L>,
        inner: &'a mut Inner<L>,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            machine,
            inner,
            trigger,
            now,
        }
    }

    pub fn id(&self) -> &L::Id {
        self.machine.id()
    }

    pub fn serial(&self) -> u64 {
        self.machine.serial()
    }

    pub fn state(&self) -> &L::State {
        &self.inner.state
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Wall-clock time the current activity started.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Number of completed runs before this one.
    pub fn runs(&self) -> u64 {
        self.inner.runs
    }

    pub fn logic(&self) -> &L {
        &self.inner.logic
    }

    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.inner.logic
    }

    /// Moves to `new` if the exit guard of the current state and the enter
    /// guard of `new` both pass. With `allow_rerun` the new state executes
    /// before control returns to whoever started this activity.
    pub fn change_state(&mut self, new: L::State, allow_rerun: bool) -> ChangeOutcome {
        self.machine.change_state_locked(&mut *self.inner, new, allow_rerun)
    }

    /// Overrides the timeout re-armed after this run, once.
    pub fn set_next_timeout(&mut self, timeout: Duration) {
        self.inner.next_run = Some(NextRun::After(timeout));
    }

    /// Schedules the next run at a wall-clock time instead of a countdown.
    pub fn run_at(&mut self, at: DateTime<Utc>) {
        self.inner.next_run = Some(NextRun::At(at));
    }

    /// Changes the timeout re-armed after every run from now on.
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.machine.timing().set_default_timeout(timeout);
    }

    /// Replaces the remaining lifespan; `None` makes it unbounded.
    pub fn set_lifespan(&self, lifespan: Option<Duration>) {
        self.machine.timing().set_lifespan(lifespan);
    }

    pub fn terminate_at(&self, at: Option<DateTime<Utc>>) {
        self.machine.timing().set_termination_time(at);
    }

    /// Terminates the machine when the current activity ends: no rerun, no
    /// re-arm, then the termination hook and the disposer. Returns `false` if
    /// the machine was already terminated.
    pub fn terminate(&mut self) -> bool {
        if !self.machine.flags().mark_terminated() {
            return false;
        }
        self.inner.closing = true;
        true
    }

    /// The machine's own external handle.
    pub fn interface(&self) -> Arc<Interface<L>> {
        self.machine.interface()
    }
}

impl<L: MachineLogic> Deref for MachineCx<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.inner.logic
    }
}

impl<L: MachineLogic> DerefMut for MachineCx<'_, L> {
    fn deref_mut(&mut self) -> &mut L {
        &mut self.inner.logic
    }
}
