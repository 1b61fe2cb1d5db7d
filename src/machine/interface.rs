//! External handle to a machine.

use crate::chain::{CallChain, RUN_CALL_ID};
use crate::error::PostError;
use crate::machine::engine::{Machine, CHANGE_CALL_ID, READ_CALL_ID};
use crate::machine::logic::MachineLogic;
use crate::machine::outcome::{ChangeOutcome, RunOutcome};
use crate::post;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A weak, cloneable handle to one machine.
///
/// Holding an interface does not keep a terminated machine alive; every
/// operation on a machine that is gone reports [`PostError::Terminated`].
pub struct Interface<L: MachineLogic> {
    machine: Weak<Machine<L>>,
    id: L::Id,
    serial: u64,
    tag: &'static str,
}

impl<L: MachineLogic> Interface<L> {
    pub(crate) fn new(machine: Weak<Machine<L>>, id: L::Id, serial: u64, tag: &'static str) -> Self {
        Self {
            machine,
            id,
            serial,
            tag,
        }
    }

    pub fn id(&self) -> &L::Id {
        &self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    fn gone(&self) -> PostError {
        PostError::Terminated {
            machine: self.tag,
            serial: self.serial,
        }
    }

    fn machine(&self) -> Result<Arc<Machine<L>>, PostError> {
        match self.machine.upgrade() {
            Some(machine) if !machine.is_terminated() => Ok(machine),
            _ => Err(self.gone()),
        }
    }

    /// Extends the caller's chain with a hop into the machine. Every caller
    /// waits on the machine's lock, so returning to a machine already on the
    /// chain is refused.
    fn relay(&self, machine: &Machine<L>, call_id: u64, what: &str) -> Result<CallChain, PostError> {
        machine
            .relay_chain(call_id, true)?
            .ok_or_else(|| PostError::CycleBroken {
                hop: format!("{}#{}({what})", self.tag, self.serial),
            })
    }

    pub fn is_alive(&self) -> bool {
        self.machine().is_ok()
    }

    pub fn is_terminated(&self) -> bool {
        !self.is_alive()
    }

    /// Current state, read under the machine's lock.
    ///
    /// From inside the machine's own activity (or one it is waiting on) this
    /// fails with a loop error; use [`crate::MachineCx::state`] there.
    pub async fn state(&self) -> Result<L::State, PostError> {
        let machine = self.machine()?;
        self.relay(&machine, READ_CALL_ID, "state")?;
        let inner = machine.inner().lock().await;
        Ok(inner.state.clone())
    }

    /// Blocking variant of [`Interface::state`] for code outside the runtime.
    pub fn state_blocking(&self) -> Result<L::State, PostError> {
        let machine = self.machine()?;
        self.relay(&machine, READ_CALL_ID, "state")?;
        let inner = machine.inner().blocking_lock();
        Ok(inner.state.clone())
    }

    /// Reads the machine's logic under its lock.
    pub async fn with_logic<R>(&self, f: impl FnOnce(&L) -> R) -> Result<R, PostError> {
        let machine = self.machine()?;
        self.relay(&machine, READ_CALL_ID, "read")?;
        let inner = machine.inner().lock().await;
        Ok(f(&inner.logic))
    }

    /// One-way send.
    pub fn send(&self, command: &L::Command) -> Result<(), PostError> {
        let machine = self.machine()?;
        post::send_to(&machine, command)
    }

    /// Two-way send; waits at most `timeout` for the reply.
    pub async fn ask(&self, command: &L::Command, timeout: Duration) -> Result<L::Reply, PostError> {
        let machine = self.machine()?;
        post::ask(&machine, command, timeout).await
    }

    /// Relays a state change into the machine. A rerun, if allowed and the
    /// change succeeds, runs before this returns.
    pub async fn change_state(
        &self,
        new: L::State,
        allow_rerun: bool,
    ) -> Result<ChangeOutcome, PostError> {
        let machine = self.machine()?;
        let chain = self.relay(&machine, CHANGE_CALL_ID, "change_state")?;
        Ok(machine.change_state_from(new, allow_rerun, chain).await)
    }

    /// Runs the state method now, independent of the timer.
    pub async fn run_now(&self) -> Result<RunOutcome, PostError> {
        let machine = self.machine()?;
        let chain = self.relay(&machine, RUN_CALL_ID, "run")?;
        Ok(machine.run_manual(chain).await)
    }

    /// Terminates the machine. Returns `false` if it was already terminated.
    ///
    /// Safe to call from the machine's own activity; the teardown then
    /// follows once that activity ends.
    pub async fn terminate(&self) -> bool {
        match self.machine.upgrade() {
            Some(machine) => machine.terminate().await,
            None => false,
        }
    }

    pub fn pause(&self) -> Result<(), PostError> {
        self.machine()?.pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PostError> {
        self.machine()?.resume();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.machine().map(|m| m.flags().is_paused()).unwrap_or(false)
    }

    /// Makes the machine due on the next tick.
    pub fn trigger(&self) -> Result<(), PostError> {
        self.machine()?.trigger();
        Ok(())
    }

    pub fn time_until_run(&self) -> Option<chrono::Duration> {
        self.machine().ok()?.timing().time_until_run()
    }

    pub fn lifespan(&self) -> Option<chrono::Duration> {
        self.machine().ok()?.timing().lifespan()
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.machine().ok()?.timing().next_run_time()
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        self.machine().ok()?.timing().last_run_time()
    }

    pub fn termination_time(&self) -> Option<DateTime<Utc>> {
        self.machine().ok()?.timing().termination_time()
    }

    pub fn set_default_timeout(&self, timeout: Duration) -> Result<(), PostError> {
        self.machine()?.timing().set_default_timeout(timeout);
        Ok(())
    }

    pub fn set_lifespan(&self, lifespan: Option<Duration>) -> Result<(), PostError> {
        self.machine()?.timing().set_lifespan(lifespan);
        Ok(())
    }

    pub fn terminate_at(&self, at: Option<DateTime<Utc>>) -> Result<(), PostError> {
        self.machine()?.timing().set_termination_time(at);
        Ok(())
    }

    /// Total lock acquisitions so far.
    pub fn lock_acquisitions(&self) -> u64 {
        self.machine.upgrade().map(|m| m.lock_stats().0).unwrap_or(0)
    }

    /// Acquisitions that found another holder; non-zero means the lock was
    /// contended or re-entered.
    pub fn lock_overlaps(&self) -> u64 {
        self.machine.upgrade().map(|m| m.lock_stats().1).unwrap_or(0)
    }
}

impl<L: MachineLogic> Clone for Interface<L> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
            id: self.id.clone(),
            serial: self.serial,
            tag: self.tag,
        }
    }
}

impl<L: MachineLogic> fmt::Debug for Interface<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("serial", &self.serial)
            .finish()
    }
}
