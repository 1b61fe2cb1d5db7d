//! Per-type machine containers.
//!
//! A [`Control`] owns every live machine of one type, keyed by identifier.
//! Its [`ControlKind`] decides how the scheduler dispatches the members:
//!
//! - `Unordered`: each due machine gets its own worker task
//! - `Sequential`: due machines run one after another in creation order, and
//!   no new batch starts while one is in flight
//! - `Single`: at most one machine in total

use crate::builder::MachineSpec;
use crate::checkpoint::{CheckpointError, SnapshotRecord};
use crate::continuous::ContinuousWork;
use crate::error::ControlError;
use crate::machine::engine::Seed;
use crate::machine::{Decision, Interface, Machine, MachineLogic};
use crate::post::CommandPost;
use crate::registry::MachineMeta;
use crate::runtime::Runtime;
use crate::scheduler::TickReport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Unordered,
    Sequential,
    Single,
}

/// How a machine type is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Runs when its timer expires, dispatched by the tick loop.
    Timer,
    /// Runs back to back on a continuous pool slot.
    Continuous,
}

/// Clears a sequential control's busy flag when its batch finishes or is
/// dropped.
struct BatchGate(Arc<AtomicBool>);

impl Drop for BatchGate {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry of the live machines of one type.
pub struct Control<L: MachineLogic> {
    spec: MachineSpec<L>,
    meta: MachineMeta,
    members: RwLock<IndexMap<L::Id, Arc<Machine<L>>>>,
    batch_busy: Arc<AtomicBool>,
    runtime: Arc<Runtime>,
    me: Weak<Control<L>>,
}

impl<L: MachineLogic> Control<L> {
    pub(crate) fn new(spec: MachineSpec<L>, runtime: Arc<Runtime>) -> Arc<Self> {
        let meta = MachineMeta::of(&spec);
        Arc::new_cyclic(|me| Self {
            spec,
            meta,
            members: RwLock::new(IndexMap::new()),
            batch_busy: Arc::new(AtomicBool::new(false)),
            runtime,
            me: me.clone(),
        })
    }

    pub fn tag(&self) -> &'static str {
        self.spec.tag
    }

    pub fn kind(&self) -> ControlKind {
        self.spec.kind
    }

    pub fn meta(&self) -> &MachineMeta {
        &self.meta
    }

    /// Live members; machines still settling a termination are not counted.
    pub fn len(&self) -> usize {
        self.members
            .read()
            .values()
            .filter(|machine| !machine.is_terminated())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of live members in creation order.
    pub fn ids(&self) -> Vec<L::Id> {
        self.members
            .read()
            .iter()
            .filter(|(_, machine)| !machine.is_terminated())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn contains(&self, id: &L::Id) -> bool {
        self.lookup(id).is_some()
    }

    pub(crate) fn lookup(&self, id: &L::Id) -> Option<Arc<Machine<L>>> {
        self.members
            .read()
            .get(id)
            .filter(|machine| !machine.is_terminated())
            .cloned()
    }

    pub(crate) fn first(&self) -> Option<Arc<Machine<L>>> {
        self.members
            .read()
            .values()
            .find(|machine| !machine.is_terminated())
            .cloned()
    }

    pub fn get(&self, id: &L::Id) -> Option<Arc<Interface<L>>> {
        self.lookup(id).map(|machine| machine.interface())
    }

    /// The only member of a single-instance control.
    pub fn single(&self) -> Option<Arc<Interface<L>>> {
        self.first().map(|machine| machine.interface())
    }

    /// Returns the machine registered under `id`, creating it with the
    /// registered factory if absent.
    pub fn get_or_create(&self, id: L::Id) -> Result<Arc<Interface<L>>, ControlError> {
        if let Some(machine) = self.lookup(&id) {
            return Ok(machine.interface());
        }
        let logic = (self.spec.factory)(&id);
        self.insert(id, logic, None, false).map(|machine| machine.interface())
    }

    /// Creates a machine; fails if `id` is already taken.
    pub fn create(&self, id: L::Id) -> Result<Arc<Interface<L>>, ControlError> {
        let logic = (self.spec.factory)(&id);
        self.create_with(id, logic)
    }

    /// Creates a machine from logic built by the caller.
    pub fn create_with(&self, id: L::Id, logic: L) -> Result<Arc<Interface<L>>, ControlError> {
        self.insert(id, logic, None, true).map(|machine| machine.interface())
    }

    fn insert(
        &self,
        id: L::Id,
        logic: L,
        state: Option<L::State>,
        strict: bool,
    ) -> Result<Arc<Machine<L>>, ControlError> {
        let machine = {
            let mut members = self.members.write();
            if let Some(existing) = members.get(&id).filter(|m| !m.is_terminated()) {
                if strict {
                    return Err(ControlError::AlreadyExists {
                        machine: self.tag(),
                        identifier: format!("{id:?}"),
                    });
                }
                return Ok(Arc::clone(existing));
            }
            if self.spec.kind == ControlKind::Single
                && members.iter().any(|(key, m)| key != &id && !m.is_terminated())
            {
                return Err(ControlError::SingletonOccupied { machine: self.tag() });
            }
            let machine = Machine::new(
                Seed {
                    id: id.clone(),
                    logic,
                    state,
                    tag: self.spec.tag,
                    schedule: self.spec.schedule,
                    default_timeout: self.spec.default_timeout,
                    lifespan: self.spec.lifespan,
                },
                self.me.clone(),
                Arc::clone(&self.runtime),
            );
            // A terminated predecessor may still be settling; its detach is
            // keyed by serial and leaves this entry alone.
            members.shift_remove(&id);
            members.insert(id, Arc::clone(&machine));
            machine
        };
        debug!(
            machine = self.tag(),
            serial = machine.serial(),
            identifier = ?machine.id(),
            "machine created"
        );
        if self.spec.schedule == Schedule::Continuous {
            let work: Arc<dyn ContinuousWork> = machine.clone();
            self.runtime.continuous.admit(work);
        }
        Ok(machine)
    }

    /// Terminates and removes the machine under `id`.
    pub async fn remove(&self, id: &L::Id) -> bool {
        match self.lookup(id) {
            Some(machine) => machine.terminate().await,
            None => false,
        }
    }

    /// Command post addressing this control's machines.
    pub fn post(self: &Arc<Self>) -> CommandPost<L> {
        CommandPost::new(Arc::clone(self))
    }

    /// Terminates every member. Returns how many were still alive.
    pub async fn terminate_all(&self) -> usize {
        let members: Vec<_> = self.members.read().values().cloned().collect();
        let mut terminated = 0;
        for machine in members {
            if machine.terminate().await {
                terminated += 1;
            }
        }
        terminated
    }

    pub(crate) fn detach(&self, id: &L::Id, serial: u64) {
        let mut members = self.members.write();
        if members.get(id).is_some_and(|m| m.serial() == serial) {
            members.shift_remove(id);
        }
    }

    fn scan(&self, now: DateTime<Utc>, elapsed: Duration, report: &mut TickReport) -> Vec<BoxFuture<'static, ()>> {
        let mut tasks: Vec<BoxFuture<'static, ()>> = Vec::new();
        if self.spec.schedule == Schedule::Continuous {
            return tasks;
        }
        let members: Vec<_> = self.members.read().values().cloned().collect();
        let mut due = Vec::new();
        for machine in members {
            report.scanned += 1;
            match machine.process(now, elapsed) {
                Decision::Idle => {}
                Decision::Run => due.push(machine),
                Decision::Expire => {
                    report.expired += 1;
                    tasks.push(async move { machine.teardown().await }.boxed());
                }
            }
        }
        if due.is_empty() {
            return tasks;
        }

        if self.spec.kind == ControlKind::Sequential {
            if self.batch_busy.swap(true, Ordering::AcqRel) {
                trace!(machine = self.tag(), waiting = due.len(), "sequential batch in flight");
                for machine in &due {
                    machine.release_queue();
                }
                return tasks;
            }
            report.dispatched += due.len();
            let gate = BatchGate(Arc::clone(&self.batch_busy));
            tasks.push(
                async move {
                    let _gate = gate;
                    let mut escalated = None;
                    for machine in due {
                        if let Err(panic) = AssertUnwindSafe(machine.try_run()).catch_unwind().await {
                            escalated = escalated.or(Some(panic));
                        }
                    }
                    if let Some(panic) = escalated {
                        std::panic::resume_unwind(panic);
                    }
                }
                .boxed(),
            );
        } else {
            report.dispatched += due.len();
            tasks.extend(due.into_iter().map(|machine| {
                async move {
                    machine.try_run().await;
                }
                .boxed()
            }));
        }
        tasks
    }

    async fn snapshot_records(&self) -> (Vec<SnapshotRecord>, usize) {
        let Some(codec) = self.spec.codec else {
            return (Vec::new(), 0);
        };
        let members: Vec<_> = self.members.read().values().cloned().collect();
        let mut records = Vec::new();
        let mut failures = 0;
        for machine in members {
            if machine.is_terminated() {
                continue;
            }
            // Continuous machines hold their lock for as long as they run.
            let inner = match self.spec.schedule {
                Schedule::Timer => machine.inner().lock().await,
                Schedule::Continuous => match machine.inner().try_lock() {
                    Some(inner) => inner,
                    None => {
                        failures += 1;
                        debug!(machine = self.tag(), serial = machine.serial(), "machine busy, skipped");
                        continue;
                    }
                },
            };
            match (codec.encode)(machine.id(), &inner.state, &inner.logic) {
                Ok(payload) => records.push(SnapshotRecord {
                    type_tag: self.tag().to_string(),
                    payload,
                }),
                Err(error) => {
                    failures += 1;
                    debug!(
                        machine = self.tag(),
                        serial = machine.serial(),
                        %error,
                        "machine could not be serialized"
                    );
                }
            }
        }
        (records, failures)
    }

    fn restore_record(&self, payload: &[u8]) -> Result<(), CheckpointError> {
        let Some(codec) = self.spec.codec else {
            return Err(CheckpointError::DeserializationFailed(format!(
                "{} is not persistent",
                self.tag()
            )));
        };
        let (id, state, logic) = (codec.decode)(payload)?;
        self.insert(id, logic, Some(state), true)
            .map(|_| ())
            .map_err(|error| CheckpointError::Conflict(error.to_string()))
    }
}

impl<L: MachineLogic> fmt::Debug for Control<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("spec", &self.spec)
            .field("members", &self.len())
            .finish()
    }
}

/// Type-erased view of a [`Control`] used by the scheduler.
#[async_trait]
pub(crate) trait ErasedControl: Send + Sync + 'static {
    fn meta(&self) -> &MachineMeta;

    fn len(&self) -> usize;

    /// Inspects every member and returns the work to dispatch.
    fn scan(&self, now: DateTime<Utc>, elapsed: Duration, report: &mut TickReport) -> Vec<BoxFuture<'static, ()>>;

    async fn snapshot_records(&self) -> (Vec<SnapshotRecord>, usize);

    fn restore_record(&self, payload: &[u8]) -> Result<(), CheckpointError>;

    async fn terminate_all(&self) -> usize;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<L: MachineLogic> ErasedControl for Control<L> {
    fn meta(&self) -> &MachineMeta {
        &self.meta
    }

    fn len(&self) -> usize {
        Control::len(self)
    }

    fn scan(&self, now: DateTime<Utc>, elapsed: Duration, report: &mut TickReport) -> Vec<BoxFuture<'static, ()>> {
        Control::scan(self, now, elapsed, report)
    }

    async fn snapshot_records(&self) -> (Vec<SnapshotRecord>, usize) {
        Control::snapshot_records(self).await
    }

    fn restore_record(&self, payload: &[u8]) -> Result<(), CheckpointError> {
        Control::restore_record(self, payload)
    }

    async fn terminate_all(&self) -> usize {
        Control::terminate_all(self).await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
