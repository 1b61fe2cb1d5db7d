//! The per-machine engine: guarded runs, command delivery and teardown.

use crate::chain::{CallChain, CallLink, Collision, LoopPolicy, RUN_CALL_ID};
use crate::control::{Control, Schedule};
use crate::continuous::ContinuousWork;
use crate::core::{OperationalFlags, State, Timing};
use crate::error::PostError;
use crate::machine::context::{Inner, MachineCx, NextRun};
use crate::machine::interface::Interface;
use crate::machine::logic::MachineLogic;
use crate::machine::mailbox::{Envelope, Mailbox};
use crate::machine::outcome::{ChangeOutcome, Decision, Flow, RunOutcome, Trigger};
use crate::runtime::Runtime;
use crate::sink::{Activity, Fault, FaultPolicy, MachineFault};
use crate::sync::{MachineGuard, MachineLock};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Call id of relayed state changes.
pub(crate) const CHANGE_CALL_ID: u64 = u64::MAX;

/// Call id of reads through an interface.
pub(crate) const READ_CALL_ID: u64 = u64::MAX - 1;

type Panic = Box<dyn Any + Send>;

/// Everything needed to bring up one machine.
pub(crate) struct Seed<L: MachineLogic> {
    pub(crate) id: L::Id,
    pub(crate) logic: L,
    pub(crate) state: Option<L::State>,
    pub(crate) tag: &'static str,
    pub(crate) schedule: Schedule,
    pub(crate) default_timeout: Duration,
    pub(crate) lifespan: Option<Duration>,
}

/// A live machine instance.
///
/// Flags and timers are atomics readable without the lock; the logic, the
/// current state and the pending-rerun flag live behind [`MachineLock`].
pub struct Machine<L: MachineLogic> {
    id: L::Id,
    serial: u64,
    tag: &'static str,
    schedule: Schedule,
    created_at: DateTime<Utc>,
    flags: OperationalFlags,
    timing: Timing,
    queued: AtomicBool,
    inner: MachineLock<Inner<L>>,
    mailbox: Mailbox<L>,
    interface: OnceLock<Arc<Interface<L>>>,
    me: Weak<Machine<L>>,
    group: Weak<Control<L>>,
    runtime: Arc<Runtime>,
}

impl<L: MachineLogic> Machine<L> {
    pub(crate) fn new(seed: Seed<L>, group: Weak<Control<L>>, runtime: Arc<Runtime>) -> Arc<Self> {
        let Seed {
            id,
            logic,
            state,
            tag,
            schedule,
            default_timeout,
            lifespan,
        } = seed;
        let created_at = runtime.clock.now();
        Arc::new_cyclic(|me| Self {
            id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            tag,
            schedule,
            created_at,
            flags: OperationalFlags::new(),
            timing: Timing::new(default_timeout, lifespan),
            queued: AtomicBool::new(false),
            inner: MachineLock::new(Inner::new(logic, state)),
            mailbox: Mailbox::new(),
            interface: OnceLock::new(),
            me: me.clone(),
            group,
            runtime,
        })
    }

    pub fn id(&self) -> &L::Id {
        &self.id
    }

    /// Process-unique serial number, assigned at creation.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn flags(&self) -> &OperationalFlags {
        &self.flags
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn is_terminated(&self) -> bool {
        self.flags.is_terminated()
    }

    pub fn pending_commands(&self) -> usize {
        self.mailbox.len()
    }

    pub(crate) fn lock_stats(&self) -> (u64, u64) {
        (self.inner.acquisitions(), self.inner.overlaps())
    }

    pub(crate) fn inner(&self) -> &MachineLock<Inner<L>> {
        &self.inner
    }

    /// The machine's external handle, created on first use.
    pub fn interface(&self) -> Arc<Interface<L>> {
        Arc::clone(self.interface.get_or_init(|| {
            Arc::new(Interface::new(self.me.clone(), self.id.clone(), self.serial, self.tag))
        }))
    }

    fn run_link(&self) -> CallLink {
        CallLink::new(self.tag, self.serial, RUN_CALL_ID)
    }

    pub fn pause(&self) {
        self.flags.set_paused(true);
    }

    pub fn resume(&self) {
        self.flags.set_paused(false);
    }

    /// Makes the machine due on the next tick.
    pub fn trigger(&self) {
        self.timing.trigger();
    }

    /// Tick-time inspection, done without the lock.
    ///
    /// Decays the timers by `elapsed` (capped at the machine's age) and
    /// decides whether a run should be dispatched. A `Run` decision marks the
    /// machine queued so later ticks do not dispatch it twice.
    pub fn process(&self, now: DateTime<Utc>, elapsed: Duration) -> Decision {
        if self.flags.is_terminated() {
            return Decision::Idle;
        }
        let age = (now - self.created_at).to_std().unwrap_or(Duration::ZERO);
        self.timing.decay(elapsed.min(age));

        if self.timing.is_expired(now) {
            if self.flags.mark_terminated() {
                debug!(machine = self.tag, serial = self.serial, "lifespan expired");
                return Decision::Expire;
            }
            return Decision::Idle;
        }
        if self.flags.is_running() || self.flags.is_paused() {
            return Decision::Idle;
        }
        if self.timing.is_due(now) && !self.queued.swap(true, Ordering::AcqRel) {
            return Decision::Run;
        }
        Decision::Idle
    }

    /// Drops the queued mark of a dispatch that will not happen.
    pub(crate) fn release_queue(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub(crate) fn change_state_locked(
        &self,
        inner: &mut Inner<L>,
        new: L::State,
        allow_rerun: bool,
    ) -> ChangeOutcome {
        if self.flags.is_terminated() {
            return ChangeOutcome::Terminated;
        }
        if !inner.logic.can_exit(&inner.state) {
            debug!(machine = self.tag, serial = self.serial, from = inner.state.name(), "exit denied");
            return ChangeOutcome::UnableToExit;
        }
        if !inner.logic.can_enter(&new) {
            debug!(machine = self.tag, serial = self.serial, to = new.name(), "enter denied");
            return ChangeOutcome::UnableToEnter;
        }
        debug!(
            machine = self.tag,
            serial = self.serial,
            from = inner.state.name(),
            to = new.name(),
            "state changed"
        );
        inner.state = new;
        if allow_rerun {
            inner.rerun = true;
        }
        ChangeOutcome::Success
    }

    /// Runs the state method under the lock the caller holds.
    ///
    /// Accepted state changes that asked for a rerun execute within this call.
    /// Timers are re-armed afterwards unless the machine terminated.
    pub(crate) async fn run_locked(
        &self,
        inner: &mut Inner<L>,
        trigger: Trigger,
        now: DateTime<Utc>,
        chain: CallChain,
    ) -> RunOutcome {
        if self.flags.is_terminated() {
            return RunOutcome::Terminated;
        }
        if !self.flags.begin_run() {
            trace!(machine = self.tag, serial = self.serial, "run already in progress");
            return RunOutcome::StillRunning;
        }

        let mut trigger = trigger;
        let mut failure = None;
        let mut stop = false;
        loop {
            inner.rerun = false;
            let result = {
                let mut cx = MachineCx::new(self, &mut *inner, trigger, now);
                chain
                    .scope(AssertUnwindSafe(L::run_state(&mut cx)).catch_unwind())
                    .await
            };
            match result {
                Ok(Ok(Flow::Continue)) => {
                    if inner.rerun && !self.flags.is_terminated() {
                        trigger = Trigger::StateChange;
                        continue;
                    }
                }
                Ok(Ok(Flow::Terminate)) => stop = true,
                Ok(Err(error)) => failure = Some(MachineFault::Failed(error)),
                Err(panic) => failure = Some(MachineFault::from_panic(panic)),
            }
            break;
        }

        inner.rerun = false;
        inner.runs += 1;
        self.flags.end_run();

        if stop && self.flags.mark_terminated() {
            inner.closing = true;
        }
        if let Some(error) = failure {
            self.fault(inner, Activity::Run, error);
        }
        if self.flags.is_terminated() {
            inner.next_run = None;
            return RunOutcome::Terminated;
        }
        self.rearm(inner);
        RunOutcome::Completed
    }

    fn rearm(&self, inner: &mut Inner<L>) {
        let now = self.runtime.clock.now();
        match inner.next_run.take() {
            Some(NextRun::After(timeout)) => self.timing.rearm(now, timeout),
            Some(NextRun::At(at)) => {
                self.timing.rearm(now, Duration::ZERO);
                self.timing.run_at(at);
            }
            None => self.timing.rearm(now, self.timing.default_timeout()),
        }
    }

    /// Reports a user-code fault and applies the configured policy.
    ///
    /// A sink that panics has its panic held in `inner` and re-raised by
    /// [`Machine::settle`] once the teardown is done.
    fn fault(&self, inner: &mut Inner<L>, activity: Activity, error: MachineFault) {
        if activity != Activity::Terminate
            && self.runtime.fault_policy == FaultPolicy::Terminate
            && self.flags.mark_terminated()
        {
            inner.closing = true;
        }
        if let Some(panic) = self.report(activity, error) {
            if inner.escalated.is_none() {
                inner.escalated = Some(panic);
            }
        }
    }

    fn report(&self, activity: Activity, error: MachineFault) -> Option<Panic> {
        let fault = Fault {
            machine: self.tag,
            serial: self.serial,
            identifier: format!("{:?}", self.id),
            activity,
            error,
        };
        std::panic::catch_unwind(AssertUnwindSafe(|| self.runtime.sink.report(&fault))).err()
    }

    /// Finishes a termination begun under `guard`, then releases the lock.
    ///
    /// Runs the termination hook, detaches the machine from its group, drops
    /// pending commands and finally calls the disposer outside the lock. A
    /// panic raised by the sink during the activity resumes afterwards.
    pub(crate) async fn settle(&self, mut guard: MachineGuard<'_, Inner<L>>) {
        if !guard.closing {
            let escalated = guard.escalated.take();
            drop(guard);
            if let Some(panic) = escalated {
                std::panic::resume_unwind(panic);
            }
            return;
        }
        guard.closing = false;
        guard.rerun = false;

        let hook = AssertUnwindSafe(guard.logic.on_terminate()).catch_unwind().await;
        if let Err(panic) = hook {
            self.fault(&mut guard, Activity::Terminate, MachineFault::from_panic(panic));
        }
        let disposer = guard.logic.take_disposer();
        let mut escalated = guard.escalated.take();
        drop(guard);

        let dropped = self.mailbox.clear();
        if let Some(group) = self.group.upgrade() {
            group.detach(&self.id, self.serial);
        }
        debug!(
            machine = self.tag,
            serial = self.serial,
            dropped_commands = dropped,
            "machine terminated"
        );

        if let Some(dispose) = disposer {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(dispose)) {
                let reported = self.report(Activity::Terminate, MachineFault::from_panic(panic));
                escalated = escalated.or(reported);
            }
        }
        if let Some(panic) = escalated {
            std::panic::resume_unwind(panic);
        }
    }

    /// Tears down a machine already marked terminated by someone not holding
    /// the lock.
    pub(crate) async fn teardown(&self) {
        let mut guard = self.inner.lock().await;
        guard.closing = true;
        self.settle(guard).await;
    }

    /// Terminates the machine. Returns `false` if it already was.
    ///
    /// Called from within one of the machine's own activities, the teardown
    /// runs on a worker task once that activity releases the lock.
    pub async fn terminate(&self) -> bool {
        if !self.flags.mark_terminated() {
            return false;
        }
        if self.in_own_activity() {
            debug!(machine = self.tag, serial = self.serial, "teardown deferred to lock release");
            if let Some(me) = self.me.upgrade() {
                self.runtime.spawn_worker(async move { me.teardown().await });
            }
        } else {
            self.teardown().await;
        }
        true
    }

    /// Whether the current task's call chain already passed through this
    /// machine.
    fn in_own_activity(&self) -> bool {
        CallChain::current().iter().any(|link| link.serial == self.serial)
    }

    /// Timer dispatch: acquires the lock and re-validates before running.
    pub(crate) async fn try_run(&self) -> RunOutcome {
        let guard = self.inner.lock().await;
        self.queued.store(false, Ordering::Release);
        if self.flags.is_terminated() {
            return RunOutcome::Terminated;
        }
        let now = self.runtime.clock.now();
        if self.flags.is_paused() || !self.timing.is_due(now) {
            trace!(machine = self.tag, serial = self.serial, "dispatch no longer due");
            return RunOutcome::NotDue;
        }
        let chain = CallChain::rooted(self.run_link());
        self.run_with(guard, Trigger::Timer, now, chain).await
    }

    async fn run_with(
        &self,
        mut guard: MachineGuard<'_, Inner<L>>,
        trigger: Trigger,
        now: DateTime<Utc>,
        chain: CallChain,
    ) -> RunOutcome {
        let outcome = self.run_locked(&mut guard, trigger, now, chain).await;
        self.settle(guard).await;
        outcome
    }

    /// Runs the state method now, regardless of the timer.
    pub(crate) async fn run_manual(&self, mut chain: CallChain) -> RunOutcome {
        let guard = self.inner.lock().await;
        let now = self.runtime.clock.now();
        chain.try_add(self.run_link());
        self.run_with(guard, Trigger::Manual, now, chain).await
    }

    /// State change requested from outside the machine's lock.
    pub(crate) async fn change_state_from(
        &self,
        new: L::State,
        allow_rerun: bool,
        mut chain: CallChain,
    ) -> ChangeOutcome {
        let mut guard = self.inner.lock().await;
        let outcome = self.change_state_locked(&mut guard, new, allow_rerun);
        if guard.rerun {
            let now = self.runtime.clock.now();
            chain.try_add(self.run_link());
            self.run_locked(&mut guard, Trigger::StateChange, now, chain).await;
        }
        self.settle(guard).await;
        outcome
    }

    /// Extends the current activity's chain with a hop into this machine.
    ///
    /// `Ok(None)` means the hop closed a loop and was dropped. Relays that
    /// block on this machine's lock pass `blocking`, which treats any repeat
    /// of this machine as a loop.
    pub(crate) fn relay_chain(
        &self,
        call_id: u64,
        blocking: bool,
    ) -> Result<Option<CallChain>, PostError> {
        let mut chain = CallChain::current();
        let link = CallLink::new(self.tag, self.serial, call_id);
        let collision = chain.try_add(link);
        let tolerated = match collision {
            Collision::Clear => true,
            Collision::Machine => !blocking && self.runtime.loop_policy == LoopPolicy::Break,
            Collision::Cycle => false,
        };
        if tolerated {
            return Ok(Some(chain));
        }
        let circular = chain.circular(link, collision);
        match self.runtime.loop_policy {
            LoopPolicy::Raise => Err(circular.into()),
            LoopPolicy::Break => {
                warn!(
                    machine = self.tag,
                    serial = self.serial,
                    chain = %circular,
                    "command loop broken"
                );
                Ok(None)
            }
        }
    }

    /// Queues a command. A drain task is started if none is active.
    pub(crate) fn deliver(&self, envelope: Envelope<L>) -> Result<(), PostError> {
        if self.flags.is_terminated() {
            return Err(PostError::Terminated {
                machine: self.tag,
                serial: self.serial,
            });
        }
        self.mailbox.push(envelope);
        if self.mailbox.try_claim() {
            if let Some(me) = self.me.upgrade() {
                self.runtime.spawn_worker(me.drain());
            }
        }
        Ok(())
    }

    /// Delivers queued commands until the mailbox is empty. A panic escalated
    /// by the sink resumes only after the mailbox claim is released.
    async fn drain(self: Arc<Self>) {
        let mut escalated = None;
        loop {
            while let Some(envelope) = self.mailbox.pop() {
                match AssertUnwindSafe(self.deliver_one(envelope)).catch_unwind().await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(panic) => escalated = escalated.or(Some(panic)),
                }
            }
            self.mailbox.release();
            if self.mailbox.is_empty() || !self.mailbox.try_claim() {
                break;
            }
        }
        if let Some(panic) = escalated {
            std::panic::resume_unwind(panic);
        }
    }

    /// Returns `false` once the machine is terminated.
    async fn deliver_one(&self, envelope: Envelope<L>) -> bool {
        let mut guard = self.inner.lock().await;
        if self.flags.is_terminated() {
            drop(envelope);
            drop(guard);
            self.mailbox.clear();
            return false;
        }
        self.deliver_locked(&mut guard, envelope).await;
        self.settle(guard).await;
        true
    }

    async fn deliver_locked(&self, inner: &mut Inner<L>, envelope: Envelope<L>) {
        let Envelope {
            command,
            reply,
            chain,
        } = envelope;
        let now = self.runtime.clock.now();
        inner.rerun = false;
        let result = {
            let mut cx = MachineCx::new(self, &mut *inner, Trigger::Command, now);
            chain
                .scope(AssertUnwindSafe(L::on_command(&mut cx, command)).catch_unwind())
                .await
        };
        match result {
            Ok(Ok(value)) => {
                if let Some(reply) = reply {
                    if reply.send(value).is_err() {
                        trace!(machine = self.tag, serial = self.serial, "reply discarded");
                    }
                }
            }
            Ok(Err(error)) => self.fault(inner, Activity::Command, MachineFault::Failed(error)),
            Err(panic) => self.fault(inner, Activity::Command, MachineFault::from_panic(panic)),
        }
        if inner.rerun && !self.flags.is_terminated() {
            let mut chain = chain;
            chain.try_add(self.run_link());
            self.run_locked(inner, Trigger::StateChange, now, chain).await;
        }
    }

    /// Continuous loop: holds the lock and runs back to back until cancelled
    /// or terminated.
    async fn run_continuously(&self, shutdown: CancellationToken) {
        let mut guard = self.inner.lock().await;
        debug!(machine = self.tag, serial = self.serial, "continuous machine started");
        let chain = CallChain::rooted(self.run_link());
        let mut last = Instant::now();
        while !shutdown.is_cancelled() && !self.flags.is_terminated() {
            let now = self.runtime.clock.now();
            let elapsed = last.elapsed();
            last = Instant::now();
            if self.timing.decay_lifespan(elapsed) <= 0 || self.timing.is_expired(now) {
                if self.flags.mark_terminated() {
                    guard.closing = true;
                }
                break;
            }
            let outcome = self
                .run_locked(&mut guard, Trigger::Continuous, now, chain)
                .await;
            if outcome == RunOutcome::Terminated || guard.escalated.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.settle(guard).await;
        debug!(machine = self.tag, serial = self.serial, "continuous machine stopped");
    }
}

impl<L: MachineLogic> ContinuousWork for Machine<L> {
    fn label(&self) -> &'static str {
        self.tag
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn run(self: Arc<Self>, shutdown: CancellationToken) -> BoxFuture<'static, ()> {
        async move { self.run_continuously(shutdown).await }.boxed()
    }
}

impl<L: MachineLogic> fmt::Debug for Machine<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("flags", &self.flags)
            .finish()
    }
}
