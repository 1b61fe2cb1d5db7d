//! The tick loop.
//!
//! [`BigMachine`] owns one control per registered machine type. Each tick it
//! asks every control to inspect its members and spawns the resulting runs
//! onto worker tasks; the tick itself never executes machine code.

use crate::checkpoint::{CheckpointError, RestoreReport, Snapshot};
use crate::config::SchedulerConfig;
use crate::control::{Control, ErasedControl};
use crate::error::{Error, Result};
use crate::machine::MachineLogic;
use crate::post::CommandPost;
use crate::registry::{MachineMeta, MachineRegistry};
use crate::runtime::Runtime;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// What the scheduler is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerPhase {
    Idle = 0,
    Scanning = 1,
    Dispatching = 2,
}

impl SchedulerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scanning,
            2 => Self::Dispatching,
            _ => Self::Idle,
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Machines inspected.
    pub scanned: usize,
    /// Runs handed to worker tasks.
    pub dispatched: usize,
    /// Machines whose lifespan or termination time ran out.
    pub expired: usize,
}

/// Scheduler for every registered machine type.
pub struct BigMachine {
    controls: Vec<Arc<dyn ErasedControl>>,
    by_type: HashMap<TypeId, usize>,
    runtime: Arc<Runtime>,
    tick_interval: Duration,
    last_tick: Mutex<DateTime<Utc>>,
    phase: AtomicU8,
    ticks: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl BigMachine {
    pub fn new(registry: MachineRegistry, config: SchedulerConfig) -> Arc<Self> {
        let runtime = Runtime::new(&config);
        let mut controls = Vec::with_capacity(registry.len());
        let mut by_type = HashMap::with_capacity(registry.len());
        for (type_id, entry) in registry.into_entries() {
            debug!(
                machine = entry.meta.tag,
                kind = ?entry.meta.kind,
                schedule = ?entry.meta.schedule,
                "control registered"
            );
            by_type.insert(type_id, controls.len());
            controls.push((entry.instantiate)(Arc::clone(&runtime)));
        }
        Arc::new(Self {
            controls,
            by_type,
            last_tick: Mutex::new(runtime.clock.now()),
            runtime,
            tick_interval: config.tick_interval,
            phase: AtomicU8::new(SchedulerPhase::Idle as u8),
            ticks: AtomicU64::new(0),
            ticker: Mutex::new(None),
        })
    }

    /// The control hosting machines of type `L`.
    pub fn control<L: MachineLogic>(&self) -> Result<Arc<Control<L>>> {
        self.by_type
            .get(&TypeId::of::<L>())
            .and_then(|&index| {
                Arc::clone(&self.controls[index])
                    .into_any()
                    .downcast::<Control<L>>()
                    .ok()
            })
            .ok_or(Error::Unregistered {
                type_name: std::any::type_name::<L>(),
            })
    }

    /// Command post for machines of type `L`.
    pub fn post<L: MachineLogic>(&self) -> Result<CommandPost<L>> {
        Ok(self.control::<L>()?.post())
    }

    pub fn meta<L: MachineLogic>(&self) -> Option<&MachineMeta> {
        self.by_type
            .get(&TypeId::of::<L>())
            .map(|&index| self.controls[index].meta())
    }

    /// Metadata of every registered type, in registration order.
    pub fn metas(&self) -> impl Iterator<Item = &MachineMeta> {
        self.controls.iter().map(|control| control.meta())
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn phase(&self) -> SchedulerPhase {
        SchedulerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Live machines across every control.
    pub fn machine_count(&self) -> usize {
        self.controls.iter().map(|control| control.len()).sum()
    }

    pub fn continuous_running(&self) -> usize {
        self.runtime.continuous.running()
    }

    pub fn continuous_waiting(&self) -> usize {
        self.runtime.continuous.waiting()
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.shutdown.is_cancelled()
    }

    /// One scan at the configured clock's current time.
    pub fn tick(&self) -> TickReport {
        self.tick_at(self.runtime.clock.now())
    }

    /// One scan at `now`. Must be called from within a tokio runtime; the
    /// dispatched runs are spawned onto it.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let elapsed = {
            let mut last = self.last_tick.lock();
            let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
            *last = now;
            elapsed
        };

        self.phase.store(SchedulerPhase::Scanning as u8, Ordering::Release);
        let mut report = TickReport::default();
        let mut work = Vec::new();
        for control in &self.controls {
            work.extend(control.scan(now, elapsed, &mut report));
        }

        self.phase.store(SchedulerPhase::Dispatching as u8, Ordering::Release);
        for task in work {
            self.runtime.spawn_worker(task);
        }
        self.runtime.continuous.pump();

        self.phase.store(SchedulerPhase::Idle as u8, Ordering::Release);
        self.ticks.fetch_add(1, Ordering::Relaxed);
        trace!(
            scanned = report.scanned,
            dispatched = report.dispatched,
            expired = report.expired,
            ?elapsed,
            "tick"
        );
        report
    }

    /// Spawns the tick loop. Returns `false` if it is already running or the
    /// scheduler was shut down.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() || self.is_shut_down() {
            return false;
        }
        *ticker = Some(tokio::spawn(tick_loop(
            Arc::downgrade(self),
            self.runtime.shutdown.clone(),
            self.tick_interval,
        )));
        true
    }

    /// Waits until every in-flight run and command delivery has finished.
    pub async fn wait_idle(&self) {
        self.runtime.wait_workers().await;
    }

    /// Stops ticking, lets in-flight work finish and stops continuous
    /// machines after their current iteration.
    pub async fn shutdown(&self) {
        self.runtime.shutdown.cancel();
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            if let Err(error) = ticker.await {
                warn!(%error, "tick loop ended abnormally");
            }
        }
        self.runtime.wait_workers().await;
        self.runtime.continuous.wait_stopped().await;
        info!("scheduler shut down");
    }

    /// Terminates every machine of every type.
    pub async fn terminate_all(&self) -> usize {
        let mut terminated = 0;
        for control in &self.controls {
            terminated += control.terminate_all().await;
        }
        terminated
    }

    /// Serializes every live machine of every persistent type.
    pub async fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new(self.runtime.clock.now());
        for control in self.controls.iter().filter(|c| c.meta().persistent) {
            let (records, failures) = control.snapshot_records().await;
            snapshot.records.extend(records);
            snapshot.failures += failures;
        }
        debug!(
            id = %snapshot.id,
            records = snapshot.records.len(),
            failures = snapshot.failures,
            "snapshot taken"
        );
        snapshot
    }

    /// Recreates the machines of `snapshot` in their controls.
    ///
    /// Records that fail to decode or collide with a live machine are counted
    /// and skipped.
    pub fn restore(&self, snapshot: &Snapshot) -> std::result::Result<RestoreReport, CheckpointError> {
        snapshot.check_version()?;
        let mut report = RestoreReport::default();
        for record in &snapshot.records {
            let control = self
                .controls
                .iter()
                .find(|c| c.meta().persistent && c.meta().tag == record.type_tag);
            let Some(control) = control else {
                if !report.unknown_tags.contains(&record.type_tag) {
                    report.unknown_tags.push(record.type_tag.clone());
                }
                continue;
            };
            match control.restore_record(&record.payload) {
                Ok(()) => report.restored += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(machine = control.meta().tag, %error, "machine not restored");
                }
            }
        }
        debug!(
            id = %snapshot.id,
            restored = report.restored,
            failed = report.failed,
            "snapshot restored"
        );
        Ok(report)
    }
}

#[instrument(name = "bigmachine::tick_loop", level = "debug", skip_all)]
async fn tick_loop(scheduler: Weak<BigMachine>, shutdown: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    info!(?period, "scheduler started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.tick();
            }
        }
    }
    info!("scheduler stopped");
}

impl Drop for BigMachine {
    fn drop(&mut self) {
        self.runtime.shutdown.cancel();
    }
}

impl fmt::Debug for BigMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigMachine")
            .field("controls", &self.controls.iter().map(|c| c.meta().tag).collect::<Vec<_>>())
            .field("tick_interval", &self.tick_interval)
            .field("phase", &self.phase())
            .field("ticks", &self.ticks())
            .finish()
    }
}
