//! Capped pool for machines that run in a tight loop.
//!
//! Each admitted machine occupies one slot for its whole life and runs on a
//! dedicated OS thread that drives the tokio runtime it was admitted from.
//! When a machine stops, its slot goes to the next waiting machine at once;
//! waiting machines wait indefinitely.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A machine that can occupy a continuous slot.
pub(crate) trait ContinuousWork: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    fn serial(&self) -> u64;

    /// Runs until terminated or `shutdown` fires.
    fn run(self: Arc<Self>, shutdown: CancellationToken) -> BoxFuture<'static, ()>;
}

struct PoolState {
    running: usize,
    waiting: VecDeque<Arc<dyn ContinuousWork>>,
    handle: Option<Handle>,
}

pub(crate) struct ContinuousManager {
    slots: usize,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
    idle: Notify,
    me: Weak<ContinuousManager>,
}

impl ContinuousManager {
    pub(crate) fn new(slots: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            slots,
            state: Mutex::new(PoolState {
                running: 0,
                waiting: VecDeque::new(),
                handle: None,
            }),
            shutdown,
            idle: Notify::new(),
            me: me.clone(),
        })
    }

    /// Queues `work` and starts it if a slot is free.
    pub(crate) fn admit(&self, work: Arc<dyn ContinuousWork>) {
        self.state.lock().waiting.push_back(work);
        self.pump();
    }

    /// Promotes waiting machines into free slots.
    ///
    /// Needs a tokio runtime handle, captured from the first caller running
    /// inside one; until then admitted machines stay queued.
    pub(crate) fn pump(&self) {
        let mut state = self.state.lock();
        if state.handle.is_none() {
            state.handle = Handle::try_current().ok();
        }
        let Some(handle) = state.handle.clone() else {
            return;
        };
        while state.running < self.slots && !self.shutdown.is_cancelled() {
            let Some(work) = state.waiting.pop_front() else {
                break;
            };
            state.running += 1;
            if let Err(error) = self.start(work, handle.clone()) {
                state.running -= 1;
                error!(%error, "failed to spawn continuous worker thread");
                break;
            }
        }
    }

    fn start(&self, work: Arc<dyn ContinuousWork>, handle: Handle) -> std::io::Result<()> {
        let name = format!("bigmachine-{}-{}", work.label(), work.serial());
        let manager = self.me.clone();
        let shutdown = self.shutdown.clone();
        debug!(machine = work.label(), serial = work.serial(), "continuous slot assigned");
        thread::Builder::new().name(name).spawn(move || {
            let label = work.label();
            let serial = work.serial();
            let outcome = handle.block_on(AssertUnwindSafe(work.run(shutdown)).catch_unwind());
            debug!(machine = label, serial, "continuous slot released");
            if let Some(manager) = manager.upgrade() {
                manager.release();
            }
            if let Err(panic) = outcome {
                std::panic::resume_unwind(panic);
            }
        })?;
        Ok(())
    }

    fn release(&self) {
        let stopped = {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            state.running == 0
        };
        self.pump();
        if stopped {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn running(&self) -> usize {
        self.state.lock().running
    }

    pub(crate) fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Waits until no continuous machine occupies a slot.
    pub(crate) async fn wait_stopped(&self) {
        loop {
            let notified = self.idle.notified();
            if self.running() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for ContinuousManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ContinuousManager")
            .field("slots", &self.slots)
            .field("running", &state.running)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Spinner {
        serial: u64,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        stop: CancellationToken,
    }

    impl ContinuousWork for Spinner {
        fn label(&self) -> &'static str {
            "spinner"
        }

        fn serial(&self) -> u64 {
            self.serial
        }

        fn run(self: Arc<Self>, shutdown: CancellationToken) -> BoxFuture<'static, ()> {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = self.stop.cancelled() => {}
                }
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_never_exceeds_slot_count() {
        let shutdown = CancellationToken::new();
        let manager = ContinuousManager::new(2, shutdown.clone());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let stops: Vec<_> = (0..4).map(|_| CancellationToken::new()).collect();

        for (serial, stop) in stops.iter().enumerate() {
            manager.admit(Arc::new(Spinner {
                serial: serial as u64,
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
                stop: stop.clone(),
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.running(), 2);
        assert_eq!(manager.waiting(), 2);

        stops[0].cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.running(), 2);
        assert_eq!(manager.waiting(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), manager.wait_stopped())
            .await
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
