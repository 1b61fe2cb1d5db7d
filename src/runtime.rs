//! State shared by the scheduler, its groups and every machine.

use crate::chain::LoopPolicy;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::continuous::ContinuousManager;
use crate::sink::{ExceptionSink, FaultPolicy};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub(crate) struct Runtime {
    pub(crate) sink: ExceptionSink,
    pub(crate) fault_policy: FaultPolicy,
    pub(crate) loop_policy: LoopPolicy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) workers: TaskTracker,
    /// Serializes the close/wait/reopen cycle of concurrent waiters.
    waiting: Mutex<()>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) continuous: Arc<ContinuousManager>,
}

impl Runtime {
    pub(crate) fn new(config: &SchedulerConfig) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            sink: config.sink.clone(),
            fault_policy: config.fault_policy,
            loop_policy: config.loop_policy,
            clock: Arc::clone(&config.clock),
            workers: TaskTracker::new(),
            waiting: Mutex::new(()),
            continuous: ContinuousManager::new(config.continuous_slots, shutdown.clone()),
            shutdown,
        })
    }

    /// Spawns a worker task tracked for [`crate::BigMachine::wait_idle`].
    pub(crate) fn spawn_worker<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.spawn(future);
    }

    /// Waits until every tracked worker task has finished.
    pub(crate) async fn wait_workers(&self) {
        let _waiting = self.waiting.lock().await;
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_all_return() {
        let runtime = Runtime::new(&SchedulerConfig::default());
        runtime.spawn_worker(tokio::time::sleep(Duration::from_millis(50)));

        let both = async { tokio::join!(runtime.wait_workers(), runtime.wait_workers()) };
        tokio::time::timeout(Duration::from_secs(1), both).await.unwrap();
        assert!(!runtime.workers.is_closed());

        runtime.spawn_worker(async {});
        tokio::time::timeout(Duration::from_secs(1), runtime.wait_workers())
            .await
            .unwrap();
        assert!(runtime.workers.is_empty());
    }
}
