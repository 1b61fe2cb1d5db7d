//! Per-machine command queue.

use crate::chain::CallChain;
use crate::machine::logic::MachineLogic;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

pub(crate) struct Envelope<L: MachineLogic> {
    pub(crate) command: L::Command,
    pub(crate) reply: Option<oneshot::Sender<L::Reply>>,
    pub(crate) chain: CallChain,
}

/// FIFO of pending envelopes plus the flag that elects a single drain task.
pub(crate) struct Mailbox<L: MachineLogic> {
    queue: Mutex<VecDeque<Envelope<L>>>,
    draining: AtomicBool,
}

impl<L: MachineLogic> Mailbox<L> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, envelope: Envelope<L>) {
        self.queue.lock().push_back(envelope);
    }

    pub(crate) fn pop(&self) -> Option<Envelope<L>> {
        self.queue.lock().pop_front()
    }

    /// Drops every pending envelope; their two-way callers observe a closed
    /// reply channel.
    pub(crate) fn clear(&self) -> usize {
        let dropped: Vec<_> = self.queue.lock().drain(..).collect();
        dropped.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Returns `true` if the caller became the drain task.
    pub(crate) fn try_claim(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release(&self) {
        self.draining.store(false, Ordering::Release);
    }
}
