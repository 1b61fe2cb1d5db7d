//! Detection of circular command chains.
//!
//! Every activity (a run or a command delivery) carries a [`CallChain`]: the
//! most recent machine boundaries the current call path crossed. Sending a
//! command appends the target's link before the envelope is queued, so a
//! chain that comes back to a machine it already visited is caught before it
//! can deadlock on that machine's lock.
//!
//! The chain is fixed-capacity and `Copy`; it lives in a task-local while an
//! activity executes and travels by value inside envelopes.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};

/// Number of links a chain remembers. Older links are overwritten.
pub const CHAIN_CAPACITY: usize = 6;

/// Call id reserved for runs (timer, manual and state-change reruns).
pub const RUN_CALL_ID: u64 = 0;

tokio::task_local! {
    static CURRENT_CHAIN: CallChain;
}

/// One machine boundary crossed by a call path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallLink {
    pub serial: u64,
    pub call_id: u64,
    pub machine: &'static str,
}

impl CallLink {
    pub fn new(machine: &'static str, serial: u64, call_id: u64) -> Self {
        Self {
            serial,
            call_id,
            machine,
        }
    }
}

impl fmt::Display for CallLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.call_id == RUN_CALL_ID {
            write!(f, "{}#{}(run)", self.machine, self.serial)
        } else {
            write!(f, "{}#{}({:016x})", self.machine, self.serial, self.call_id)
        }
    }
}

/// Result of [`CallChain::try_add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum Collision {
    /// The exact (serial, call id) pair is already on the chain.
    Cycle = -1,
    /// The machine is already on the chain through a different call.
    Machine = 0,
    /// The machine is not on the chain.
    Clear = 1,
}

/// What to do when a send would close a loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPolicy {
    /// Drop cyclic commands; let re-entry through a different call pass.
    #[default]
    Break,
    /// Fail every colliding send with [`CircularCommand`].
    Raise,
}

/// A send rejected because its call path loops back on itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circular command chain: {}", .hops.join(" -> "))]
pub struct CircularCommand {
    pub hops: Vec<String>,
    pub collision: Collision,
}

/// Fixed-capacity ring of recently crossed machine boundaries.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallChain {
    links: [Option<CallLink>; CHAIN_CAPACITY],
    next: usize,
    len: usize,
}

impl CallChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain whose first link is `link`.
    pub fn rooted(link: CallLink) -> Self {
        let mut chain = Self::new();
        chain.push(link);
        chain
    }

    /// The chain of the activity executing on the current task, or an empty
    /// chain outside of any activity.
    pub fn current() -> Self {
        CURRENT_CHAIN.try_with(|chain| *chain).unwrap_or_default()
    }

    /// Runs `future` with `self` as the current chain.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT_CHAIN.scope(self, future).await
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, link: CallLink) {
        self.links[self.next] = Some(link);
        self.next = (self.next + 1) % CHAIN_CAPACITY;
        self.len = (self.len + 1).min(CHAIN_CAPACITY);
    }

    /// Links from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = CallLink> + '_ {
        let start = (self.next + CHAIN_CAPACITY - self.len) % CHAIN_CAPACITY;
        (0..self.len).filter_map(move |i| self.links[(start + i) % CHAIN_CAPACITY])
    }

    /// Records `link` unless it closes a true cycle.
    ///
    /// A cycle (exact pair already present) leaves the chain untouched; a
    /// machine collision is recorded so a later exact repeat is still caught.
    pub fn try_add(&mut self, link: CallLink) -> Collision {
        let mut machine_seen = false;
        for existing in self.iter() {
            if existing.serial == link.serial {
                if existing.call_id == link.call_id {
                    return Collision::Cycle;
                }
                machine_seen = true;
            }
        }
        self.push(link);
        if machine_seen {
            Collision::Machine
        } else {
            Collision::Clear
        }
    }

    /// Describes the chain plus the rejected `attempted` hop.
    pub fn circular(&self, attempted: CallLink, collision: Collision) -> CircularCommand {
        let mut hops: Vec<String> = self
            .iter()
            .filter(|link| collision != Collision::Machine || *link != attempted)
            .map(|link| link.to_string())
            .collect();
        hops.push(attempted.to_string());
        CircularCommand { hops, collision }
    }
}

/// Stable call id for the enum variant of `value`.
pub fn discriminant_id<T>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    std::mem::discriminant(value).hash(&mut hasher);
    hasher.finish().max(RUN_CALL_ID + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(serial: u64, call_id: u64) -> CallLink {
        CallLink::new("test", serial, call_id)
    }

    #[test]
    fn exact_repeat_is_a_cycle() {
        let mut chain = CallChain::rooted(link(1, 7));
        assert_eq!(chain.try_add(link(1, 7)), Collision::Cycle);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn same_machine_different_call_is_soft() {
        let mut chain = CallChain::rooted(link(1, 7));
        assert_eq!(chain.try_add(link(2, 7)), Collision::Clear);
        assert_eq!(chain.try_add(link(1, 8)), Collision::Machine);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.try_add(link(1, 8)), Collision::Cycle);
    }

    #[test]
    fn full_ring_forgets_oldest_link() {
        let mut chain = CallChain::rooted(link(100, 1));
        for serial in 0..CHAIN_CAPACITY as u64 {
            assert_eq!(chain.try_add(link(serial, 1)), Collision::Clear);
        }
        assert_eq!(chain.len(), CHAIN_CAPACITY);
        assert_eq!(chain.try_add(link(100, 1)), Collision::Clear);
        let serials: Vec<u64> = chain.iter().map(|l| l.serial).collect();
        assert_eq!(serials, vec![1, 2, 3, 4, 5, 100]);
    }

    #[test]
    fn circular_names_every_hop() {
        let mut chain = CallChain::rooted(CallLink::new("a", 1, 5));
        chain.try_add(CallLink::new("b", 2, 5));
        let attempted = CallLink::new("a", 1, 6);
        let err = chain.circular(attempted, Collision::Machine);
        assert_eq!(err.hops.len(), 3);
        let message = err.to_string();
        assert!(message.contains("a#1"));
        assert!(message.contains("b#2"));
    }

    #[test]
    fn discriminant_ids_differ_per_variant() {
        enum Cmd {
            Ping(u32),
            Pong,
        }
        assert_eq!(discriminant_id(&Cmd::Ping(1)), discriminant_id(&Cmd::Ping(2)));
        assert_ne!(discriminant_id(&Cmd::Ping(1)), discriminant_id(&Cmd::Pong));
        assert_ne!(discriminant_id(&Cmd::Pong), RUN_CALL_ID);
    }

    #[tokio::test]
    async fn scope_sets_current_chain() {
        assert!(CallChain::current().is_empty());
        let chain = CallChain::rooted(link(9, 9));
        let seen = chain.scope(async { CallChain::current().len() }).await;
        assert_eq!(seen, 1);
        assert!(CallChain::current().is_empty());
    }
}
