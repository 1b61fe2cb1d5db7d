//! Property-based tests for the call chain and the timer fields.
//!
//! These tests use proptest to verify properties hold across
//! many randomly generated inputs.

use bigmachine::chain::{CallChain, CallLink, Collision, CHAIN_CAPACITY};
use bigmachine::core::{State, Timing};
use bigmachine::state_enum;
use chrono::Utc;
use proptest::prelude::*;
use std::time::Duration;

state_enum! {
    enum TestState {
        Initial,
        Processing,
        Complete,
        Failed,
    }
    initial: Initial
}

prop_compose! {
    fn arbitrary_state()(variant in 0..4u8) -> TestState {
        match variant {
            0 => TestState::Initial,
            1 => TestState::Processing,
            2 => TestState::Complete,
            _ => TestState::Failed,
        }
    }
}

prop_compose! {
    fn arbitrary_link()(serial in 1..8u64, call_id in 0..4u64) -> CallLink {
        CallLink::new("prop", serial, call_id)
    }
}

proptest! {
    #[test]
    fn state_name_is_stable(state in arbitrary_state()) {
        let name1 = state.name();
        let name2 = state.name();
        prop_assert_eq!(name1, name2);
    }

    #[test]
    fn chain_never_exceeds_capacity(links in prop::collection::vec(arbitrary_link(), 0..40)) {
        let mut chain = CallChain::new();
        for link in links {
            chain.try_add(link);
            prop_assert!(chain.len() <= CHAIN_CAPACITY);
        }
    }

    #[test]
    fn immediate_repeat_is_always_a_cycle(
        prefix in prop::collection::vec(arbitrary_link(), 0..10),
        link in arbitrary_link(),
    ) {
        let mut chain = CallChain::new();
        for existing in prefix {
            chain.try_add(existing);
        }
        chain.try_add(link);
        let before = chain.len();

        prop_assert_eq!(chain.try_add(link), Collision::Cycle);
        prop_assert_eq!(chain.len(), before);
    }

    #[test]
    fn collision_matches_recorded_links(
        prefix in prop::collection::vec(arbitrary_link(), 0..CHAIN_CAPACITY),
        link in arbitrary_link(),
    ) {
        let mut chain = CallChain::new();
        for existing in prefix {
            chain.try_add(existing);
        }
        let recorded: Vec<CallLink> = chain.iter().collect();
        let expected = if recorded.contains(&link) {
            Collision::Cycle
        } else if recorded.iter().any(|l| l.serial == link.serial) {
            Collision::Machine
        } else {
            Collision::Clear
        };

        prop_assert_eq!(chain.try_add(link), expected);
    }

    #[test]
    fn chain_iterates_newest_last(links in prop::collection::vec(arbitrary_link(), 1..20)) {
        let mut chain = CallChain::new();
        let mut last_recorded = None;
        for link in links {
            if chain.try_add(link) != Collision::Cycle {
                last_recorded = Some(link);
            }
        }
        prop_assert_eq!(chain.iter().last(), last_recorded);
    }

    #[test]
    fn decay_is_additive(steps in prop::collection::vec(0..2_000u64, 1..20)) {
        let timing = Timing::new(Duration::from_secs(10), Some(Duration::from_secs(30)));
        let total: u64 = steps.iter().sum();
        for step in &steps {
            timing.decay(Duration::from_millis(*step));
        }

        let remaining = timing.lifespan().unwrap();
        prop_assert_eq!(remaining, chrono::Duration::milliseconds(30_000 - total as i64));
    }

    #[test]
    fn due_exactly_when_timeout_elapsed(timeout in 1..5_000u64, elapsed in 0..10_000u64) {
        let timing = Timing::new(Duration::from_millis(timeout), None);
        timing.decay(Duration::from_millis(elapsed));

        prop_assert_eq!(timing.is_due(Utc::now()), elapsed >= timeout);
    }

    #[test]
    fn unbounded_lifespan_never_expires(steps in prop::collection::vec(0..100_000u64, 0..20)) {
        let timing = Timing::new(Duration::from_secs(1), None);
        for step in steps {
            timing.decay(Duration::from_millis(step));
        }

        prop_assert!(!timing.is_expired(Utc::now()));
        prop_assert_eq!(timing.lifespan(), None);
    }
}
