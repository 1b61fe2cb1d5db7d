//! State trait for the nodes of a machine's private state graph.
//!
//! Every machine type declares one state enum. The engine stores the current
//! value, hands it to the state method on each run and consults the machine's
//! guards before replacing it.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Trait for machine states.
///
/// # Required Traits
///
/// - `Clone`: the engine hands out copies of the current state
/// - `PartialEq`: transitions compare against the current state
/// - `Debug`: states appear in log fields
/// - `Serialize` + `Deserialize`: states are part of a machine's snapshot image
///
/// # Example
///
/// ```rust
/// use bigmachine::core::State;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
/// enum Door {
///     Closed,
///     Open,
///     Locked,
/// }
///
/// impl State for Door {
///     fn name(&self) -> &str {
///         match self {
///             Self::Closed => "Closed",
///             Self::Open => "Open",
///             Self::Locked => "Locked",
///         }
///     }
/// }
///
/// assert_eq!(Door::Locked.name(), "Locked");
/// ```
pub trait State:
    Clone + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Name used in log fields and error messages.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    enum TestState {
        Idle,
        Working,
        Done,
    }

    impl State for TestState {
        fn name(&self) -> &str {
            match self {
                Self::Idle => "Idle",
                Self::Working => "Working",
                Self::Done => "Done",
            }
        }
    }

    #[test]
    fn state_name_returns_correct_value() {
        assert_eq!(TestState::Idle.name(), "Idle");
        assert_eq!(TestState::Working.name(), "Working");
        assert_eq!(TestState::Done.name(), "Done");
    }

    #[test]
    fn state_survives_bincode_image() {
        let bytes = bincode::serialize(&TestState::Working).unwrap();
        let decoded: TestState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, TestState::Working);
    }
}
