//! The trait a machine type implements.

use crate::chain::discriminant_id;
use crate::core::State;
use crate::machine::context::MachineCx;
use crate::machine::outcome::Flow;
use crate::sink::BoxError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;

/// Key under which a machine is registered in its group.
pub trait Identifier: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Identifier for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Run once after a machine's termination hook, outside its lock.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// Behaviour of one machine type.
///
/// The engine owns the current state and the timers; an implementation
/// supplies the state method, the guards and the command handler. All methods
/// taking a [`MachineCx`] run while the machine's lock is held.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use bigmachine::machine::{Flow, MachineCx, MachineLogic};
/// use bigmachine::sink::BoxError;
/// use bigmachine::state_enum;
///
/// state_enum! {
///     pub enum Phase { Warmup, Steady }
///     initial: Warmup
/// }
///
/// struct Heater {
///     degrees: u32,
/// }
///
/// #[async_trait]
/// impl MachineLogic for Heater {
///     type Id = u32;
///     type State = Phase;
///     type Command = u32;
///     type Reply = u32;
///
///     fn initial_state(&self) -> Phase {
///         Phase::default()
///     }
///
///     async fn run_state(cx: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError> {
///         match *cx.state() {
///             Phase::Warmup => {
///                 cx.degrees += 5;
///                 if cx.degrees >= 20 {
///                     cx.change_state(Phase::Steady, false);
///                 }
///             }
///             Phase::Steady => {}
///         }
///         Ok(Flow::Continue)
///     }
///
///     async fn on_command(cx: &mut MachineCx<'_, Self>, target: u32) -> Result<u32, BoxError> {
///         cx.degrees = target;
///         Ok(cx.degrees)
///     }
/// }
/// ```
#[async_trait]
pub trait MachineLogic: Sized + Send + 'static {
    type Id: Identifier;
    type State: State;
    type Command: Clone + Send + 'static;
    type Reply: Send + 'static;

    fn initial_state(&self) -> Self::State;

    /// The state method: executes the behaviour of `cx.state()`.
    async fn run_state(cx: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError>;

    /// Handles one command. The reply is returned to two-way callers and
    /// discarded for one-way sends.
    async fn on_command(
        cx: &mut MachineCx<'_, Self>,
        command: Self::Command,
    ) -> Result<Self::Reply, BoxError>;

    /// Enter guard for `state`.
    fn can_enter(&self, _state: &Self::State) -> bool {
        true
    }

    /// Exit guard for `state`.
    fn can_exit(&self, _state: &Self::State) -> bool {
        true
    }

    /// Termination hook. Runs exactly once, under the lock.
    async fn on_terminate(&mut self) {}

    /// Hands out a disposal hook after [`MachineLogic::on_terminate`]. The
    /// engine calls it once the lock is released.
    fn take_disposer(&mut self) -> Option<Disposer> {
        None
    }

    /// Call id used for loop detection. Defaults to the enum variant of the
    /// command.
    fn call_id(command: &Self::Command) -> u64 {
        discriminant_id(command)
    }
}
