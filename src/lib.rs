//! BigMachine: a scheduling and lifecycle runtime for timer-driven state machines
//!
//! BigMachine hosts large populations of independent machines, each keyed by
//! an identifier, each running its own state logic, each reachable through
//! one-way and two-way commands. The runtime decides which machines are due,
//! serializes access to every machine behind its own lock, validates state
//! changes with enter/exit guards, breaks circular command chains and reclaims
//! machines whose lifespan ran out.
//!
//! # Core Concepts
//!
//! - **MachineLogic**: the trait a machine type implements
//! - **MachineSpec**: how the scheduler hosts a type (control kind, timers)
//! - **Control**: the live machines of one type, keyed by identifier
//! - **BigMachine**: the tick loop dispatching due machines onto worker tasks
//! - **CommandPost**: ordered one-way and two-way delivery into machines
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use bigmachine::{
//!     BigMachine, Flow, MachineCx, MachineLogic, MachineRegistry, MachineSpec, SchedulerConfig,
//! };
//! use bigmachine::sink::BoxError;
//! use bigmachine::state_enum;
//! use std::time::Duration;
//!
//! state_enum! {
//!     pub enum Light { Off, On }
//!     initial: Off
//! }
//!
//! struct Lamp;
//!
//! #[async_trait]
//! impl MachineLogic for Lamp {
//!     type Id = String;
//!     type State = Light;
//!     type Command = Light;
//!     type Reply = Light;
//!
//!     fn initial_state(&self) -> Light {
//!         Light::default()
//!     }
//!
//!     async fn run_state(_: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError> {
//!         Ok(Flow::Continue)
//!     }
//!
//!     async fn on_command(cx: &mut MachineCx<'_, Self>, light: Light) -> Result<Light, BoxError> {
//!         cx.change_state(light, false);
//!         Ok(*cx.state())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bigmachine::Result<()> {
//! let registry = MachineRegistry::new()
//!     .with(MachineSpec::<Lamp>::builder().tag("lamp").factory(|_| Lamp).build()?)?;
//! let scheduler = BigMachine::new(registry, SchedulerConfig::default());
//!
//! scheduler.control::<Lamp>()?.get_or_create("hall".to_string())?;
//! let reply = scheduler
//!     .post::<Lamp>()?
//!     .send_two_way(&"hall".to_string(), &Light::On, Duration::from_secs(1))
//!     .await?;
//! assert_eq!(reply, Light::On);
//!
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod chain;
pub mod checkpoint;
pub mod clock;
pub mod config;
mod continuous;
pub mod control;
pub mod core;
pub mod error;
pub mod machine;
pub mod post;
pub mod registry;
mod runtime;
pub mod scheduler;
pub mod sink;
pub mod sync;

pub use builder::{BuildError, MachineSpec, MachineSpecBuilder};
pub use chain::{CallChain, CircularCommand, LoopPolicy};
pub use checkpoint::{CheckpointError, RestoreReport, Snapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SchedulerConfig};
pub use control::{Control, ControlKind, Schedule};
pub use crate::core::State;
pub use error::{ControlError, Error, PostError, Result};
pub use machine::{
    ChangeOutcome, Flow, Interface, Machine, MachineCx, MachineLogic, RunOutcome, Trigger,
};
pub use post::CommandPost;
pub use registry::{MachineMeta, MachineRegistry};
pub use scheduler::{BigMachine, SchedulerPhase, TickReport};
pub use sink::{ExceptionSink, Fault, FaultPolicy};
