//! Builder API for machine registrations.
//!
//! A [`MachineSpec`] tells the scheduler how to host one machine type: its
//! tag, its control kind, whether it runs on the timer or continuously, its
//! timers and the factory that constructs its logic.

pub mod error;
pub mod macros;
pub mod spec;

pub use error::BuildError;
pub use spec::{MachineSpec, MachineSpecBuilder, DEFAULT_TIMEOUT};
