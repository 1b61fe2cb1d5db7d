//! Core per-machine types.
//!
//! This module contains the plain state every machine carries:
//! - State definitions via the `State` trait
//! - Operational flags (Running, Paused, Terminated)
//! - Atomic timer and lifespan fields
//!
//! Nothing here takes a lock; the engine in [`crate::machine`] decides when
//! these values are read and re-validated.

mod flags;
mod state;
pub mod timing;

pub use flags::OperationalFlags;
pub use state::State;
pub use timing::{Remaining, Timing, INFINITE};
