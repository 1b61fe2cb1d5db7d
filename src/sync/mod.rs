//! Synchronization primitives shared by the runtime.

mod lock;

pub use lock::{MachineGuard, MachineLock};
