//! Scheduler configuration.
//!
//! Settings are validated with Stillwater's `Validation`, so a bad
//! configuration reports every violation in one pass instead of the first.
//!
//! # Example
//!
//! ```rust
//! use bigmachine::chain::LoopPolicy;
//! use bigmachine::config::SchedulerConfig;
//! use std::time::Duration;
//!
//! let config = SchedulerConfig::builder()
//!     .tick_interval(Duration::from_millis(100))
//!     .continuous_slots(4)
//!     .loop_policy(LoopPolicy::Raise)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.continuous_slots(), 4);
//! ```

pub mod builder;
pub mod file;
pub mod violations;

pub use builder::SchedulerConfigBuilder;
pub use file::ConfigFile;
pub use violations::{ConfigError, ConfigViolation};

use crate::chain::LoopPolicy;
use crate::clock::Clock;
use crate::sink::{ExceptionSink, FaultPolicy};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CONTINUOUS_SLOTS: usize = 2;
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(3600);

/// Validated scheduler settings.
#[derive(Clone)]
pub struct SchedulerConfig {
    pub(crate) tick_interval: Duration,
    pub(crate) continuous_slots: usize,
    pub(crate) loop_policy: LoopPolicy,
    pub(crate) fault_policy: FaultPolicy,
    pub(crate) sink: ExceptionSink,
    pub(crate) clock: Arc<dyn Clock>,
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn continuous_slots(&self) -> usize {
        self.continuous_slots
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        self.loop_policy
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.fault_policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            continuous_slots: DEFAULT_CONTINUOUS_SLOTS,
            loop_policy: LoopPolicy::default(),
            fault_policy: FaultPolicy::default(),
            sink: ExceptionSink::default(),
            clock: Arc::new(crate::clock::SystemClock),
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("tick_interval", &self.tick_interval)
            .field("continuous_slots", &self.continuous_slots)
            .field("loop_policy", &self.loop_policy)
            .field("fault_policy", &self.fault_policy)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
