//! Builder API for scheduler configuration.

use crate::chain::LoopPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::violations::{ConfigError, ConfigViolation};
use crate::config::{SchedulerConfig, DEFAULT_CONTINUOUS_SLOTS, DEFAULT_TICK_INTERVAL, MAX_TICK_INTERVAL};
use crate::sink::{ExceptionSink, FaultPolicy};
use std::sync::Arc;
use std::time::Duration;
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;

/// Builder for [`SchedulerConfig`].
pub struct SchedulerConfigBuilder {
    tick_interval: Duration,
    continuous_slots: usize,
    loop_policy: LoopPolicy,
    fault_policy: FaultPolicy,
    sink: ExceptionSink,
    clock: Arc<dyn Clock>,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            continuous_slots: DEFAULT_CONTINUOUS_SLOTS,
            loop_policy: LoopPolicy::default(),
            fault_policy: FaultPolicy::default(),
            sink: ExceptionSink::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the scheduler tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the number of continuous worker slots
    pub fn continuous_slots(mut self, slots: usize) -> Self {
        self.continuous_slots = slots;
        self
    }

    pub fn loop_policy(mut self, policy: LoopPolicy) -> Self {
        self.loop_policy = policy;
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Replace the exception sink
    pub fn sink(mut self, sink: ExceptionSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check every setting, accumulating all violations.
    pub fn validate(&self) -> Validation<(), NonEmptyVec<ConfigViolation>> {
        let tick = if self.tick_interval.is_zero() {
            Validation::fail(ConfigViolation::ZeroTickInterval)
        } else if self.tick_interval > MAX_TICK_INTERVAL {
            Validation::fail(ConfigViolation::TickIntervalTooLong {
                interval: self.tick_interval,
                max: MAX_TICK_INTERVAL,
            })
        } else {
            Validation::success(())
        };

        let slots = if self.continuous_slots == 0 {
            Validation::fail(ConfigViolation::NoContinuousSlots)
        } else {
            Validation::success(())
        };

        Validation::all_vec(vec![tick, slots]).map(|_| ())
    }

    /// Build the configuration, or report every violation at once.
    pub fn build(self) -> Result<SchedulerConfig, ConfigError> {
        if let Validation::Failure(violations) = self.validate() {
            return Err(ConfigError::Invalid(violations.iter().cloned().collect()));
        }
        Ok(SchedulerConfig {
            tick_interval: self.tick_interval,
            continuous_slots: self.continuous_slots,
            loop_policy: self.loop_policy,
            fault_policy: self.fault_policy,
            sink: self.sink,
            clock: self.clock,
        })
    }
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
