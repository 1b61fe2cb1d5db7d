//! Scheduler configuration loaded from TOML.
//!
//! ```toml
//! tick_interval_ms = 250
//! continuous_slots = 4
//! loop_policy = "raise"
//! fault_policy = "continue"
//! ```
//!
//! Omitted keys take the built-in defaults.

use crate::chain::LoopPolicy;
use crate::config::builder::SchedulerConfigBuilder;
use crate::config::violations::ConfigError;
use crate::config::{SchedulerConfig, DEFAULT_CONTINUOUS_SLOTS, DEFAULT_TICK_INTERVAL};
use crate::sink::FaultPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL.as_millis() as u64
}

fn default_continuous_slots() -> usize {
    DEFAULT_CONTINUOUS_SLOTS
}

/// On-disk form of the scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_continuous_slots")]
    pub continuous_slots: usize,

    #[serde(default)]
    pub loop_policy: LoopPolicy,

    #[serde(default)]
    pub fault_policy: FaultPolicy,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            continuous_slots: default_continuous_slots(),
            loop_policy: LoopPolicy::default(),
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl ConfigFile {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// A builder seeded with these settings; sink and clock stay at their
    /// defaults until overridden.
    pub fn into_builder(self) -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
            .tick_interval(Duration::from_millis(self.tick_interval_ms))
            .continuous_slots(self.continuous_slots)
            .loop_policy(self.loop_policy)
            .fault_policy(self.fault_policy)
    }

    pub fn into_config(self) -> Result<SchedulerConfig, ConfigError> {
        self.into_builder().build()
    }
}
