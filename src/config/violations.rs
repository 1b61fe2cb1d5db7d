//! Configuration violations and errors.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// A single problem found while validating a [`super::SchedulerConfig`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigViolation {
    #[error("tick interval must be greater than zero")]
    ZeroTickInterval,

    #[error("tick interval ({interval:?}) exceeds the maximum ({max:?})")]
    TickIntervalTooLong { interval: Duration, max: Duration },

    #[error("continuous machine pool needs at least one slot")]
    NoContinuousSlots,
}

/// Errors raised while building or loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scheduler configuration: {}", join(.0))]
    Invalid(Vec<ConfigViolation>),

    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

fn join(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
