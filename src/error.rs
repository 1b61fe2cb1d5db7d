//! Error types for control, delivery and the scheduler as a whole.

use crate::builder::BuildError;
use crate::chain::CircularCommand;
use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Failure to deliver a command or relay a call into a machine.
#[derive(Debug, Error)]
pub enum PostError {
    #[error("no {machine} machine with identifier {identifier}")]
    NotFound {
        machine: &'static str,
        identifier: String,
    },

    #[error("{machine}#{serial} is terminated")]
    Terminated { machine: &'static str, serial: u64 },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("machine terminated before replying")]
    Dropped,

    #[error("call into {hop} closes a loop and was dropped")]
    CycleBroken { hop: String },

    #[error(transparent)]
    Circular(#[from] CircularCommand),
}

impl PostError {
    /// `true` for failures caused by the target being gone.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::Dropped)
    }
}

/// Membership errors raised by a [`crate::control::Control`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("{machine} machine with identifier {identifier} already exists")]
    AlreadyExists {
        machine: &'static str,
        identifier: String,
    },

    #[error("{machine} is a single-instance control and already has a machine")]
    SingletonOccupied { machine: &'static str },
}

/// Any error surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("machine type {type_name} is not registered")]
    Unregistered { type_name: &'static str },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
