//! Batch snapshot and restore of serializable machines.
//!
//! A snapshot is a list of `(type tag, payload)` records, one per live machine
//! of every type registered with [`crate::builder::MachineSpecBuilder::persistent`].
//! Payloads are opaque bincode images of `(identifier, state, logic)`; the
//! scheduler dispatches each record back into the control owning its tag.
//!
//! Failures are counted, never rolled back: a snapshot with failures is still
//! usable, it is just incomplete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::CheckpointError;

/// Version identifier for snapshot format
pub const SNAPSHOT_VERSION: u32 = 1;

/// One serialized machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub type_tag: String,
    pub payload: Vec<u8>,
}

/// Serializable image of every persistent machine at one point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot format version
    pub version: u32,

    /// Unique snapshot identifier
    pub id: String,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    pub records: Vec<SnapshotRecord>,

    /// Machines that could not be serialized
    pub failures: usize,
}

impl Snapshot {
    pub(crate) fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            records: Vec::new(),
            failures: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures == 0
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let snapshot: Self = bincode::deserialize(bytes)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let snapshot: Self = serde_json::from_str(json)
            .map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub(crate) fn check_version(&self) -> Result<(), CheckpointError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(())
    }
}

/// Outcome of [`crate::BigMachine::restore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
    /// Tags in the snapshot with no persistent registration.
    pub unknown_tags: Vec<String>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.unknown_tags.is_empty()
    }
}
