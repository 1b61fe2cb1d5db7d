//! Build errors for machine registrations.

use thiserror::Error;

/// Errors that can occur when building a machine spec or a registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Machine tag not specified. Call .tag(name) before .build()")]
    MissingTag,

    #[error("Factory for {tag} not specified. Call .factory(closure) before .build()")]
    MissingFactory { tag: &'static str },

    #[error("{tag} cannot be both continuous and sequential")]
    ContinuousSequential { tag: &'static str },

    #[error("Tag {tag} is already registered")]
    DuplicateTag { tag: &'static str },

    #[error("Machine type {type_name} is already registered")]
    DuplicateType { type_name: &'static str },
}
