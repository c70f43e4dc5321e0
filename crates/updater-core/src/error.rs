//! Error taxonomy for the updater.

use thiserror::Error;

use crate::platform::FlashError;
use crate::state::ActivationState;
use crate::store::StoreError;
use crate::version::{InvalidVersionId, VersionId, VersionPurpose};

#[derive(Error, Debug)]
pub enum UpdaterError {
    /// Candidate is below the configured minimum ship level.
    #[error("minimum ship level ({min}) not met by {actual} ({purpose})")]
    PolicyViolation {
        min: String,
        actual: String,
        purpose: VersionPurpose,
    },

    #[error("image validation failed for {id}: {reason}")]
    ValidationFailure { id: VersionId, reason: String },

    #[error("unit command failed: {0}")]
    ExternalService(String),

    #[error("registry inconsistency for {id}: {detail}")]
    RegistryInconsistency { id: VersionId, detail: String },

    /// A request that would leave the device in an unrecoverable state.
    #[error("refused: {0}")]
    IrreversibleRefusal(String),

    /// Only active or activating images take part in boot selection.
    #[error("{id} is {state} and cannot hold a redundancy priority")]
    NotPrioritizable { id: VersionId, state: ActivationState },

    #[error("no free redundancy priority above {requested} for {id}")]
    PriorityExhausted { id: VersionId, requested: u8 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown version: {0}")]
    UnknownVersion(VersionId),

    #[error(transparent)]
    InvalidVersionId(#[from] InvalidVersionId),

    #[error("flash helper error: {0}")]
    Flash(#[from] FlashError),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = UpdaterError> = std::result::Result<T, E>;
