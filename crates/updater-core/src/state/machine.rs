//! Activation states and the layout strategy that shapes the transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed activation state of one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ActivationState {
    /// Image failed validation.
    #[default]
    Invalid,
    /// Validated, waiting for an activation request.
    Ready,
    /// Being written to flash.
    Activating,
    /// Installed and bootable.
    Active,
    /// Last activation attempt failed.
    Failed,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationState::Invalid => write!(f, "Invalid"),
            ActivationState::Ready => write!(f, "Ready"),
            ActivationState::Activating => write!(f, "Activating"),
            ActivationState::Active => write!(f, "Active"),
            ActivationState::Failed => write!(f, "Failed"),
        }
    }
}

impl ActivationState {
    /// States allowed to hold a redundancy priority.
    pub fn holds_priority(&self) -> bool {
        matches!(self, ActivationState::Active | ActivationState::Activating)
    }

    /// States from which an activation request starts a new attempt.
    pub fn accepts_request(&self) -> bool {
        matches!(self, ActivationState::Ready | ActivationState::Failed)
    }

    /// States occupying an image slot for capacity purposes.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, ActivationState::Active | ActivationState::Failed)
    }
}

/// Externally requested activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestedActivation {
    #[default]
    None,
    Active,
}

/// Flash storage layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLayout {
    /// Fixed partitions; the write completes inside the activation call.
    #[default]
    Static,
    /// UBI volumes created by a flash service unit.
    Ubi,
    /// eMMC partitions written by a flash service unit.
    Mmc,
}

impl FlashLayout {
    /// Whether completion arrives later as a unit notification.
    pub fn completes_asynchronously(&self) -> bool {
        matches!(self, FlashLayout::Ubi | FlashLayout::Mmc)
    }
}

impl fmt::Display for FlashLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashLayout::Static => write!(f, "static"),
            FlashLayout::Ubi => write!(f, "ubi"),
            FlashLayout::Mmc => write!(f, "mmc"),
        }
    }
}
