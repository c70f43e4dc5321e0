//! Activation state module.

pub mod activation;
pub mod associations;
pub mod machine;

pub use activation::{Activation, RebootGuard, WriteFlags, object_path, upload_path};
pub use associations::{Association, AssociationSet};
pub use machine::{ActivationState, FlashLayout, RequestedActivation};
