//! Per-object property views.
//!
//! Front-ends address a version, its activation and its priority as
//! separate objects. These traits expose them by id on top of the single
//! updater that owns the state.

use super::ItemUpdater;
use crate::error::Result;
use crate::events::UpdaterObserver;
use crate::state::{ActivationState, Association, RequestedActivation};
use crate::version::{VersionId, VersionPurpose};

/// The software version object.
pub trait VersionInfo {
    fn version_string(&self, id: &VersionId) -> Option<&str>;
    fn version_purpose(&self, id: &VersionId) -> Option<VersionPurpose>;
    fn extended_version(&self, id: &VersionId) -> Option<&str>;
    fn functional(&self, id: &VersionId) -> bool;
    /// The object's delete method.
    fn delete_version(&mut self, id: &VersionId) -> Result<()>;
}

/// The activation object.
pub trait ActivationInfo {
    fn activation_state(&self, id: &VersionId) -> Option<ActivationState>;
    fn requested_activation(&self, id: &VersionId) -> Option<RequestedActivation>;
    fn request_activation(
        &mut self,
        id: &VersionId,
        value: RequestedActivation,
    ) -> Result<ActivationState>;
    fn activation_progress(&self, id: &VersionId) -> Option<u8>;
    fn activation_associations(&self, id: &VersionId) -> Vec<Association>;
}

/// The redundancy priority object. Only present while a priority is held.
pub trait PriorityInfo {
    fn redundancy_priority(&self, id: &VersionId) -> Option<u8>;
    fn request_priority(&mut self, id: &VersionId, value: u8) -> Result<u8>;
}

impl<O: UpdaterObserver> VersionInfo for ItemUpdater<O> {
    fn version_string(&self, id: &VersionId) -> Option<&str> {
        self.versions.get(id).map(|v| v.version.as_str())
    }

    fn version_purpose(&self, id: &VersionId) -> Option<VersionPurpose> {
        self.versions.get(id).map(|v| v.purpose)
    }

    fn extended_version(&self, id: &VersionId) -> Option<&str> {
        self.versions.get(id).map(|v| v.extended_version.as_str())
    }

    fn functional(&self, id: &VersionId) -> bool {
        self.is_functional(id)
    }

    fn delete_version(&mut self, id: &VersionId) -> Result<()> {
        self.erase(id)
    }
}

impl<O: UpdaterObserver> ActivationInfo for ItemUpdater<O> {
    fn activation_state(&self, id: &VersionId) -> Option<ActivationState> {
        self.activations.get(id).map(|a| a.state)
    }

    fn requested_activation(&self, id: &VersionId) -> Option<RequestedActivation> {
        self.activations.get(id).map(|a| a.requested)
    }

    fn request_activation(
        &mut self,
        id: &VersionId,
        value: RequestedActivation,
    ) -> Result<ActivationState> {
        self.set_requested_activation(id, value)
    }

    fn activation_progress(&self, id: &VersionId) -> Option<u8> {
        self.activations.get(id).and_then(|a| a.progress)
    }

    fn activation_associations(&self, id: &VersionId) -> Vec<Association> {
        self.activations
            .get(id)
            .map(|a| a.associations.clone())
            .unwrap_or_default()
    }
}

impl<O: UpdaterObserver> PriorityInfo for ItemUpdater<O> {
    fn redundancy_priority(&self, id: &VersionId) -> Option<u8> {
        self.activations.get(id).and_then(|a| a.redundancy_priority)
    }

    fn request_priority(&mut self, id: &VersionId, value: u8) -> Result<u8> {
        self.set_priority(id, value)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{config, harness};
    use super::*;
    use crate::error::UpdaterError;

    #[test]
    fn test_views_follow_registry() {
        let mut h = harness(config(2));
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);

        let updater = &mut h.updater;
        assert_eq!(updater.version_string(&id), Some("bmc-2.10.0"));
        assert_eq!(updater.version_purpose(&id), Some(VersionPurpose::Bmc));
        assert!(!VersionInfo::functional(&*updater, &id));
        assert_eq!(updater.activation_state(&id), Some(ActivationState::Ready));
        assert_eq!(updater.redundancy_priority(&id), None);
        assert_eq!(updater.activation_associations(&id).len(), 1);

        updater.request_activation(&id, RequestedActivation::Active).unwrap();
        assert_eq!(updater.requested_activation(&id), Some(RequestedActivation::Active));
        assert_eq!(updater.redundancy_priority(&id), Some(0));
        assert_eq!(updater.request_priority(&id, 4).unwrap(), 4);

        updater.delete_version(&id).unwrap();
        assert_eq!(updater.activation_state(&id), None);
    }

    #[test]
    fn test_functional_version_cannot_be_deleted() {
        let mut h = harness(config(2));
        let id = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        assert!(VersionInfo::functional(&h.updater, &id));
        assert!(matches!(
            h.updater.delete_version(&id),
            Err(UpdaterError::IrreversibleRefusal(_))
        ));
    }
}
