//! Host BIOS images: written by a dedicated unit, then dropped from the
//! registry once the host flash is done.

use tracing::{debug, error, info};

use super::activation::{UNIT_DONE, UNIT_FAILED};
use super::{ItemUpdater, PendingAction};
use crate::error::{Result, UpdaterError};
use crate::events::UpdaterObserver;
use crate::platform::{UnitStateChange, host_bios_unit};
use crate::state::{ActivationState, Association};
use crate::version::VersionId;

/// The singleton object describing the BIOS currently on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosObject {
    pub path: String,
    /// Empty until a host image has been written.
    pub version: String,
}

impl<O: UpdaterObserver> ItemUpdater<O> {
    /// Publish the BIOS object with its active and functional relations.
    pub(crate) fn create_bios_object(&mut self) {
        let path = self.config.bios_object_path.clone();
        self.associations.add(Association::active(&path));
        self.associations.add(Association::functional(&path));
        debug!(path = %path, "Created host BIOS object");
        self.bios = Some(BiosObject {
            path,
            version: String::new(),
        });
    }

    pub fn bios(&self) -> Option<&BiosObject> {
        self.bios.as_ref()
    }

    pub(super) fn start_host_activation(&mut self, id: &VersionId) -> Result<ActivationState> {
        self.subscribe_units();
        self.set_progress(id, 20);

        let unit = host_bios_unit(id);
        if let Err(e) = self.units.start_unit(&unit) {
            error!(id = %id, unit = %unit, error = %e, "Failed to start host BIOS write");
            self.unsubscribe_units();
            if let Err(e) = self.set_activation(id, ActivationState::Failed) {
                error!(id = %id, error = %e, "Failed to mark activation failed");
            }
            return Err(UpdaterError::ExternalService(e.to_string()));
        }
        info!(id = %id, unit = %unit, "Host BIOS write started");
        Ok(ActivationState::Activating)
    }

    pub(super) fn host_unit_state_change(
        &mut self,
        id: &VersionId,
        change: &UnitStateChange,
    ) -> Result<()> {
        if change.unit != host_bios_unit(id) {
            return Ok(());
        }

        match change.result.as_str() {
            UNIT_DONE => {
                let deleted = self.uploads.delete_upload(id);
                self.best_effort("delete upload", deleted);
                self.set_progress(id, 100);
                if let Some(activation) = self.activations.get_mut(id) {
                    activation.release_write_resources();
                }
                self.set_state(id, ActivationState::Active);

                let version = self.versions.get(id).map(|v| v.version.clone());
                if let (Some(bios), Some(version)) = (self.bios.as_mut(), version) {
                    info!(id = %id, version = %version, "Host BIOS updated");
                    bios.version = version;
                }

                // The host image is not kept once written.
                self.pending.push_back(PendingAction::Erase(id.clone()));
            }
            UNIT_FAILED => {
                error!(id = %id, "Host BIOS write failed");
                self.set_activation(id, ActivationState::Failed)?;
            }
            other => {
                debug!(id = %id, result = %other, "Ignoring host unit result");
                return Ok(());
            }
        }

        self.unsubscribe_units();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{config, harness};
    use super::*;
    use crate::config::UpdaterConfig;
    use crate::platform::PlatformCall;
    use crate::state::RequestedActivation;
    use crate::state::associations::kind;
    use crate::version::VersionPurpose;

    fn host_config() -> UpdaterConfig {
        UpdaterConfig {
            host_bios_upgrade: true,
            ..config(2)
        }
    }

    #[test]
    fn test_bios_object_created_when_enabled() {
        let h = harness(host_config());
        let bios = h.updater.bios().unwrap();
        assert!(bios.version.is_empty());
        assert!(h.updater.associations().contains(kind::ACTIVE_FWD, &bios.path));
        assert!(h.updater.associations().contains(kind::FUNCTIONAL_FWD, &bios.path));

        assert!(harness(config(2)).updater.bios().is_none());
    }

    #[test]
    fn test_host_image_written_then_erased() {
        let mut h = harness(host_config());
        let upload = h.upload("host-1.4.0", VersionPurpose::Host);
        let id = upload.id.clone();
        assert_eq!(h.updater.register_image(upload), Some(ActivationState::Ready));

        let state = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();
        assert_eq!(state, ActivationState::Activating);
        assert_eq!(h.updater.activation(&id).unwrap().progress, Some(20));
        assert!(h.platform.started_units().contains(&host_bios_unit(&id)));

        h.updater
            .handle_unit_state_change(&UnitStateChange::new("flash-host-bios-other", UNIT_DONE));
        assert_eq!(h.state(&id), Some(ActivationState::Activating));

        h.updater
            .handle_unit_state_change(&UnitStateChange::new(host_bios_unit(&id), UNIT_DONE));

        assert_eq!(h.updater.bios().unwrap().version, "host-1.4.0");
        assert!(h.platform.saw(&PlatformCall::DeleteUpload(id.clone())));
        // Erased once the dispatch returned.
        assert!(!h.updater.contains(&id));
        assert_eq!(h.updater.pending_actions().count(), 0);
    }

    #[test]
    fn test_host_write_failure() {
        let mut h = harness(host_config());
        let upload = h.upload("host-1.4.0", VersionPurpose::Host);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        h.updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();

        h.updater
            .handle_unit_state_change(&UnitStateChange::new(host_bios_unit(&id), UNIT_FAILED));

        assert_eq!(h.state(&id), Some(ActivationState::Failed));
        assert!(h.updater.bios().unwrap().version.is_empty());
    }

    #[test]
    fn test_host_unit_start_failure() {
        let mut h = harness(host_config());
        let upload = h.upload("host-1.4.0", VersionPurpose::Host);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        h.platform.fail_unit(&host_bios_unit(&id));

        assert!(matches!(
            h.updater.set_requested_activation(&id, RequestedActivation::Active),
            Err(UpdaterError::ExternalService(_))
        ));
        assert_eq!(h.state(&id), Some(ActivationState::Failed));
    }
}
