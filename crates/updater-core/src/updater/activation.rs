//! Activation state transitions of BMC images.

use std::path::PathBuf;

use tracing::{debug, error, info, instrument, warn};

use super::ItemUpdater;
use crate::config::{ApplyTime, SignaturePolicy};
use crate::error::{Result, UpdaterError};
use crate::events::{LogLevel, UpdaterEvent, UpdaterObserver};
use crate::platform::traits::FORCE_REBOOT_UNIT;
use crate::platform::{FlashError, UnitStateChange, flash_write_unit};
use crate::state::{ActivationState, Association, RebootGuard, RequestedActivation, upload_path};
use crate::validate::SignatureCheck;
use crate::version::{VersionId, VersionPurpose};

/// Unit result reporting success.
pub(crate) const UNIT_DONE: &str = "done";
/// Unit result reporting failure.
pub(crate) const UNIT_FAILED: &str = "failed";

impl<O: UpdaterObserver> ItemUpdater<O> {
    /// Move `id` into `state`, running the entry actions of that state.
    ///
    /// Returns the state actually reached, which differs from the request
    /// when the activation fails or continues asynchronously.
    #[instrument(skip(self), fields(id = %id, state = %state))]
    pub fn set_activation(
        &mut self,
        id: &VersionId,
        state: ActivationState,
    ) -> Result<ActivationState> {
        if !self.activations.contains_key(id) {
            return Err(UpdaterError::UnknownVersion(id.clone()));
        }

        match state {
            ActivationState::Activating => self.start_activation(id),
            ActivationState::Active => {
                self.set_state(id, state);
                Ok(state)
            }
            _ => {
                let had_priority = self.clear_priority(id);
                if let Some(activation) = self.activations.get_mut(id) {
                    activation.release_write_resources();
                }
                self.set_state(id, state);
                // The boot pointer must not stay on an image leaving Active.
                if had_priority {
                    if let Err(e) = self.recompute_boot_target() {
                        error!(id = %id, error = %e, "Failed to update boot target");
                    }
                }
                Ok(state)
            }
        }
    }

    /// Handle an external activation request.
    ///
    /// The write-phase flags are always cleared. `Active` starts a new
    /// attempt from Ready or Failed and is ignored otherwise.
    pub fn set_requested_activation(
        &mut self,
        id: &VersionId,
        requested: RequestedActivation,
    ) -> Result<ActivationState> {
        let activation = self.activation_mut(id)?;
        activation.flags.clear();
        activation.requested = requested;
        let state = activation.state;

        if requested == RequestedActivation::Active && state.accepts_request() {
            return self.set_activation(id, ActivationState::Activating);
        }
        debug!(id = %id, state = %state, "Activation request needs no transition");
        Ok(state)
    }

    fn image_source(&self, id: &VersionId) -> PathBuf {
        match self.versions.get(id) {
            Some(record) if !record.source_path.as_os_str().is_empty() => {
                record.source_path.clone()
            }
            _ => upload_path(&self.config.upload_dir, id),
        }
    }

    fn fail_activation(&mut self, id: &VersionId) {
        if let Err(e) = self.set_activation(id, ActivationState::Failed) {
            error!(id = %id, error = %e, "Failed to mark activation failed");
        }
    }

    fn start_activation(&mut self, id: &VersionId) -> Result<ActivationState> {
        let source = self.image_source(id);
        let purpose = self.purpose_of(id);
        let version = self
            .versions
            .get(id)
            .map(|v| v.version.clone())
            .unwrap_or_default();

        self.set_state(id, ActivationState::Activating);

        if self.validator.signature_enabled()
            && self.validator.verify_signature(&source) == SignatureCheck::Failed
        {
            self.emit(UpdaterEvent::VerifyFailed { id: id.clone() });
            if self.field_mode || self.config.signature.policy == SignaturePolicy::Enforce {
                self.fail_activation(id);
                return Err(UpdaterError::ValidationFailure {
                    id: id.clone(),
                    reason: "signature verification failed".into(),
                });
            }
            warn!(id = %id, "Signature verification failed, continuing activation");
        }

        if purpose == VersionPurpose::Host && self.config.host_bios_upgrade {
            return self.start_host_activation(id);
        }

        if let Err(violation) = self.msl.check(&version) {
            self.emit(UpdaterEvent::PolicyViolation {
                id: id.clone(),
                min: violation.min.clone(),
                actual: violation.actual.clone(),
            });
            self.fail_activation(id);
            return Err(UpdaterError::PolicyViolation {
                min: violation.min,
                actual: violation.actual,
                purpose,
            });
        }

        let guard = RebootGuard::engage(self.units.clone());
        if let Some(activation) = self.activations.get_mut(id) {
            activation.guard = Some(guard);
        }
        self.set_progress(id, 10);

        self.free_space(id);

        self.subscribe_units();
        if let Err(e) = self.flash.write_image(id, &source) {
            error!(id = %id, error = %e, "Image write failed");
            self.unsubscribe_units();
            self.fail_activation(id);
            return Err(e.into());
        }

        if self.config.layout.completes_asynchronously() {
            info!(id = %id, layout = %self.config.layout, "Waiting for flash write to complete");
            return Ok(ActivationState::Activating);
        }

        self.on_flash_write_success(id)?;
        Ok(ActivationState::Active)
    }

    /// Finish an activation once the image is on flash.
    pub(crate) fn on_flash_write_success(&mut self, id: &VersionId) -> Result<()> {
        self.set_progress(id, 100);
        let activation = self.activation_mut(id)?;
        activation.release_write_resources();
        activation.flags.clear();
        let has_priority = activation.redundancy_priority.is_some();
        let path = activation.path.clone();

        self.unsubscribe_units();

        let purpose = self.purpose_of(id);
        if let Err(e) = self.store.store_purpose(id, purpose) {
            error!(id = %id, error = %e, "Failed to persist purpose");
        }

        if !has_priority {
            if let Err(e) = self.set_priority(id, 0) {
                error!(id = %id, error = %e, "Failed to assign initial priority");
            }
        }

        let deleted = self.uploads.delete_upload(id);
        self.best_effort("delete upload", deleted);

        self.associations.add(Association::active(&path));
        self.associations.add(Association::updateable(&path));

        match self.config.apply_time {
            ApplyTime::Immediate => self.reboot(),
            ApplyTime::OnReset => {
                self.log(LogLevel::Info, format!("BMC {id} updated, reboot to apply"))
            }
        }

        self.set_state(id, ActivationState::Active);
        Ok(())
    }

    /// React to a unit notification on behalf of one activating image.
    pub(crate) fn unit_state_change(
        &mut self,
        id: &VersionId,
        change: &UnitStateChange,
    ) -> Result<()> {
        if self.purpose_of(id) == VersionPurpose::Host && self.config.host_bios_upgrade {
            return self.host_unit_state_change(id, change);
        }
        if !self.config.layout.completes_asynchronously() || change.unit != flash_write_unit(id) {
            return Ok(());
        }

        match change.result.as_str() {
            UNIT_DONE => {
                if let Some(activation) = self.activations.get_mut(id) {
                    activation.flags.ro_volume_created = true;
                    activation.flags.rw_volume_created = true;
                }
                self.on_flash_write_success(id)
            }
            UNIT_FAILED => {
                error!(id = %id, unit = %change.unit, "Flash write unit failed");
                self.unsubscribe_units();
                self.fail_activation(id);
                Ok(())
            }
            other => {
                debug!(id = %id, result = %other, "Ignoring unit result");
                Ok(())
            }
        }
    }

    /// Ask for unit notifications. An existing subscription is fine.
    pub(crate) fn subscribe_units(&self) {
        match self.units.subscribe() {
            Ok(()) | Err(FlashError::AlreadySubscribed) => {}
            Err(e) => error!(error = %e, "Failed to subscribe to unit signals"),
        }
    }

    pub(crate) fn unsubscribe_units(&self) {
        if let Err(e) = self.units.unsubscribe() {
            error!(error = %e, "Failed to unsubscribe from unit signals");
        }
    }

    /// Reboot the controller to apply a written image.
    pub fn reboot(&self) {
        info!("Rebooting to apply the new image");
        self.emit(UpdaterEvent::RebootRequested);
        if let Err(e) = self.units.start_unit(FORCE_REBOOT_UNIT) {
            error!(error = %e, "Failed to reboot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{config, harness};
    use super::*;
    use crate::config::{SignatureConfig, UpdaterConfig};
    use crate::platform::PlatformCall;
    use crate::platform::traits::{REBOOT_GUARD_DISABLE_UNIT, REBOOT_GUARD_ENABLE_UNIT};
    use crate::state::FlashLayout;
    use crate::state::associations::kind;
    use crate::store::PersistStore;

    #[test]
    fn test_static_activation_completes() {
        let mut h = harness(config(2));
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        assert_eq!(h.state(&id), Some(ActivationState::Ready));

        let state = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();

        assert_eq!(state, ActivationState::Active);
        assert_eq!(h.priority(&id), Some(0));
        assert_eq!(h.platform.boot_target(), Some(id.clone()));
        assert_eq!(h.store.restore_purpose(&id).unwrap(), Some(VersionPurpose::Bmc));
        assert!(h.platform.saw(&PlatformCall::DeleteUpload(id.clone())));

        let path = h.updater.activation(&id).unwrap().path.clone();
        assert!(h.updater.associations().contains(kind::ACTIVE_FWD, &path));
        assert!(h.updater.associations().contains(kind::UPDATEABLE_FWD, &path));

        let activation = h.updater.activation(&id).unwrap();
        assert!(activation.progress.is_none());
        assert!(!activation.is_guarded());
        assert_eq!(
            h.platform.started_units(),
            vec![REBOOT_GUARD_ENABLE_UNIT.to_string(), REBOOT_GUARD_DISABLE_UNIT.to_string()]
        );
    }

    #[test]
    fn test_async_activation_waits_for_unit() {
        let mut h = harness(UpdaterConfig {
            layout: FlashLayout::Ubi,
            ..config(2)
        });
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);

        let state = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();
        assert_eq!(state, ActivationState::Activating);
        assert_eq!(h.updater.activation(&id).unwrap().progress, Some(10));
        assert!(h.updater.activation(&id).unwrap().is_guarded());

        h.updater
            .handle_unit_state_change(&UnitStateChange::new("flash-write-other", UNIT_DONE));
        assert_eq!(h.state(&id), Some(ActivationState::Activating));

        h.updater
            .handle_unit_state_change(&UnitStateChange::new(flash_write_unit(&id), UNIT_DONE));
        assert_eq!(h.state(&id), Some(ActivationState::Active));
        assert_eq!(h.priority(&id), Some(0));
        assert!(!h.updater.activation(&id).unwrap().is_guarded());
    }

    #[test]
    fn test_async_unit_failure() {
        let mut h = harness(UpdaterConfig {
            layout: FlashLayout::Mmc,
            ..config(2)
        });
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        h.updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();

        h.updater
            .handle_unit_state_change(&UnitStateChange::new(flash_write_unit(&id), UNIT_FAILED));

        assert_eq!(h.state(&id), Some(ActivationState::Failed));
        assert_eq!(h.priority(&id), None);
        assert!(h.updater.activation(&id).unwrap().progress.is_none());
    }

    #[test]
    fn test_minimum_ship_level_blocks_activation() {
        let mut h = harness(UpdaterConfig {
            minimum_ship_level: Some("bmc-2.7.0".into()),
            ..config(2)
        });
        let upload = h.upload("bmc-2.6.9", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);

        let err = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap_err();

        match err {
            UpdaterError::PolicyViolation { min, actual, purpose } => {
                assert_eq!(min, "bmc-2.7.0");
                assert_eq!(actual, "bmc-2.6.9");
                assert_eq!(purpose, VersionPurpose::Bmc);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.state(&id), Some(ActivationState::Failed));
        assert!(
            !h.platform
                .calls()
                .iter()
                .any(|c| matches!(c, PlatformCall::WriteImage { .. }))
        );
    }

    #[test]
    fn test_rejected_write_fails_activation() {
        let mut h = harness(config(2));
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        h.platform.reject_writes(true);

        let err = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Flash(FlashError::WriteRejected { .. })));
        assert_eq!(h.state(&id), Some(ActivationState::Failed));
        assert!(!h.updater.activation(&id).unwrap().is_guarded());

        // A failed image accepts a new attempt.
        h.platform.reject_writes(false);
        let state = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();
        assert_eq!(state, ActivationState::Active);
    }

    #[test]
    fn test_signature_failure_policies() {
        let signed = |policy| UpdaterConfig {
            signature: SignatureConfig { enabled: true, policy },
            ..config(2)
        };

        let mut h = harness(signed(SignaturePolicy::Warn));
        h.platform.set_signature_valid(false);
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        let state = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();
        assert_eq!(state, ActivationState::Active);
        assert!(h.observer.events().contains(&UpdaterEvent::VerifyFailed { id }));

        let mut h = harness(signed(SignaturePolicy::Enforce));
        h.platform.set_signature_valid(false);
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        assert!(matches!(
            h.updater.set_requested_activation(&id, RequestedActivation::Active),
            Err(UpdaterError::ValidationFailure { .. })
        ));
        assert_eq!(h.state(&id), Some(ActivationState::Failed));
    }

    #[test]
    fn test_field_mode_enforces_signature() {
        let mut h = harness(UpdaterConfig {
            signature: SignatureConfig {
                enabled: true,
                policy: SignaturePolicy::Warn,
            },
            ..config(2)
        });
        h.updater.set_field_mode(true).unwrap();
        h.platform.set_signature_valid(false);
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);

        assert!(h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .is_err());
        assert_eq!(h.state(&id), Some(ActivationState::Failed));
    }

    #[test]
    fn test_request_ignored_while_active() {
        let mut h = harness(config(2));
        let id = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        h.updater.activations.get_mut(&id).unwrap().flags.ro_volume_created = true;

        let state = h
            .updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();

        assert_eq!(state, ActivationState::Active);
        assert!(h.platform.calls().is_empty());
        assert_eq!(h.updater.activation(&id).unwrap().flags, Default::default());
    }

    #[test]
    fn test_apply_time_immediate_reboots() {
        let mut h = harness(UpdaterConfig {
            apply_time: ApplyTime::Immediate,
            ..config(2)
        });
        let upload = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let id = upload.id.clone();
        h.updater.register_image(upload);
        h.updater
            .set_requested_activation(&id, RequestedActivation::Active)
            .unwrap();

        assert!(h.platform.started_units().contains(&FORCE_REBOOT_UNIT.to_string()));
        assert!(h.observer.events().contains(&UpdaterEvent::RebootRequested));
    }

    #[test]
    fn test_leaving_active_clears_priority() {
        let mut h = harness(config(2));
        let id = h.install("aaaa0000", ActivationState::Active, Some(0), false);
        h.updater.set_activation(&id, ActivationState::Failed).unwrap();
        assert_eq!(h.priority(&id), None);
        assert!(h.platform.saw(&PlatformCall::ClearEntry(id)));
    }

    #[test]
    fn test_failed_boot_target_hands_over_boot() {
        let mut h = harness(config(3));
        let a = h.install("aaaa0000", ActivationState::Active, Some(1), true);
        let b = h.install("bbbb0000", ActivationState::Active, Some(0), false);
        h.updater.set_priority(&b, 0).unwrap();
        assert_eq!(h.platform.boot_target(), Some(b.clone()));

        h.updater.set_activation(&b, ActivationState::Failed).unwrap();

        assert_eq!(h.priority(&b), None);
        assert_eq!(h.platform.boot_target(), Some(a.clone()));
        assert!(h
            .observer
            .events()
            .contains(&UpdaterEvent::BootTargetChanged { id: a }));
    }

    #[test]
    fn test_leaving_ready_keeps_boot_target() {
        let mut h = harness(config(3));
        let a = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        let r = h.install("cccc0000", ActivationState::Ready, None, false);

        h.updater.set_activation(&r, ActivationState::Invalid).unwrap();

        assert!(!h.platform.saw(&PlatformCall::UpdateBootTarget(a)));
    }

    #[test]
    fn test_already_subscribed_is_ignored() {
        let mut h = harness(UpdaterConfig {
            layout: FlashLayout::Ubi,
            ..config(3)
        });
        let first = h.upload("bmc-2.10.0", VersionPurpose::Bmc);
        let second = h.upload("bmc-2.11.0", VersionPurpose::Bmc);
        let (a, b) = (first.id.clone(), second.id.clone());
        h.updater.register_image(first);
        h.updater.register_image(second);

        h.updater
            .set_requested_activation(&a, RequestedActivation::Active)
            .unwrap();
        let state = h
            .updater
            .set_requested_activation(&b, RequestedActivation::Active)
            .unwrap();
        assert_eq!(state, ActivationState::Activating);
        assert!(h.platform.saw(&PlatformCall::WriteImage {
            id: b.clone(),
            source: h.upload_dir.path().join(b.as_str()),
        }));
    }
}
