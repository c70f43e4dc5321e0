//! Registry mutations: registration, eviction, deletion and device modes.

use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, instrument, warn};

use super::{EVICTION_SENTINEL_PRIORITY, ItemUpdater};
use crate::error::{Result, UpdaterError};
use crate::events::{LogLevel, UpdaterEvent, UpdaterObserver};
use crate::platform::traits::{FIELD_MODE_SETENV_UNIT, USR_LOCAL_MOUNT_UNIT};
use crate::state::{Activation, ActivationState, Association};
use crate::validate::ActivationStatus;
use crate::version::{ImageManifest, VersionId, VersionPurpose, VersionRecord};

/// Boot environment variable recording field mode.
const FIELD_MODE_VAR: &str = "fieldmode";

/// A new image published by the upload service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadNotification {
    pub id: VersionId,
    pub version: String,
    pub purpose: VersionPurpose,
    pub extended_version: String,
    /// Directory holding the uploaded image files.
    pub path: PathBuf,
}

impl UploadNotification {
    /// Build a notification from the `MANIFEST` of an unpacked upload.
    pub fn from_manifest(dir: &Path) -> std::io::Result<Self> {
        let manifest = ImageManifest::load(dir)?;
        Ok(Self {
            id: VersionId::from_version(&manifest.version),
            version: manifest.version,
            purpose: manifest.purpose,
            extended_version: manifest.extended_version,
            path: dir.to_path_buf(),
        })
    }
}

impl<O: UpdaterObserver> ItemUpdater<O> {
    fn accepts_purpose(&self, purpose: VersionPurpose) -> bool {
        purpose.is_bmc_class() || (purpose == VersionPurpose::Host && self.config.host_bios_upgrade)
    }

    /// Register an uploaded image as Ready or Invalid.
    ///
    /// Returns `None` when the notification is ignored.
    #[instrument(skip(self, upload), fields(id = %upload.id, version = %upload.version))]
    pub fn register_image(&mut self, upload: UploadNotification) -> Option<ActivationState> {
        if upload.version.is_empty() || upload.path.as_os_str().is_empty() {
            warn!("Upload without version or path, ignoring");
            return None;
        }
        if !self.accepts_purpose(upload.purpose) {
            debug!(purpose = %upload.purpose, "Upload purpose not handled here");
            return None;
        }
        if self.contains(&upload.id) {
            debug!("Version already known");
            return None;
        }

        let mut associations = Vec::new();
        let state = match self.validator.validate(&upload.path, upload.purpose) {
            ActivationStatus::Ready => {
                if upload.purpose.is_bmc_class() {
                    associations.push(Association::inventory(&self.config.bmc_inventory_path));
                }
                ActivationState::Ready
            }
            ActivationStatus::Invalid => ActivationState::Invalid,
        };

        let id = upload.id;
        let path = self.object_path(&id);
        let record = VersionRecord::new(
            id.clone(),
            upload.version,
            upload.purpose,
            upload.extended_version,
            upload.path,
        );
        self.versions.insert(id.clone(), record);
        self.activations
            .insert(id.clone(), Activation::new(id.clone(), path, state, associations));
        self.emit(UpdaterEvent::Registered { id, state });
        Some(state)
    }

    /// Evict images until a slot is free for `caller`.
    ///
    /// Active and Failed images occupy slots. Failed or unprioritized images
    /// go first, then the highest priority value. The caller is never
    /// evicted, nor is the functional image while more than one slot exists.
    #[instrument(skip(self), fields(caller = %caller))]
    pub fn free_space(&mut self, caller: &VersionId) {
        let mut count = 0usize;
        let mut candidates = BinaryHeap::new();

        for activation in self.activations.values() {
            if !activation.state.occupies_slot() {
                continue;
            }
            count += 1;
            if &activation.id == caller
                || (self.protects_functional() && self.is_functional(&activation.id))
            {
                continue;
            }
            let rank = match (activation.state, activation.redundancy_priority) {
                (ActivationState::Active, Some(priority)) => u32::from(priority),
                _ => EVICTION_SENTINEL_PRIORITY,
            };
            candidates.push((rank, activation.id.clone()));
        }

        while count >= self.config.active_max_allowed {
            let Some((rank, id)) = candidates.pop() else {
                break;
            };
            info!(id = %id, rank, "Evicting image to free space");
            if let Err(e) = self.erase(&id) {
                error!(id = %id, error = %e, "Failed to evict image");
            }
            count -= 1;
        }
    }

    /// Delete a version and everything stored for it.
    ///
    /// Refused for the functional image while more than one slot exists.
    /// Storage cleanup runs even when the registry does not know `id`, but
    /// never for an id that is not a valid path component.
    #[instrument(skip(self), fields(id = %id))]
    pub fn erase(&mut self, id: &VersionId) -> Result<()> {
        id.ensure_valid()?;
        if self.protects_functional() && self.is_functional(id) {
            error!("Refusing to erase the functional image");
            return Err(UpdaterError::IrreversibleRefusal(format!(
                "{id} is the running image"
            )));
        }

        let path = self.object_path(id);
        self.associations.remove_path(&path);

        match self.activations.remove(id) {
            Some(_) => {
                let deleted = self.uploads.delete_upload(id);
                self.best_effort("delete upload", deleted);
            }
            None => {
                let e = UpdaterError::RegistryInconsistency {
                    id: id.clone(),
                    detail: "no activation".into(),
                };
                error!(error = %e, "Erasing unknown activation");
            }
        }

        if let Err(e) = self.recompute_boot_target() {
            error!(error = %e, "Failed to update boot target after erase");
        }

        let removed = self.flash.remove_version(id);
        self.best_effort("remove volume", removed);
        if let Err(e) = self.store.remove(id) {
            error!(error = %e, "Failed to remove persisted data");
        }

        if self.versions.remove(id).is_none() {
            let e = UpdaterError::RegistryInconsistency {
                id: id.clone(),
                detail: "no version record".into(),
            };
            error!(error = %e, "Erasing unknown version");
        }

        let cleared = self.flash.clear_entry(id);
        self.best_effort("clear priority entry", cleared);

        self.emit(UpdaterEvent::Erased { id: id.clone() });
        Ok(())
    }

    /// Erase every non-functional version, then let the helper clean up.
    ///
    /// Returns how many versions were erased.
    #[instrument(skip(self))]
    pub fn delete_all(&mut self) -> usize {
        let doomed: Vec<VersionId> = self
            .versions
            .values()
            .filter(|v| !v.functional)
            .map(|v| v.id.clone())
            .collect();

        let mut erased = 0;
        for id in doomed {
            match self.erase(&id) {
                Ok(()) => erased += 1,
                Err(e) => warn!(id = %id, error = %e, "Failed to erase version"),
            }
        }

        let cleaned = self.flash.cleanup();
        self.best_effort("cleanup", cleaned);
        erased
    }

    /// Enable field mode. Once enabled it cannot be disabled.
    pub fn set_field_mode(&mut self, enabled: bool) -> Result<bool> {
        if !enabled {
            if self.field_mode {
                return Err(UpdaterError::IrreversibleRefusal(
                    "field mode cannot be disabled".into(),
                ));
            }
            return Ok(false);
        }
        if self.field_mode {
            return Ok(true);
        }

        self.units
            .start_unit(FIELD_MODE_SETENV_UNIT)
            .map_err(|e| UpdaterError::ExternalService(e.to_string()))?;
        self.units
            .stop_unit(USR_LOCAL_MOUNT_UNIT)
            .map_err(|e| UpdaterError::ExternalService(e.to_string()))?;
        self.units
            .mask_unit_files(&[USR_LOCAL_MOUNT_UNIT])
            .map_err(|e| UpdaterError::ExternalService(e.to_string()))?;

        self.field_mode = true;
        info!("Field mode enabled");
        Ok(true)
    }

    /// Pick up field mode from the boot environment.
    pub fn restore_field_mode_status(&mut self) -> Result<bool> {
        let value = self.flash.env_var(FIELD_MODE_VAR)?;
        if value.as_deref() == Some("true") {
            self.field_mode = true;
        }
        Ok(self.field_mode)
    }

    /// Schedule a factory reset for the next boot.
    pub fn factory_reset(&mut self) -> Result<()> {
        self.flash.factory_reset()?;
        self.log(LogLevel::Info, "BMC factory reset will take effect upon reboot");
        Ok(())
    }
}
