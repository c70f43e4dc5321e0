//! Discovery of images already installed on the media.

use std::fs;
use std::path::Path;

use tracing::{error, info, instrument, warn};

use super::ItemUpdater;
use crate::error::Result;
use crate::events::{UpdaterEvent, UpdaterObserver};
use crate::platform::local::OS_RELEASE_REL;
use crate::state::{Activation, ActivationState, Association};
use crate::version::{ReleaseInfo, VersionId, VersionPurpose, VersionRecord};

/// Priority of installed images whose priority could not be restored.
const UNRESTORED_PRIORITY: u8 = 255;

impl<O: UpdaterObserver> ItemUpdater<O> {
    /// Register every image volume found under the media directory.
    ///
    /// Volumes without a usable release descriptor are erased. When nothing
    /// is found, a volume entry for the running image is synthesized so the
    /// running version is always known.
    #[instrument(skip(self))]
    pub fn process_bmc_image(&mut self) -> Result<()> {
        fs::create_dir_all(&self.config.media_dir)?;

        let running = match ReleaseInfo::load(&self.config.os_release_file) {
            Ok(info) => info,
            Err(e) => {
                error!(
                    path = %self.config.os_release_file.display(),
                    error = %e,
                    "Failed to read running release"
                );
                ReleaseInfo::default()
            }
        };

        self.discover_volumes(&running, true)
    }

    fn discover_volumes(&mut self, running: &ReleaseInfo, may_synthesize: bool) -> Result<()> {
        let mut volumes: Vec<(String, std::path::PathBuf)> = fs::read_dir(&self.config.media_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let suffix = name.strip_prefix(&self.config.rofs_prefix)?.to_string();
                Some((suffix, entry.path()))
            })
            .collect();
        volumes.sort();

        for (suffix, dir) in volumes {
            let info = match ReleaseInfo::load(&dir.join(OS_RELEASE_REL)) {
                Ok(info) if !info.version.is_empty() => info,
                Ok(_) => {
                    error!(volume = %dir.display(), "Volume has no version, erasing");
                    self.erase_volume(&suffix);
                    continue;
                }
                Err(e) => {
                    error!(
                        volume = %dir.display(),
                        error = %e,
                        "Volume has no release descriptor, erasing"
                    );
                    self.erase_volume(&suffix);
                    continue;
                }
            };
            self.register_installed(info, running);
        }

        if self.activations.is_empty() && may_synthesize && !running.version.is_empty() {
            let id = VersionId::from_version(&running.version);
            let volume = self
                .config
                .media_dir
                .join(format!("{}{}", self.config.rofs_prefix, id));
            info!(id = %id, "No installed image found, adding the running image");
            link_release(&self.config.os_release_file, &volume.join(OS_RELEASE_REL))?;
            return self.discover_volumes(running, false);
        }

        let mirrored = self.flash.mirror_alternate();
        self.best_effort("mirror boot environment", mirrored);
        Ok(())
    }

    fn erase_volume(&mut self, suffix: &str) {
        let id = match VersionId::parse(suffix) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Leaving volume with malformed name in place");
                return;
            }
        };
        if let Err(e) = self.erase(&id) {
            error!(id = %id, error = %e, "Failed to erase stale volume");
        }
    }

    fn register_installed(&mut self, info: ReleaseInfo, running: &ReleaseInfo) {
        let id = VersionId::from_version(&info.version);
        // Both volumes of a manually flashed pair carry the same version.
        if self.contains(&id) {
            return;
        }

        let purpose = match self.store.restore_purpose(&id) {
            Ok(purpose) => purpose.unwrap_or(VersionPurpose::Bmc),
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to restore purpose");
                VersionPurpose::Bmc
            }
        };
        let functional = info.version == running.version;
        let path = self.object_path(&id);

        let mut record =
            VersionRecord::new(id.clone(), info.version, purpose, info.extended_version, "");
        record.functional = functional;
        if functional {
            self.associations.add(Association::functional(&path));
        }
        self.associations.add(Association::active(&path));
        self.associations.add(Association::updateable(&path));

        self.versions.insert(id.clone(), record);
        self.activations.insert(
            id.clone(),
            Activation::new(
                id.clone(),
                path,
                ActivationState::Active,
                vec![Association::inventory(&self.config.bmc_inventory_path)],
            ),
        );
        self.emit(UpdaterEvent::Registered {
            id: id.clone(),
            state: ActivationState::Active,
        });

        let priority = match self.store.restore_priority(&id) {
            Ok(Some(priority)) => priority,
            Ok(None) if functional => 0,
            Ok(None) => {
                error!(id = %id, "Unable to restore priority, using lowest preference");
                UNRESTORED_PRIORITY
            }
            Err(e) => {
                error!(id = %id, error = %e, "Unable to restore priority, using lowest preference");
                if functional { 0 } else { UNRESTORED_PRIORITY }
            }
        };
        if let Err(e) = self.assign_priority(&id, priority) {
            error!(id = %id, error = %e, "Failed to record restored priority");
        }
    }
}

/// Point `link` at the running release descriptor.
fn link_release(target: &Path, link: &Path) -> std::io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)?;
    #[cfg(not(unix))]
    fs::copy(target, link)?;
    Ok(())
}
