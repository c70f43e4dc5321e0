//! Local platform backed by the filesystem and `systemctl`.
//!
//! `FsFlashHelper` implements the static layout: "flashing" copies the
//! uploaded image into `<media>/<prefix><id>/` and the boot environment is a
//! TOML file with an alternate copy next to it. Writes complete
//! synchronously, so no unit notification is needed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::traits::{FlashError, FlashHelper, UnitManager, UploadManager};
use crate::version::{ImageManifest, ReleaseInfo, VersionId};

/// Relative location of the release descriptor inside a volume.
pub const OS_RELEASE_REL: &str = "etc/os-release";

/// Persisted boot environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootEnv {
    /// Version the next boot selects.
    pub boot_target: Option<VersionId>,
    #[serde(default)]
    pub priorities: BTreeMap<VersionId, u8>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl BootEnv {
    fn load(path: &Path) -> Result<Self, FlashError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| FlashError::BootEnv(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<(), FlashError> {
        let content = toml::to_string_pretty(self).map_err(|e| FlashError::BootEnv(e.to_string()))?;
        write_atomic(path, content.as_bytes())?;
        Ok(())
    }
}

/// Write via a temporary sibling and rename, so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Static-layout flash helper on a directory tree.
#[derive(Debug, Clone)]
pub struct FsFlashHelper {
    media_dir: PathBuf,
    rofs_prefix: String,
    env_path: PathBuf,
}

impl FsFlashHelper {
    pub fn new(
        media_dir: impl Into<PathBuf>,
        rofs_prefix: &str,
        env_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            media_dir: media_dir.into(),
            rofs_prefix: rofs_prefix.to_string(),
            env_path: env_path.into(),
        }
    }

    pub fn volume_dir(&self, id: &VersionId) -> PathBuf {
        self.media_dir.join(format!("{}{}", self.rofs_prefix, id))
    }

    fn alternate_path(&self) -> PathBuf {
        let mut alt = self.env_path.as_os_str().to_owned();
        alt.push(".alt");
        PathBuf::from(alt)
    }

    pub fn boot_env(&self) -> Result<BootEnv, FlashError> {
        BootEnv::load(&self.env_path)
    }

    fn modify_env(&self, f: impl FnOnce(&mut BootEnv)) -> Result<(), FlashError> {
        let mut env = self.boot_env()?;
        f(&mut env);
        env.save(&self.env_path)
    }
}

impl FlashHelper for FsFlashHelper {
    #[instrument(skip(self), fields(id = %id))]
    fn write_image(&self, id: &VersionId, source: &Path) -> Result<(), FlashError> {
        id.ensure_valid()?;
        if !source.is_dir() {
            return Err(FlashError::WriteRejected {
                id: id.clone(),
                reason: format!("{} is not a directory", source.display()),
            });
        }

        let volume = self.volume_dir(id);
        copy_dir(source, &volume)?;

        // The volume must describe itself for discovery after a restart.
        let release = volume.join(OS_RELEASE_REL);
        if !release.is_file() {
            let manifest = ImageManifest::load(source)?;
            let info = ReleaseInfo {
                version: manifest.version,
                extended_version: manifest.extended_version,
            };
            write_atomic(&release, info.render().as_bytes())?;
        }

        info!(volume = %volume.display(), "Image written");
        Ok(())
    }

    fn update_boot_target(&self, id: &VersionId) -> Result<(), FlashError> {
        debug!(id = %id, "Updating boot target");
        self.modify_env(|env| env.boot_target = Some(id.clone()))
    }

    fn set_entry(&self, id: &VersionId, priority: u8) -> Result<(), FlashError> {
        self.modify_env(|env| {
            env.priorities.insert(id.clone(), priority);
        })
    }

    fn clear_entry(&self, id: &VersionId) -> Result<(), FlashError> {
        self.modify_env(|env| {
            env.priorities.remove(id);
        })
    }

    fn remove_version(&self, id: &VersionId) -> Result<(), FlashError> {
        id.ensure_valid()?;
        let volume = self.volume_dir(id);
        match fs::remove_dir_all(&volume) {
            Ok(()) => {
                info!(volume = %volume.display(), "Volume removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mirror_alternate(&self) -> Result<(), FlashError> {
        let env = self.boot_env()?;
        env.save(&self.alternate_path())
    }

    fn factory_reset(&self) -> Result<(), FlashError> {
        self.modify_env(|env| {
            env.vars
                .insert("openbmconce".to_string(), "factory-reset".to_string());
        })
    }

    fn cleanup(&self) -> Result<(), FlashError> {
        let media_dir = self.media_dir.clone();
        let prefix = self.rofs_prefix.clone();
        self.modify_env(|env| {
            env.priorities.retain(|id, _| {
                let keep = media_dir.join(format!("{prefix}{id}")).is_dir();
                if !keep {
                    debug!(id = %id, "Dropping stale priority entry");
                }
                keep
            });
        })
    }

    fn env_var(&self, name: &str) -> Result<Option<String>, FlashError> {
        Ok(self.boot_env()?.vars.get(name).cloned())
    }
}

/// Unit manager shelling out to `systemctl`.
#[derive(Debug, Clone, Default)]
pub struct SystemctlUnits {
    /// Log the commands instead of running them.
    pub dry_run: bool,
}

impl SystemctlUnits {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), FlashError> {
        if self.dry_run {
            info!(args = ?args, "systemctl (dry run)");
            return Ok(());
        }
        let status = Command::new("systemctl").args(args).status()?;
        if !status.success() {
            return Err(FlashError::Unit {
                unit: args.last().copied().unwrap_or_default().to_string(),
                message: format!("systemctl exited with {status}"),
            });
        }
        Ok(())
    }
}

impl UnitManager for SystemctlUnits {
    fn start_unit(&self, unit: &str) -> Result<(), FlashError> {
        self.systemctl(&["start", "--no-block", unit])
    }

    fn stop_unit(&self, unit: &str) -> Result<(), FlashError> {
        self.systemctl(&["stop", "--no-block", unit])
    }

    fn mask_unit_files(&self, units: &[&str]) -> Result<(), FlashError> {
        let mut args = vec!["mask", "--force"];
        args.extend_from_slice(units);
        self.systemctl(&args)
    }

    // Completion is synchronous on this platform; nothing to listen for.
    fn subscribe(&self) -> Result<(), FlashError> {
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), FlashError> {
        Ok(())
    }
}

/// Upload service backed by the upload directory.
#[derive(Debug, Clone)]
pub struct FsUploadManager {
    upload_dir: PathBuf,
}

impl FsUploadManager {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }
}

impl UploadManager for FsUploadManager {
    fn delete_upload(&self, id: &VersionId) -> Result<(), FlashError> {
        id.ensure_valid()?;
        let dir = self.upload_dir.join(id.as_str());
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "Upload already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
