//! Platform abstraction.
//!
//! Everything the updater asks of the operating system goes through these
//! traits: writing images to flash, the boot environment, service units and
//! the upload service. This enables:
//! - Local implementations operating on a directory tree and `systemctl`
//! - Mock implementations for unit testing
//! - Layout-specific backends (UBI, eMMC, static)

use std::path::Path;

use thiserror::Error;

use crate::version::{InvalidVersionId, VersionId};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("image write rejected for {id}: {reason}")]
    WriteRejected { id: VersionId, reason: String },

    #[error("volume for {0} not found")]
    VolumeNotFound(VersionId),

    #[error("boot environment update failed: {0}")]
    BootEnv(String),

    #[error("unit {unit} failed: {message}")]
    Unit { unit: String, message: String },

    #[error("already subscribed to unit signals")]
    AlreadySubscribed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidId(#[from] InvalidVersionId),
}

/// Flash and boot-environment operations for one storage layout.
pub trait FlashHelper: Send + Sync {
    /// Start writing `source` into the volume for `id`.
    ///
    /// On asynchronous layouts this only dispatches the write; completion is
    /// reported later as a unit state change for `flash-write-<id>`.
    fn write_image(&self, id: &VersionId, source: &Path) -> Result<(), FlashError>;

    /// Point the boot environment at `id`.
    fn update_boot_target(&self, id: &VersionId) -> Result<(), FlashError>;

    /// Record the redundancy priority of `id` in the boot environment.
    fn set_entry(&self, id: &VersionId, priority: u8) -> Result<(), FlashError>;

    /// Forget any priority entry for `id`.
    fn clear_entry(&self, id: &VersionId) -> Result<(), FlashError>;

    /// Remove the flashed volume/partitions of `id`.
    fn remove_version(&self, id: &VersionId) -> Result<(), FlashError>;

    /// Copy the active boot environment to the alternate copy.
    fn mirror_alternate(&self) -> Result<(), FlashError>;

    fn factory_reset(&self) -> Result<(), FlashError>;

    /// Bulk cleanup after `delete_all`.
    fn cleanup(&self) -> Result<(), FlashError>;

    /// Read a boot environment variable.
    fn env_var(&self, name: &str) -> Result<Option<String>, FlashError>;
}

/// Service-unit control (systemd or equivalent).
pub trait UnitManager: Send + Sync {
    fn start_unit(&self, unit: &str) -> Result<(), FlashError>;

    fn stop_unit(&self, unit: &str) -> Result<(), FlashError>;

    fn mask_unit_files(&self, units: &[&str]) -> Result<(), FlashError>;

    /// Ask for unit state-change notifications.
    fn subscribe(&self) -> Result<(), FlashError>;

    fn unsubscribe(&self) -> Result<(), FlashError>;
}

/// The service holding uploaded images until they are flashed.
pub trait UploadManager: Send + Sync {
    fn delete_upload(&self, id: &VersionId) -> Result<(), FlashError>;
}

/// Image signature verification.
pub trait SignatureVerifier: Send + Sync {
    /// `true` when every signed file in `image_dir` verifies.
    fn verify(&self, image_dir: &Path) -> bool;
}

/// A unit state-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStateChange {
    pub unit: String,
    /// `done`, `failed`, or anything else the unit manager reports.
    pub result: String,
}

impl UnitStateChange {
    pub fn new(unit: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            result: result.into(),
        }
    }
}

/// Unit reporting completion of a BMC flash write.
pub fn flash_write_unit(id: &VersionId) -> String {
    format!("flash-write-{id}")
}

/// Unit writing a host BIOS image.
pub fn host_bios_unit(id: &VersionId) -> String {
    format!("flash-host-bios-{id}")
}

pub const REBOOT_GUARD_ENABLE_UNIT: &str = "reboot-guard-enable.service";
pub const REBOOT_GUARD_DISABLE_UNIT: &str = "reboot-guard-disable.service";
pub const FORCE_REBOOT_UNIT: &str = "force-reboot.service";
pub const FIELD_MODE_SETENV_UNIT: &str = "obmc-flash-bmc-setenv@fieldmode\\x3dtrue.service";
pub const USR_LOCAL_MOUNT_UNIT: &str = "usr-local.mount";
