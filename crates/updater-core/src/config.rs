//! Updater configuration.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::msl::{DEFAULT_MSL_PATTERN, MinimumShipLevel};
use crate::state::FlashLayout;

/// When a successfully written image takes effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyTime {
    /// Reboot as soon as the image is written.
    Immediate,
    /// Wait for an operator-initiated reboot.
    #[default]
    OnReset,
}

/// What a failed signature check does outside field mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Log the failure and keep activating.
    #[default]
    Warn,
    /// Fail the activation.
    Enforce,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub enabled: bool,
    pub policy: SignaturePolicy,
}

/// Configuration for an item updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Where read-only image volumes are mounted.
    pub media_dir: PathBuf,
    /// Directory-name prefix of image volumes under `media_dir`.
    pub rofs_prefix: String,
    /// Release descriptor of the running system.
    pub os_release_file: PathBuf,
    /// Where uploaded images wait for activation.
    pub upload_dir: PathBuf,
    /// Persisted per-version state and the local boot environment.
    pub state_dir: PathBuf,
    /// Root object path of software versions.
    pub software_object_path: String,
    /// Inventory item the images belong to.
    pub bmc_inventory_path: String,
    /// Object path of the host BIOS singleton.
    pub bios_object_path: String,
    /// Maximum number of installed (active or failed) images.
    pub active_max_allowed: usize,
    /// Minimum ship level; empty or absent disables the check.
    pub minimum_ship_level: Option<String>,
    pub msl_pattern: String,
    /// Files making up a full flash image.
    pub full_image_files: Vec<String>,
    /// Files making up a split-partition image.
    pub split_image_files: Vec<String>,
    pub layout: FlashLayout,
    pub host_bios_upgrade: bool,
    pub apply_time: ApplyTime,
    /// Log unit commands instead of running them.
    pub dry_run_units: bool,
    pub signature: SignatureConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("/media"),
            rofs_prefix: "rofs-".to_string(),
            os_release_file: PathBuf::from("/etc/os-release"),
            upload_dir: PathBuf::from("/tmp/images"),
            state_dir: PathBuf::from("/var/lib/bmc-updater"),
            software_object_path: "/xyz/openbmc_project/software".to_string(),
            bmc_inventory_path: "/xyz/openbmc_project/inventory/system/chassis/bmc".to_string(),
            bios_object_path: "/xyz/openbmc_project/software/bios_active".to_string(),
            active_max_allowed: 2,
            minimum_ship_level: None,
            msl_pattern: DEFAULT_MSL_PATTERN.to_string(),
            full_image_files: vec!["image-bmc".to_string()],
            split_image_files: vec![
                "image-kernel".to_string(),
                "image-rofs".to_string(),
                "image-rwfs".to_string(),
                "image-u-boot".to_string(),
            ],
            layout: FlashLayout::Static,
            host_bios_upgrade: false,
            apply_time: ApplyTime::OnReset,
            dry_run_units: false,
            signature: SignatureConfig::default(),
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdaterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn minimum_ship_level(&self) -> Result<MinimumShipLevel> {
        Ok(MinimumShipLevel::new(
            self.minimum_ship_level.as_deref(),
            &self.msl_pattern,
        )?)
    }

    pub fn persist_dir(&self) -> PathBuf {
        self.state_dir.join("versions")
    }

    pub fn boot_env_file(&self) -> PathBuf {
        self.state_dir.join("boot-env.toml")
    }
}
