//! Version records and the descriptor files they are derived from.
//!
//! Two descriptor formats are understood:
//!
//! - the release descriptor (`etc/os-release`) found inside every mounted
//!   read-only image volume, read during discovery;
//! - the upload `MANIFEST` shipped next to an uploaded image, which carries
//!   the purpose in addition to the version.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version id {0:?}: expected ASCII letters and digits")]
pub struct InvalidVersionId(pub String);

/// Stable identifier of a firmware version.
///
/// Derived from the version string, so the same image uploaded twice (or
/// flashed manually into two volumes) maps onto the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    /// Number of hex characters kept from the digest.
    pub const LEN: usize = 8;

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Id for a version string: leading hex digits of its SHA-512 digest.
    pub fn from_version(version: &str) -> Self {
        let digest = Sha512::digest(version.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(Self::LEN);
        Self(id)
    }

    /// Parse an id supplied from outside (command line, volume names).
    pub fn parse(raw: &str) -> Result<Self, InvalidVersionId> {
        let id = Self(raw.to_string());
        id.ensure_valid()?;
        Ok(id)
    }

    /// Ids name directories, so only non-empty ASCII alphanumerics are valid.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_alphanumeric())
    }

    pub fn ensure_valid(&self) -> Result<(), InvalidVersionId> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(InvalidVersionId(self.0.clone()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// What an image is meant to be flashed onto.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionPurpose {
    Bmc,
    Host,
    System,
    #[default]
    Unknown,
}

impl VersionPurpose {
    /// BMC and System images carry a BMC filesystem and are manifest-checked.
    pub fn is_bmc_class(&self) -> bool {
        matches!(self, VersionPurpose::Bmc | VersionPurpose::System)
    }
}

impl fmt::Display for VersionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPurpose::Bmc => write!(f, "BMC"),
            VersionPurpose::Host => write!(f, "Host"),
            VersionPurpose::System => write!(f, "System"),
            VersionPurpose::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for VersionPurpose {
    type Err = std::convert::Infallible;

    /// Accepts both the short form (`BMC`) and the fully qualified form
    /// (`xyz.openbmc_project.Software.Version.VersionPurpose.BMC`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.rsplit('.').next().unwrap_or(s);
        Ok(match short.to_ascii_lowercase().as_str() {
            "bmc" => VersionPurpose::Bmc,
            "host" => VersionPurpose::Host,
            "system" => VersionPurpose::System,
            _ => VersionPurpose::Unknown,
        })
    }
}

/// One known firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub id: VersionId,
    pub version: String,
    pub purpose: VersionPurpose,
    pub extended_version: String,
    /// Upload directory the image came from; empty for discovered volumes.
    pub source_path: PathBuf,
    /// Whether this is the version currently running.
    pub functional: bool,
}

impl VersionRecord {
    pub fn new(
        id: VersionId,
        version: impl Into<String>,
        purpose: VersionPurpose,
        extended_version: impl Into<String>,
        source_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            version: version.into(),
            purpose,
            extended_version: extended_version.into(),
            source_path: source_path.into(),
            functional: false,
        }
    }
}

/// Parse `KEY=value` / `KEY="value"` lines.
fn key_values(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (key, value) = line.split_once('=')?;
        Some((key.trim(), value.trim().trim_matches('"')))
    })
}

/// Fields of an `os-release` style release descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: String,
    pub extended_version: String,
}

impl ReleaseInfo {
    /// `VERSION_ID` wins over `VERSION`; `EXTENDED_VERSION` over `BUILD_ID`.
    pub fn parse(content: &str) -> Self {
        let mut info = ReleaseInfo::default();
        let mut version_fallback = String::new();
        let mut build_id = String::new();

        for (key, value) in key_values(content) {
            match key {
                "VERSION_ID" => info.version = value.to_string(),
                "VERSION" => version_fallback = value.to_string(),
                "EXTENDED_VERSION" => info.extended_version = value.to_string(),
                "BUILD_ID" => build_id = value.to_string(),
                _ => {}
            }
        }

        if info.version.is_empty() {
            info.version = version_fallback;
        }
        if info.extended_version.is_empty() {
            info.extended_version = build_id;
        }
        info
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Render back into descriptor form.
    pub fn render(&self) -> String {
        let mut out = format!("VERSION_ID=\"{}\"\n", self.version);
        if !self.extended_version.is_empty() {
            out.push_str(&format!("EXTENDED_VERSION=\"{}\"\n", self.extended_version));
        }
        out
    }
}

/// Upload `MANIFEST` as written by the image packaging tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageManifest {
    pub version: String,
    pub purpose: VersionPurpose,
    pub extended_version: String,
}

impl ImageManifest {
    pub const FILE_NAME: &'static str = "MANIFEST";

    pub fn parse(content: &str) -> Self {
        let mut manifest = ImageManifest::default();
        for (key, value) in key_values(content) {
            match key {
                "version" => manifest.version = value.to_string(),
                "purpose" => {
                    manifest.purpose = value.parse().unwrap_or_default();
                }
                "ExtendedVersion" => manifest.extended_version = value.to_string(),
                _ => {}
            }
        }
        manifest
    }

    pub fn load(image_dir: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(
            image_dir.join(Self::FILE_NAME),
        )?))
    }
}
