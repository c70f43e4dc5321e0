//! Per-image activation data.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use super::associations::Association;
use super::machine::{ActivationState, RequestedActivation};
use crate::platform::UnitManager;
use crate::platform::traits::{REBOOT_GUARD_DISABLE_UNIT, REBOOT_GUARD_ENABLE_UNIT};
use crate::version::VersionId;

/// Flags tracking the phases of a multi-step flash write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    pub rw_volume_created: bool,
    pub ro_volume_created: bool,
}

impl WriteFlags {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Keeps the controller from rebooting while an image is being written.
///
/// Engaged on creation and released on drop. Unit failures are logged only.
pub struct RebootGuard {
    units: Arc<dyn UnitManager>,
}

impl RebootGuard {
    pub fn engage(units: Arc<dyn UnitManager>) -> Self {
        info!("BMC image activating - BMC reboots are disabled");
        if let Err(e) = units.start_unit(REBOOT_GUARD_ENABLE_UNIT) {
            error!(error = %e, "Failed to enable reboot guard");
        }
        Self { units }
    }
}

impl Drop for RebootGuard {
    fn drop(&mut self) {
        info!("BMC activation has ended - BMC reboots are re-enabled");
        if let Err(e) = self.units.start_unit(REBOOT_GUARD_DISABLE_UNIT) {
            error!(error = %e, "Failed to disable reboot guard");
        }
    }
}

impl std::fmt::Debug for RebootGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RebootGuard")
    }
}

/// Activation entry of one version.
#[derive(Debug)]
pub struct Activation {
    pub id: VersionId,
    /// Object path of the version, used as the association target.
    pub path: String,
    pub state: ActivationState,
    pub requested: RequestedActivation,
    pub redundancy_priority: Option<u8>,
    pub progress: Option<u8>,
    pub(crate) guard: Option<RebootGuard>,
    pub flags: WriteFlags,
    /// Associations owned by this activation (e.g. the inventory item).
    pub associations: Vec<Association>,
}

impl Activation {
    pub fn new(
        id: VersionId,
        path: impl Into<String>,
        state: ActivationState,
        associations: Vec<Association>,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            state,
            requested: RequestedActivation::None,
            redundancy_priority: None,
            progress: None,
            guard: None,
            flags: WriteFlags::default(),
            associations,
        }
    }

    /// Drop the progress tracker and release the reboot guard.
    pub fn release_write_resources(&mut self) {
        self.progress = None;
        self.guard = None;
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

/// Object path of a version below the software root.
pub fn object_path(software_root: &str, id: &VersionId) -> String {
    let root = software_root.trim_end_matches('/');
    format!("{root}/{id}")
}

/// Upload directory of a version.
pub fn upload_path(upload_dir: &std::path::Path, id: &VersionId) -> PathBuf {
    upload_dir.join(id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MockPlatform, PlatformCall};

    #[test]
    fn test_reboot_guard_lifecycle() {
        let mock = MockPlatform::new();
        let guard = RebootGuard::engage(Arc::new(mock.clone()));
        assert_eq!(
            mock.calls(),
            vec![PlatformCall::StartUnit(REBOOT_GUARD_ENABLE_UNIT.into())]
        );
        drop(guard);
        assert_eq!(
            mock.started_units(),
            vec![REBOOT_GUARD_ENABLE_UNIT.to_string(), REBOOT_GUARD_DISABLE_UNIT.to_string()]
        );
    }

    #[test]
    fn test_reboot_guard_failure_is_swallowed() {
        let mock = MockPlatform::new();
        mock.fail_unit(REBOOT_GUARD_ENABLE_UNIT);
        let guard = RebootGuard::engage(Arc::new(mock.clone()));
        drop(guard);
        assert_eq!(mock.started_units().len(), 2);
    }

    #[test]
    fn test_release_write_resources() {
        let mock = MockPlatform::new();
        let mut activation = Activation::new(
            VersionId::new("a"),
            "/xyz/openbmc_project/software/a",
            ActivationState::Activating,
            Vec::new(),
        );
        activation.progress = Some(10);
        activation.guard = Some(RebootGuard::engage(Arc::new(mock)));
        activation.release_write_resources();
        assert!(activation.progress.is_none());
        assert!(!activation.is_guarded());
    }

    #[test]
    fn test_object_path() {
        assert_eq!(
            object_path("/xyz/openbmc_project/software/", &VersionId::new("1234abcd")),
            "/xyz/openbmc_project/software/1234abcd"
        );
    }
}
