//! Mock platform for testing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::traits::{FlashError, FlashHelper, SignatureVerifier, UnitManager, UploadManager};
use crate::version::VersionId;

/// Recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    WriteImage { id: VersionId, source: PathBuf },
    UpdateBootTarget(VersionId),
    SetEntry(VersionId, u8),
    ClearEntry(VersionId),
    RemoveVersion(VersionId),
    MirrorAlternate,
    FactoryReset,
    Cleanup,
    StartUnit(String),
    StopUnit(String),
    MaskUnitFiles(Vec<String>),
    Subscribe,
    Unsubscribe,
    DeleteUpload(VersionId),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<PlatformCall>,
    boot_target: Option<VersionId>,
    entries: BTreeMap<VersionId, u8>,
    env: BTreeMap<String, String>,
    reject_writes: bool,
    failing_units: BTreeSet<String>,
    signature_valid: bool,
    subscribed: bool,
}

/// Mock implementing every platform trait over one shared state.
///
/// Clones share state, so a test can hand clones to the updater and keep one
/// to inspect.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                signature_valid: true,
                ..Default::default()
            })),
        }
    }

    fn record(&self, call: PlatformCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Whether a call equal to `call` was recorded.
    pub fn saw(&self, call: &PlatformCall) -> bool {
        self.state.lock().unwrap().calls.contains(call)
    }

    pub fn boot_target(&self) -> Option<VersionId> {
        self.state.lock().unwrap().boot_target.clone()
    }

    pub fn entries(&self) -> BTreeMap<VersionId, u8> {
        self.state.lock().unwrap().entries.clone()
    }

    pub fn started_units(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PlatformCall::StartUnit(unit) => Some(unit),
                _ => None,
            })
            .collect()
    }

    /// Make every subsequent `write_image` fail.
    pub fn reject_writes(&self, reject: bool) {
        self.state.lock().unwrap().reject_writes = reject;
    }

    /// Make `start_unit`/`stop_unit` fail for `unit`.
    pub fn fail_unit(&self, unit: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_units
            .insert(unit.to_string());
    }

    pub fn set_signature_valid(&self, valid: bool) {
        self.state.lock().unwrap().signature_valid = valid;
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .env
            .insert(name.to_string(), value.to_string());
    }

    fn unit_result(&self, unit: &str) -> Result<(), FlashError> {
        if self.state.lock().unwrap().failing_units.contains(unit) {
            return Err(FlashError::Unit {
                unit: unit.to_string(),
                message: "mock failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashHelper for MockPlatform {
    fn write_image(&self, id: &VersionId, source: &Path) -> Result<(), FlashError> {
        self.record(PlatformCall::WriteImage {
            id: id.clone(),
            source: source.to_path_buf(),
        });
        if self.state.lock().unwrap().reject_writes {
            return Err(FlashError::WriteRejected {
                id: id.clone(),
                reason: "mock rejection".into(),
            });
        }
        Ok(())
    }

    fn update_boot_target(&self, id: &VersionId) -> Result<(), FlashError> {
        self.record(PlatformCall::UpdateBootTarget(id.clone()));
        self.state.lock().unwrap().boot_target = Some(id.clone());
        Ok(())
    }

    fn set_entry(&self, id: &VersionId, priority: u8) -> Result<(), FlashError> {
        self.record(PlatformCall::SetEntry(id.clone(), priority));
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(id.clone(), priority);
        Ok(())
    }

    fn clear_entry(&self, id: &VersionId) -> Result<(), FlashError> {
        self.record(PlatformCall::ClearEntry(id.clone()));
        self.state.lock().unwrap().entries.remove(id);
        Ok(())
    }

    fn remove_version(&self, id: &VersionId) -> Result<(), FlashError> {
        self.record(PlatformCall::RemoveVersion(id.clone()));
        Ok(())
    }

    fn mirror_alternate(&self) -> Result<(), FlashError> {
        self.record(PlatformCall::MirrorAlternate);
        Ok(())
    }

    fn factory_reset(&self) -> Result<(), FlashError> {
        self.record(PlatformCall::FactoryReset);
        Ok(())
    }

    fn cleanup(&self) -> Result<(), FlashError> {
        self.record(PlatformCall::Cleanup);
        Ok(())
    }

    fn env_var(&self, name: &str) -> Result<Option<String>, FlashError> {
        Ok(self.state.lock().unwrap().env.get(name).cloned())
    }
}

impl UnitManager for MockPlatform {
    fn start_unit(&self, unit: &str) -> Result<(), FlashError> {
        self.record(PlatformCall::StartUnit(unit.to_string()));
        self.unit_result(unit)
    }

    fn stop_unit(&self, unit: &str) -> Result<(), FlashError> {
        self.record(PlatformCall::StopUnit(unit.to_string()));
        self.unit_result(unit)
    }

    fn mask_unit_files(&self, units: &[&str]) -> Result<(), FlashError> {
        self.record(PlatformCall::MaskUnitFiles(
            units.iter().map(|u| u.to_string()).collect(),
        ));
        Ok(())
    }

    fn subscribe(&self) -> Result<(), FlashError> {
        self.record(PlatformCall::Subscribe);
        let mut state = self.state.lock().unwrap();
        if state.subscribed {
            return Err(FlashError::AlreadySubscribed);
        }
        state.subscribed = true;
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), FlashError> {
        self.record(PlatformCall::Unsubscribe);
        self.state.lock().unwrap().subscribed = false;
        Ok(())
    }
}

impl UploadManager for MockPlatform {
    fn delete_upload(&self, id: &VersionId) -> Result<(), FlashError> {
        self.record(PlatformCall::DeleteUpload(id.clone()));
        Ok(())
    }
}

impl SignatureVerifier for MockPlatform {
    fn verify(&self, _image_dir: &Path) -> bool {
        self.state.lock().unwrap().signature_valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_calls() {
        let mock = MockPlatform::new();
        let id = VersionId::new("abcd1234");
        mock.write_image(&id, Path::new("/tmp/images/abcd1234")).unwrap();
        mock.update_boot_target(&id).unwrap();

        assert_eq!(mock.calls().len(), 2);
        assert_eq!(mock.boot_target(), Some(id));
    }

    #[test]
    fn test_mock_shared_between_clones() {
        let mock = MockPlatform::new();
        let clone = mock.clone();
        clone.set_entry(&VersionId::new("a"), 3).unwrap();
        assert_eq!(mock.entries().get(&VersionId::new("a")), Some(&3));
    }

    #[test]
    fn test_mock_failures() {
        let mock = MockPlatform::new();
        mock.reject_writes(true);
        mock.fail_unit("force-reboot.service");
        assert!(mock.write_image(&VersionId::new("a"), Path::new("/x")).is_err());
        assert!(mock.start_unit("force-reboot.service").is_err());
        assert!(mock.start_unit("other.service").is_ok());

        assert!(mock.subscribe().is_ok());
        assert!(matches!(mock.subscribe(), Err(FlashError::AlreadySubscribed)));
    }
}
