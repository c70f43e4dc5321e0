//! Item updater - owns every known version and drives its activation.
//!
//! The updater is a single logical actor: every mutation takes `&mut self`,
//! so no two transitions (or a transition and a registry mutation) can
//! interleave. Work that must not run while a notification is still being
//! dispatched is queued as a [`PendingAction`] and drained afterwards.

mod activation;
mod discovery;
mod host;
mod objects;
mod priority;
mod registry;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

pub use host::BiosObject;
pub use objects::{ActivationInfo, PriorityInfo, VersionInfo};
pub use registry::UploadNotification;

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::events::{LogLevel, TracingObserver, UpdaterEvent, UpdaterObserver};
use crate::msl::MinimumShipLevel;
use crate::platform::{
    FlashError, FlashHelper, MockPlatform, SignatureVerifier, UnitManager, UnitStateChange,
    UploadManager,
};
use crate::state::{Activation, ActivationState, AssociationSet};
use crate::store::{MemoryStore, PersistStore};
use crate::validate::ImageValidator;
use crate::version::{VersionId, VersionPurpose, VersionRecord};

/// Priority given to failed or priority-less images when choosing what to
/// evict. Above every real priority, so they go first.
pub const EVICTION_SENTINEL_PRIORITY: u32 = 999;

/// External collaborators of the updater.
pub struct Backends {
    pub flash: Box<dyn FlashHelper>,
    pub units: Arc<dyn UnitManager>,
    pub uploads: Box<dyn UploadManager>,
    pub store: Box<dyn PersistStore>,
    pub signature: Option<Box<dyn SignatureVerifier>>,
}

impl Backends {
    /// Every collaborator backed by one mock platform and an in-memory store.
    pub fn mock(platform: &MockPlatform, store: &MemoryStore) -> Self {
        Self {
            flash: Box::new(platform.clone()),
            units: Arc::new(platform.clone()),
            uploads: Box::new(platform.clone()),
            store: Box::new(store.clone()),
            signature: Some(Box::new(platform.clone())),
        }
    }
}

/// Work deferred until the current dispatch has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Erase(VersionId),
}

pub struct ItemUpdater<O: UpdaterObserver = TracingObserver> {
    config: UpdaterConfig,
    msl: MinimumShipLevel,
    validator: ImageValidator,
    flash: Box<dyn FlashHelper>,
    units: Arc<dyn UnitManager>,
    uploads: Box<dyn UploadManager>,
    store: Box<dyn PersistStore>,
    observer: Arc<O>,
    versions: BTreeMap<VersionId, VersionRecord>,
    activations: BTreeMap<VersionId, Activation>,
    associations: AssociationSet,
    pending: VecDeque<PendingAction>,
    field_mode: bool,
    bios: Option<BiosObject>,
}

impl ItemUpdater<TracingObserver> {
    /// Create an updater with the default tracing observer.
    pub fn new(config: UpdaterConfig, backends: Backends) -> Result<Self> {
        Self::with_observer(config, backends, Arc::new(TracingObserver))
    }
}

impl<O: UpdaterObserver> ItemUpdater<O> {
    /// Create an updater with a custom observer.
    pub fn with_observer(
        config: UpdaterConfig,
        backends: Backends,
        observer: Arc<O>,
    ) -> Result<Self> {
        let msl = config
            .minimum_ship_level()
            .map_err(|e| UpdaterError::Config(format!("minimum ship level pattern: {e}")))?;

        let mut validator = ImageValidator::new(
            config.full_image_files.clone(),
            config.split_image_files.clone(),
        );
        if config.signature.enabled {
            let verifier = backends.signature.ok_or_else(|| {
                UpdaterError::Config("signature verification enabled without a verifier".into())
            })?;
            validator = validator.with_signature(verifier);
        }

        if config.active_max_allowed == 0 {
            return Err(UpdaterError::Config("active_max_allowed must be at least 1".into()));
        }

        let host_bios_upgrade = config.host_bios_upgrade;
        let mut updater = Self {
            config,
            msl,
            validator,
            flash: backends.flash,
            units: backends.units,
            uploads: backends.uploads,
            store: backends.store,
            observer,
            versions: BTreeMap::new(),
            activations: BTreeMap::new(),
            associations: AssociationSet::new(),
            pending: VecDeque::new(),
            field_mode: false,
            bios: None,
        };
        if host_bios_upgrade {
            updater.create_bios_object();
        }
        Ok(updater)
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    pub fn version(&self, id: &VersionId) -> Option<&VersionRecord> {
        self.versions.get(id)
    }

    pub fn activation(&self, id: &VersionId) -> Option<&Activation> {
        self.activations.get(id)
    }

    pub fn versions(&self) -> impl Iterator<Item = &VersionRecord> {
        self.versions.values()
    }

    pub fn ids(&self) -> Vec<VersionId> {
        self.versions.keys().cloned().collect()
    }

    pub fn contains(&self, id: &VersionId) -> bool {
        self.versions.contains_key(id) || self.activations.contains_key(id)
    }

    /// Relations published by the updater itself (active, functional,
    /// updateable). Per-activation relations live on the activation.
    pub fn associations(&self) -> &AssociationSet {
        &self.associations
    }

    /// The version currently running, if known.
    pub fn functional_id(&self) -> Option<&VersionId> {
        self.versions
            .values()
            .find(|v| v.functional)
            .map(|v| &v.id)
    }

    pub fn field_mode_enabled(&self) -> bool {
        self.field_mode
    }

    pub fn pending_actions(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.iter()
    }

    fn emit(&self, event: UpdaterEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UpdaterEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn object_path(&self, id: &VersionId) -> String {
        crate::state::object_path(&self.config.software_object_path, id)
    }

    fn purpose_of(&self, id: &VersionId) -> VersionPurpose {
        self.versions
            .get(id)
            .map(|v| v.purpose)
            .unwrap_or_default()
    }

    fn is_functional(&self, id: &VersionId) -> bool {
        self.versions.get(id).is_some_and(|v| v.functional)
    }

    /// The functional image is protected whenever more than one slot exists.
    fn protects_functional(&self) -> bool {
        self.config.active_max_allowed > 1
    }

    fn activation_mut(&mut self, id: &VersionId) -> Result<&mut Activation> {
        self.activations
            .get_mut(id)
            .ok_or_else(|| UpdaterError::UnknownVersion(id.clone()))
    }

    /// Record a new observed state and notify observers.
    fn set_state(&mut self, id: &VersionId, to: ActivationState) {
        let Some(activation) = self.activations.get_mut(id) else {
            return;
        };
        let from = activation.state;
        activation.state = to;
        if from != to {
            self.emit(UpdaterEvent::StateChanged {
                id: id.clone(),
                from,
                to,
            });
        }
    }

    fn set_progress(&mut self, id: &VersionId, percent: u8) {
        if let Some(activation) = self.activations.get_mut(id) {
            activation.progress = Some(percent);
            self.emit(UpdaterEvent::Progress {
                id: id.clone(),
                percent,
            });
        }
    }

    /// Log a failed best-effort platform step without propagating it.
    fn best_effort(&self, what: &str, result: std::result::Result<(), FlashError>) {
        if let Err(e) = result {
            error!(step = what, error = %e, "Best-effort step failed");
        }
    }

    /// Dispatch a unit state-change notification to every activating image,
    /// then run whatever the handlers deferred.
    #[instrument(skip(self), fields(unit = %change.unit, result = %change.result))]
    pub fn handle_unit_state_change(&mut self, change: &UnitStateChange) {
        let activating: Vec<VersionId> = self
            .activations
            .values()
            .filter(|a| a.state == ActivationState::Activating)
            .map(|a| a.id.clone())
            .collect();

        for id in activating {
            if let Err(e) = self.unit_state_change(&id, change) {
                error!(id = %id, error = %e, "Failed to handle unit state change");
            }
        }

        self.drain_pending();
    }

    /// Run deferred actions queued by notification handlers.
    pub fn drain_pending(&mut self) {
        while let Some(action) = self.pending.pop_front() {
            debug!(action = ?action, "Running deferred action");
            match action {
                PendingAction::Erase(id) => {
                    if let Err(e) = self.erase(&id) {
                        warn!(id = %id, error = %e, "Deferred erase failed");
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::config;
    use super::*;

    #[test]
    fn test_construction_rejects_bad_config() {
        let platform = MockPlatform::new();
        let store = MemoryStore::new();
        for bad in [
            UpdaterConfig {
                msl_pattern: "(".into(),
                ..config(2)
            },
            UpdaterConfig {
                active_max_allowed: 0,
                ..config(2)
            },
        ] {
            let result = ItemUpdater::new(bad, Backends::mock(&platform, &store));
            assert!(matches!(result, Err(UpdaterError::Config(_))));
        }
    }
}
