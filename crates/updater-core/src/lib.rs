//! Updater-Core: firmware image lifecycle management for a BMC.
//!
//! This crate tracks every firmware image known to a management controller,
//! drives uploaded images through validation and flashing, keeps the boot
//! redundancy priorities consistent and evicts old images when the image
//! slots run out, without ever pointing the boot environment at an image
//! that no longer exists.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Version**: Version records, ids, release descriptors and manifests
//! - **MSL**: Minimum ship level policy
//! - **Validate**: Image manifest and signature checks
//! - **Platform**: Flash, boot environment and unit abstraction (local, mock)
//! - **Store**: Persisted per-version state
//! - **State**: Activation states, reboot guard and associations
//! - **Events**: Observer pattern for front-end decoupling
//! - **Updater**: The item updater owning the registry
//!
//! # Example
//!
//! ```no_run
//! use updater_core::{Backends, ItemUpdater, MockPlatform, MemoryStore, UpdaterConfig};
//!
//! let platform = MockPlatform::new();
//! let store = MemoryStore::new();
//! let mut updater = ItemUpdater::new(UpdaterConfig::default(), Backends::mock(&platform, &store))
//!     .expect("invalid configuration");
//! updater.process_bmc_image().expect("discovery failed");
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod msl;
pub mod platform;
pub mod state;
pub mod store;
pub mod updater;
pub mod validate;
pub mod version;

// Re-exports for convenience
pub use config::{ApplyTime, SignatureConfig, SignaturePolicy, UpdaterConfig};
pub use error::{Result, UpdaterError};
pub use events::{
    LogLevel, NullObserver, RecordingObserver, TracingObserver, UpdaterEvent, UpdaterObserver,
};
pub use msl::{MinimumShipLevel, MslVersion};
pub use platform::{
    FlashError, FlashHelper, FsFlashHelper, FsUploadManager, MockPlatform, SignatureVerifier,
    SystemctlUnits, UnitManager, UnitStateChange, UploadManager,
};
pub use state::{ActivationState, FlashLayout, RequestedActivation};
pub use store::{FsPersistStore, MemoryStore, PersistStore};
pub use updater::{
    ActivationInfo, Backends, ItemUpdater, PendingAction, PriorityInfo, UploadNotification,
    VersionInfo,
};
pub use validate::{DigestVerifier, ImageValidator};
pub use version::{InvalidVersionId, VersionId, VersionPurpose, VersionRecord};
