//! Platform layer module.

pub mod local;
pub mod mock;
pub mod traits;

pub use local::{BootEnv, FsFlashHelper, FsUploadManager, SystemctlUnits};
pub use mock::{MockPlatform, PlatformCall};
pub use traits::{
    FlashError, FlashHelper, SignatureVerifier, UnitManager, UnitStateChange, UploadManager,
    flash_write_unit, host_bios_unit,
};
