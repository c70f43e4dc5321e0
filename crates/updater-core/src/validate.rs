//! Image validation: file manifests and signatures.

use std::fs::File;
use std::path::Path;

use sha2::{Digest, Sha512};
use tracing::{debug, error, warn};

use crate::platform::SignatureVerifier;
use crate::version::VersionPurpose;

/// Outcome of validating an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    Ready,
    Invalid,
}

/// Outcome of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    Failed,
    /// Verification is not enabled.
    Skipped,
}

/// Which manifest an image directory satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    FullImage,
    SplitPartitions,
}

pub struct ImageValidator {
    full_image: Vec<String>,
    split_partitions: Vec<String>,
    signature: Option<Box<dyn SignatureVerifier>>,
}

impl ImageValidator {
    pub fn new(full_image: Vec<String>, split_partitions: Vec<String>) -> Self {
        Self {
            full_image,
            split_partitions,
            signature: None,
        }
    }

    /// Enable signature verification with `verifier`.
    pub fn with_signature(mut self, verifier: Box<dyn SignatureVerifier>) -> Self {
        self.signature = Some(verifier);
        self
    }

    pub fn signature_enabled(&self) -> bool {
        self.signature.is_some()
    }

    /// Every listed file exists and can be opened.
    fn check_files(dir: &Path, files: &[String]) -> bool {
        !files.is_empty()
            && files.iter().all(|name| {
                let ok = File::open(dir.join(name)).is_ok();
                if !ok {
                    debug!(dir = %dir.display(), file = %name, "Image file missing");
                }
                ok
            })
    }

    /// Match `dir` against the full-image manifest, then the split one.
    pub fn detect_layout(&self, dir: &Path) -> Option<ImageLayout> {
        if Self::check_files(dir, &self.full_image) {
            Some(ImageLayout::FullImage)
        } else if Self::check_files(dir, &self.split_partitions) {
            Some(ImageLayout::SplitPartitions)
        } else {
            None
        }
    }

    pub fn validate(&self, dir: &Path, purpose: VersionPurpose) -> ActivationStatus {
        if !purpose.is_bmc_class() {
            return ActivationStatus::Ready;
        }
        match self.detect_layout(dir) {
            Some(layout) => {
                debug!(dir = %dir.display(), layout = ?layout, "Image manifest satisfied");
                ActivationStatus::Ready
            }
            None => {
                error!(dir = %dir.display(), "Failed to find the needed BMC images");
                ActivationStatus::Invalid
            }
        }
    }

    pub fn verify_signature(&self, dir: &Path) -> SignatureCheck {
        match &self.signature {
            None => SignatureCheck::Skipped,
            Some(verifier) if verifier.verify(dir) => SignatureCheck::Verified,
            Some(_) => SignatureCheck::Failed,
        }
    }
}

/// Verifier checking `<file>.sha512` side files (hex SHA-512 digests).
///
/// Every listed file present in the image must carry a matching digest, and
/// at least one must be present.
#[derive(Debug, Clone)]
pub struct DigestVerifier {
    files: Vec<String>,
}

impl DigestVerifier {
    pub const SUFFIX: &'static str = ".sha512";

    pub fn new(files: Vec<String>) -> Self {
        Self { files }
    }

    fn digest_matches(dir: &Path, name: &str) -> bool {
        let sidecar = dir.join(format!("{name}{}", Self::SUFFIX));
        let (Ok(data), Ok(expected)) = (
            std::fs::read(dir.join(name)),
            std::fs::read_to_string(&sidecar),
        ) else {
            warn!(file = %name, "Missing file or digest");
            return false;
        };
        let actual = hex::encode(Sha512::digest(&data));
        let matches = actual.eq_ignore_ascii_case(expected.trim());
        if !matches {
            warn!(file = %name, "Digest mismatch");
        }
        matches
    }
}

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, image_dir: &Path) -> bool {
        let present: Vec<&String> = self
            .files
            .iter()
            .filter(|name| image_dir.join(name).is_file())
            .collect();
        !present.is_empty()
            && present
                .into_iter()
                .all(|name| Self::digest_matches(image_dir, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;
    use std::fs;
    use tempfile::TempDir;

    fn validator() -> ImageValidator {
        ImageValidator::new(
            vec!["image-bmc".into()],
            vec![
                "image-kernel".into(),
                "image-rofs".into(),
                "image-rwfs".into(),
                "image-u-boot".into(),
            ],
        )
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_full_image_wins() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), &["image-bmc", "image-kernel"]);
        assert_eq!(validator().detect_layout(tmp.path()), Some(ImageLayout::FullImage));
        assert_eq!(
            validator().validate(tmp.path(), VersionPurpose::Bmc),
            ActivationStatus::Ready
        );
    }

    #[test]
    fn test_split_partitions() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), &["image-kernel", "image-rofs", "image-rwfs", "image-u-boot"]);
        assert_eq!(
            validator().detect_layout(tmp.path()),
            Some(ImageLayout::SplitPartitions)
        );
    }

    #[test]
    fn test_incomplete_split_is_invalid() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), &["image-kernel", "image-rofs"]);
        assert_eq!(
            validator().validate(tmp.path(), VersionPurpose::System),
            ActivationStatus::Invalid
        );
    }

    #[test]
    fn test_host_images_skip_manifest() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            validator().validate(tmp.path(), VersionPurpose::Host),
            ActivationStatus::Ready
        );
    }

    #[test]
    fn test_signature_routes() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(validator().verify_signature(tmp.path()), SignatureCheck::Skipped);

        let mock = MockPlatform::new();
        let signed = validator().with_signature(Box::new(mock.clone()));
        assert_eq!(signed.verify_signature(tmp.path()), SignatureCheck::Verified);
        mock.set_signature_valid(false);
        assert_eq!(signed.verify_signature(tmp.path()), SignatureCheck::Failed);
    }

    #[test]
    fn test_digest_verifier() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), &["image-bmc"]);
        let verifier = DigestVerifier::new(vec!["image-bmc".into(), "image-kernel".into()]);
        assert!(!verifier.verify(tmp.path()));

        let digest = hex::encode(Sha512::digest(b"image-bmc"));
        fs::write(tmp.path().join("image-bmc.sha512"), format!("{digest}\n")).unwrap();
        assert!(verifier.verify(tmp.path()));

        fs::write(tmp.path().join("image-bmc"), b"tampered").unwrap();
        assert!(!verifier.verify(tmp.path()));
    }
}
