//! `BundleLock` document: written by `push --lock-output`, read back by
//! `pull --lock` and `copy --lock`.

use std::path::Path;

use imgbundle_core::error::Result;
use imgbundle_core::LOCK_API_VERSION;
use serde::{Deserialize, Serialize};

use super::{check_digest_form, check_header, parse_yaml, read_lock_file};

/// `kind` of a bundle lock document.
pub const BUNDLE_LOCK_KIND: &str = "BundleLock";

/// The pushed bundle, by digest, plus the tag it was pushed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockedBundle {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Names one pushed bundle by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BundleLock {
    pub api_version: String,
    pub kind: String,
    pub bundle: LockedBundle,
}

impl BundleLock {
    pub fn new(image: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            api_version: LOCK_API_VERSION.to_string(),
            kind: BUNDLE_LOCK_KIND.to_string(),
            bundle: LockedBundle {
                image: image.into(),
                tag,
            },
        }
    }

    /// Parse and validate; the bundle must be in digest form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let lock: BundleLock = parse_yaml(data, "bundle lock")?;
        check_header(&lock.api_version, &lock.kind, BUNDLE_LOCK_KIND)?;
        check_digest_form(&lock.bundle.image)?;
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(&read_lock_file(path)?)
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}
