//! `ImagesLock` document (`.imgpkg/images.yml`).

use std::path::Path;

use imgbundle_core::error::Result;
use imgbundle_core::LOCK_API_VERSION;
use serde::{Deserialize, Serialize};

use super::{check_digest_form, check_header, parse_yaml, read_lock_file, ImageRef};

/// `kind` of an images lock document.
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";

/// Every image a bundle depends on, pinned by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl Default for ImagesLock {
    fn default() -> Self {
        Self {
            api_version: LOCK_API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            images: Vec::new(),
        }
    }
}

impl ImagesLock {
    pub fn new(images: Vec<ImageRef>) -> Self {
        Self {
            images,
            ..Default::default()
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let lock: ImagesLock = parse_yaml(data, "images lock")?;
        lock.validate()?;
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(&read_lock_file(path)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        tracing::debug!(path = %path.display(), images = self.images.len(), "Wrote images lock");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_header(&self.api_version, &self.kind, IMAGES_LOCK_KIND)?;
        self.images
            .iter()
            .try_for_each(|img| check_digest_form(&img.image))
    }
}
