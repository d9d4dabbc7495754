//! Lock documents kept inside a bundle's `.imgpkg` directory.
//!
//! Every image a lock names must be pinned by digest; tags are rejected
//! at parse time rather than resolved.

mod bundle_lock;
mod images_lock;

pub use bundle_lock::{BundleLock, LockedBundle, BUNDLE_LOCK_KIND};
pub use images_lock::{ImagesLock, IMAGES_LOCK_KIND};

use std::collections::BTreeMap;

use imgbundle_core::error::{BundleError, Result};
use imgbundle_core::LOCK_API_VERSION;
use serde::{Deserialize, Serialize};

use crate::oci::ImageReference;

/// One locked image plus the places its content may also live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRef {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Candidate locations, newest first. Never serialized.
    #[serde(skip)]
    locations: Vec<String>,
}

impl ImageRef {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    /// Record a candidate location; it becomes the primary one.
    pub fn add_location(&mut self, location: impl Into<String>) {
        self.locations.insert(0, location.into());
    }

    /// Candidate locations in lookup order, ending with the image itself.
    pub fn locations(&self) -> Vec<String> {
        let mut all = self.locations.clone();
        all.push(self.image.clone());
        all
    }

    pub fn primary_location(&self) -> String {
        self.locations
            .first()
            .cloned()
            .unwrap_or_else(|| self.image.clone())
    }

    /// Copy whose only candidate location is `location`.
    pub fn discard_locations_except(&self, location: &str) -> ImageRef {
        let mut copy = self.deep_copy();
        copy.locations = vec![location.to_string()];
        copy
    }

    pub fn deep_copy(&self) -> ImageRef {
        self.clone()
    }
}

fn check_header(api_version: &str, kind: &str, expected_kind: &str) -> Result<()> {
    if api_version != LOCK_API_VERSION {
        return Err(BundleError::LockFormat(format!(
            "Validating apiVersion: Unknown version (known: {}), got '{}'",
            LOCK_API_VERSION, api_version
        )));
    }
    if kind != expected_kind {
        return Err(BundleError::LockFormat(format!(
            "Validating kind: Expected kind '{}', got '{}'",
            expected_kind, kind
        )));
    }
    Ok(())
}

fn check_digest_form(image: &str) -> Result<()> {
    ImageReference::parse_digest_form(image)
        .map(|_| ())
        .map_err(|e| BundleError::LockFormat(e.to_string()))
}

fn parse_yaml<T: serde::de::DeserializeOwned>(data: &[u8], what: &str) -> Result<T> {
    serde_yaml::from_slice(data)
        .map_err(|e| BundleError::LockFormat(format!("Unmarshaling {}: {}", what, e)))
}

fn read_lock_file(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        BundleError::LockFormat(format!("Reading path {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_locations_end_with_image() {
        let mut img = ImageRef::new(format!("docker.io/library/nginx@{}", DIGEST));
        img.add_location(format!("registry.local/bundle@{}", DIGEST));
        img.add_location(format!("mirror.local/bundle@{}", DIGEST));

        assert_eq!(
            img.locations(),
            vec![
                format!("mirror.local/bundle@{}", DIGEST),
                format!("registry.local/bundle@{}", DIGEST),
                format!("docker.io/library/nginx@{}", DIGEST),
            ]
        );
        assert_eq!(img.primary_location(), format!("mirror.local/bundle@{}", DIGEST));
    }

    #[test]
    fn test_primary_location_defaults_to_image() {
        let img = ImageRef::new("ghcr.io/org/app@sha256:abc");
        assert_eq!(img.primary_location(), "ghcr.io/org/app@sha256:abc");
    }

    #[test]
    fn test_discard_locations_except() {
        let mut img = ImageRef::new("ghcr.io/org/app@sha256:abc");
        img.add_location("registry.local/bundle@sha256:abc");

        let kept = img.discard_locations_except(&img.image.clone());
        assert_eq!(kept.primary_location(), "ghcr.io/org/app@sha256:abc");
        assert_eq!(img.primary_location(), "registry.local/bundle@sha256:abc");
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let mut img = ImageRef::new("ghcr.io/org/app@sha256:abc");
        let copy = img.deep_copy();
        img.add_location("elsewhere@sha256:abc");
        img.annotations.insert("k".to_string(), "v".to_string());

        assert_eq!(copy.locations(), vec!["ghcr.io/org/app@sha256:abc".to_string()]);
        assert!(copy.annotations.is_empty());
    }

    #[test]
    fn test_locations_not_serialized() {
        let mut img = ImageRef::new("ghcr.io/org/app@sha256:abc");
        img.add_location("elsewhere@sha256:abc");

        let yaml = serde_yaml::to_string(&img).unwrap();
        assert_eq!(yaml.trim(), "image: ghcr.io/org/app@sha256:abc");
    }
}
