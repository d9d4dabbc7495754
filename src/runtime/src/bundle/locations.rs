//! Registry-resident record of where a bundle's images were relocated.
//!
//! Stored next to the bundle as an image tagged
//! `sha256-<hex>.image-locations.imgpkg`, whose single gzip tar layer holds
//! `image-locations.yml`.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgbundle_core::error::{BundleError, Result};
use imgbundle_core::LOCK_API_VERSION;
use serde::{Deserialize, Serialize};

use crate::oci::{ImageReference, ImagesMetadata};

/// `kind` of a locations document.
pub const LOCATIONS_KIND: &str = "ImageLocations";

/// File name inside the locations layer.
pub const LOCATIONS_FILE: &str = "image-locations.yml";

const LOCATIONS_TAG_SUFFIX: &str = ".image-locations.imgpkg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageLocation {
    pub image: String,
    pub is_bundle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageLocationsConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<ImageLocation>,
}

impl ImageLocationsConfig {
    pub fn new(images: Vec<ImageLocation>) -> Self {
        Self {
            api_version: LOCK_API_VERSION.to_string(),
            kind: LOCATIONS_KIND.to_string(),
            images,
        }
    }

    pub fn find(&self, image: &str) -> Option<&ImageLocation> {
        self.images.iter().find(|loc| loc.image == image)
    }

    /// Encode as a gzip tar layer holding [`LOCATIONS_FILE`].
    pub fn to_layer(&self) -> Result<Vec<u8>> {
        let yaml = serde_yaml::to_string(self)?;

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        builder.mode(tar::HeaderMode::Deterministic);
        let mut header = tar::Header::new_gnu();
        header.set_size(yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, LOCATIONS_FILE, yaml.as_bytes())?;

        Ok(builder.into_inner()?.finish()?)
    }

    /// Decode a layer produced by [`Self::to_layer`].
    pub fn from_layer(layer: &[u8]) -> Result<Self> {
        let mut archive = tar::Archive::new(GzDecoder::new(layer));
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.file_name().and_then(|n| n.to_str()) != Some(LOCATIONS_FILE) {
                continue;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Self::from_bytes(&data);
        }
        Err(BundleError::Format(format!(
            "Expected locations layer to contain {}",
            LOCATIONS_FILE
        )))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let config: Self = serde_yaml::from_slice(data).map_err(|e| {
            BundleError::LockFormat(format!("Unmarshaling image locations: {}", e))
        })?;
        if config.kind != LOCATIONS_KIND {
            return Err(BundleError::LockFormat(format!(
                "Validating kind: Expected kind '{}', got '{}'",
                LOCATIONS_KIND, config.kind
            )));
        }
        Ok(config)
    }
}

/// Source of a bundle's locations record.
#[async_trait]
pub trait LocationsConfigFetcher: Send + Sync {
    /// The record, or [`BundleError::LocationsNotFound`] when none exists.
    async fn config(&self) -> Result<ImageLocationsConfig>;
}

/// Tag under which the locations record of the bundle with `digest` lives.
pub fn locations_tag(digest: &str) -> String {
    format!("{}{}", digest.replace(':', "-"), LOCATIONS_TAG_SUFFIX)
}

/// Fetches the locations record from the bundle's own repository.
pub struct RegistryLocationsConfig {
    metadata: Arc<dyn ImagesMetadata>,
    bundle: ImageReference,
}

impl RegistryLocationsConfig {
    /// `bundle` must be in digest form.
    pub fn new(metadata: Arc<dyn ImagesMetadata>, bundle: &str) -> Result<Self> {
        Ok(Self {
            metadata,
            bundle: ImageReference::parse_digest_form(bundle)?,
        })
    }

    fn config_reference(&self) -> String {
        let digest = self.bundle.digest.as_deref().unwrap_or_default();
        self.bundle.with_tag(locations_tag(digest)).full_reference()
    }
}

#[async_trait]
impl LocationsConfigFetcher for RegistryLocationsConfig {
    async fn config(&self) -> Result<ImageLocationsConfig> {
        let reference = self.config_reference();

        let manifest = match self.metadata.fetch_manifest(&reference).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                tracing::debug!(reference = %reference, "No locations record for bundle");
                return Err(BundleError::LocationsNotFound {
                    bundle: self.bundle.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let parsed = manifest.image_manifest()?;
        let layer = parsed.layers().first().ok_or_else(|| {
            BundleError::Format(format!("Expected locations image {} to have a layer", reference))
        })?;
        let bytes = self.metadata.fetch_blob(&reference, layer.digest()).await?;
        ImageLocationsConfig::from_layer(&bytes)
    }
}
