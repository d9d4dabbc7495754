//! Registry read capability consumed by the bundle and lock engines.

use async_trait::async_trait;
use imgbundle_core::error::{BundleError, Result};
use imgbundle_core::BUNDLE_CONFIG_LABEL;
use oci_spec::image::ImageManifest;

/// OCI image index media type.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker manifest list media type.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image manifest media type.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Raw manifest as served by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedManifest {
    /// Manifest bytes exactly as served
    pub bytes: Vec<u8>,
    /// Content digest of `bytes`
    pub digest: String,
    /// Manifest media type
    pub media_type: String,
}

impl FetchedManifest {
    /// Whether this manifest is an image index / manifest list.
    pub fn is_index(&self) -> bool {
        is_index_media_type(&self.media_type)
    }

    /// Parse as a single-image manifest.
    pub fn image_manifest(&self) -> Result<ImageManifest> {
        if self.is_index() {
            return Err(BundleError::OciImageError(format!(
                "Expected an image manifest, got index {}",
                self.digest
            )));
        }
        serde_json::from_slice(&self.bytes).map_err(|e| {
            BundleError::OciImageError(format!("Failed to parse manifest {}: {}", self.digest, e))
        })
    }
}

/// Whether `media_type` denotes an image index.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}

/// Infer a manifest's media type from its `mediaType` field, falling back to
/// its shape when the field is absent.
pub fn detect_media_type(bytes: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Ok(mt.to_string());
    }
    if value.get("manifests").is_some() {
        Ok(OCI_INDEX_MEDIA_TYPE.to_string())
    } else {
        Ok(OCI_MANIFEST_MEDIA_TYPE.to_string())
    }
}

/// Read access to image metadata and content in a registry.
///
/// Implementors supply manifest and blob fetches; existence and bundle
/// lookups are derived from them.
#[async_trait]
pub trait ImagesMetadata: Send + Sync {
    /// Fetch the manifest for `reference`.
    ///
    /// Must fail with [`BundleError::ImageNotFound`] when the registry
    /// reports the reference as absent.
    async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest>;

    /// Fetch blob `digest` from the repository of `reference`.
    async fn fetch_blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>>;

    /// Whether `reference` exists.
    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.fetch_manifest(reference).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// First reference of `candidates`, in order, that exists.
    async fn first_image_exists(&self, candidates: &[String]) -> Result<String> {
        for candidate in candidates {
            if self.image_exists(candidate).await? {
                tracing::debug!(image = %candidate, "Found image");
                return Ok(candidate.clone());
            }
            tracing::debug!(image = %candidate, "Image not present");
        }
        Err(BundleError::ImageNotFound(format!(
            "none of the locations exist: {}",
            candidates.join(", ")
        )))
    }

    /// Whether `reference` is itself a bundle (config carries the bundle label).
    async fn probe_is_bundle(&self, reference: &str) -> Result<bool> {
        let manifest = self.fetch_manifest(reference).await?;
        if manifest.is_index() {
            return Ok(false);
        }
        let parsed = manifest.image_manifest()?;
        let config_bytes = self
            .fetch_blob(reference, parsed.config().digest())
            .await?;
        config_has_bundle_label(&config_bytes).map_err(|e| {
            BundleError::OciImageError(format!(
                "Failed to parse config of {}: {}",
                reference, e
            ))
        })
    }
}

/// Whether raw image config bytes carry the bundle label.
///
/// Parsed loosely: bundle configs leave `os`/`architecture` empty.
pub fn config_has_bundle_label(config: &[u8]) -> serde_json::Result<bool> {
    let value: serde_json::Value = serde_json::from_slice(config)?;
    Ok(value
        .pointer("/config/Labels")
        .and_then(|labels| labels.get(BUNDLE_CONFIG_LABEL))
        .is_some())
}
