//! Plain images: arbitrary files packed as one gzip tar layer.
//!
//! Bundles are plain images whose config carries the bundle label; the
//! bundle module layers validation and lock handling on top of this one.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgbundle_core::error::{BundleError, Result};
use sha2::{Digest, Sha256};

use crate::oci::metadata::{config_has_bundle_label, OCI_MANIFEST_MEDIA_TYPE};
use crate::oci::{ImageReference, ImagesMetadata, OciLayout, RegistryPusher};

const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Files and directories to publish as a single-layer image.
pub struct PlainContents {
    paths: Vec<PathBuf>,
    excluded_paths: Vec<PathBuf>,
}

impl PlainContents {
    pub fn new(paths: Vec<PathBuf>, excluded_paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            excluded_paths,
        }
    }

    /// Package and push to `upload_ref` with config `labels`. Returns `repo@digest`.
    pub async fn push(
        &self,
        upload_ref: &ImageReference,
        labels: &BTreeMap<String, String>,
        metadata: &dyn ImagesMetadata,
        pusher: &RegistryPusher,
    ) -> Result<String> {
        let staging = tempfile::tempdir()?;
        let layout = OciLayout::create(staging.path())?;
        self.stage(&layout, labels)?;
        pusher.push(upload_ref, &layout).await?;

        let pushed = metadata.fetch_manifest(&upload_ref.full_reference()).await?;
        let digest_ref = format!("{}@{}", upload_ref.repository_name(), pushed.digest);
        tracing::info!(image = %digest_ref, "Pushed image");
        Ok(digest_ref)
    }

    /// Write the image (one gzip tar layer, config with `labels`) into
    /// `layout` and return its manifest digest.
    pub fn stage(&self, layout: &OciLayout, labels: &BTreeMap<String, String>) -> Result<String> {
        let tar = self.tar_contents()?;
        let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&tar)));

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar)?;
        let layer = gz.finish()?;
        let layer_digest = layout.write_blob(&layer)?;

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "",
            "os": "",
            "config": { "Labels": labels },
            "rootfs": { "type": "layers", "diff_ids": [diff_id] },
        }))?;
        let config_digest = layout.write_blob(&config)?;

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": [{
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": layer_digest,
                "size": layer.len(),
            }],
        }))?;
        let manifest_digest = layout.write_blob(&manifest)?;
        layout.add_manifest(&manifest_digest, OCI_MANIFEST_MEDIA_TYPE, manifest.len() as u64, None)?;

        tracing::debug!(
            manifest = %manifest_digest,
            layer_size = layer.len(),
            "Staged image"
        );
        Ok(manifest_digest)
    }

    /// Uncompressed tar of the inputs: directory contents at the archive
    /// root, plain files by name.
    fn tar_contents(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        for input in &self.paths {
            if input.is_dir() {
                self.append_dir(&mut builder, input, input)?;
            } else {
                let name = input.file_name().ok_or_else(|| {
                    BundleError::Other(format!("Invalid input path {}", input.display()))
                })?;
                builder.append_path_with_name(input, name)?;
            }
        }
        Ok(builder.into_inner()?)
    }

    fn append_dir(&self, builder: &mut tar::Builder<Vec<u8>>, root: &Path, dir: &Path) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();

        for path in entries {
            if is_excluded(&self.excluded_paths, root, &path) {
                continue;
            }
            let name = path.strip_prefix(root).map_err(|e| BundleError::Other(e.to_string()))?;
            if path.is_dir() && !path.is_symlink() {
                builder.append_dir(name, &path)?;
                self.append_dir(builder, root, &path)?;
            } else {
                builder.append_path_with_name(&path, name)?;
            }
        }
        Ok(())
    }
}

/// Exclusions match either the full path or the path below its input.
pub(crate) fn is_excluded(excluded: &[PathBuf], root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).ok();
    excluded
        .iter()
        .any(|ex| ex == path || Some(ex.as_path()) == relative)
}

/// A single-manifest image fetched in full.
pub(crate) struct FetchedImage {
    /// `repo@digest`
    pub digest_ref: String,
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
}

impl FetchedImage {
    /// Fetch `reference`; `None` when it names an image index.
    pub(crate) async fn fetch(
        metadata: &dyn ImagesMetadata,
        reference: &str,
    ) -> Result<Option<FetchedImage>> {
        let parsed_ref = ImageReference::parse(reference)?;
        let manifest = metadata.fetch_manifest(reference).await?;
        if manifest.is_index() {
            return Ok(None);
        }
        let parsed = manifest.image_manifest()?;

        let config = metadata.fetch_blob(reference, parsed.config().digest()).await?;
        let mut layers = Vec::with_capacity(parsed.layers().len());
        for layer in parsed.layers() {
            layers.push(metadata.fetch_blob(reference, layer.digest()).await?);
        }

        Ok(Some(FetchedImage {
            digest_ref: format!("{}@{}", parsed_ref.repository_name(), manifest.digest),
            config,
            layers,
        }))
    }

    pub(crate) fn is_bundle(&self) -> Result<bool> {
        config_has_bundle_label(&self.config).map_err(|e| {
            BundleError::OciImageError(format!("Failed to parse config of {}: {}", self.digest_ref, e))
        })
    }

    /// Extract every layer into `output`, in order.
    pub(crate) fn unpack(&self, output: &Path) -> Result<()> {
        std::fs::create_dir_all(output)?;
        for layer in &self.layers {
            tar::Archive::new(GzDecoder::new(layer.as_slice())).unpack(output)?;
        }
        Ok(())
    }
}

/// A plain (non-bundle) image in a registry.
pub struct PlainImage {
    reference: String,
    metadata: Arc<dyn ImagesMetadata>,
}

impl PlainImage {
    pub fn new(reference: impl Into<String>, metadata: Arc<dyn ImagesMetadata>) -> Self {
        Self {
            reference: reference.into(),
            metadata,
        }
    }

    /// Unpack the image's layers into `output`. Returns `repo@digest`.
    ///
    /// Bundles are refused; they must be pulled as bundles so their lock
    /// is localized.
    pub async fn pull(&self, output: &Path) -> Result<String> {
        let image = FetchedImage::fetch(self.metadata.as_ref(), &self.reference)
            .await?
            .ok_or_else(|| {
                BundleError::OciImageError(format!(
                    "Expected single image but found image index '{}'",
                    self.reference
                ))
            })?;
        if image.is_bundle()? {
            return Err(BundleError::Content(format!(
                "Expected plain image but found bundle '{}' (hint: use -b instead of -i for bundles)",
                self.reference
            )));
        }

        tracing::info!(image = %image.digest_ref, output = %output.display(), "Pulling image");
        image.unpack(output)?;
        Ok(image.digest_ref)
    }
}
