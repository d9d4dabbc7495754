//! On-disk OCI image layout.
//!
//! ```text
//! root/
//! ├── oci-layout     {"imageLayoutVersion":"1.0.0"}
//! ├── index.json     top-level manifests
//! └── blobs/sha256/  manifests, configs, layers by digest
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use imgbundle_core::error::{BundleError, Result};
use sha2::{Digest, Sha256};

use crate::imagedesc::{BlobSource, DescribedImage, DescribedIndex, ImageOrIndex};

use super::metadata::OCI_INDEX_MEDIA_TYPE;

/// Annotation carrying the reference name of an index entry.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Create (or reuse) a layout at `root`.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs").join("sha256"))?;
        std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)?;
        let layout = Self {
            root: root.to_path_buf(),
        };
        if !layout.index_path().exists() {
            layout.write_index(&empty_index())?;
        }
        Ok(layout)
    }

    /// Open an existing layout.
    pub fn open(root: &Path) -> Result<Self> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root.join(required).exists() {
                return Err(BundleError::OciImageError(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root.display()
                )));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of blob `digest` ("sha256:abc" → blobs/sha256/abc).
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.root.join("blobs").join(algorithm).join(hash)
    }

    /// Store `bytes`, returning their digest.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<String> {
        let digest = super::sha256_digest(bytes);
        let path = self.blob_path(&digest);
        if !path.exists() {
            std::fs::write(&path, bytes)?;
        }
        Ok(digest)
    }

    /// Stream a blob in, verifying it hashes to `digest`.
    pub fn write_blob_from(&self, digest: &str, reader: &mut dyn Read) -> Result<u64> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(std::fs::metadata(&path)?.len());
        }

        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join("blobs"))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            written += n as u64;
        }

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest {
            return Err(BundleError::OciImageError(format!(
                "Blob digest mismatch: expected {}, got {}",
                digest, actual
            )));
        }
        tmp.persist(&path).map_err(|e| BundleError::IoError(e.error))?;
        Ok(written)
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        std::fs::read(&path).map_err(|e| {
            BundleError::OciImageError(format!("Failed to read blob {}: {}", digest, e))
        })
    }

    /// List a manifest in `index.json` (once per digest).
    pub fn add_manifest(
        &self,
        digest: &str,
        media_type: &str,
        size: u64,
        ref_name: Option<&str>,
    ) -> Result<()> {
        let mut index = self.read_index()?;
        let manifests = index
            .get_mut("manifests")
            .and_then(|m| m.as_array_mut())
            .ok_or_else(|| BundleError::OciImageError("index.json has no manifests".to_string()))?;

        if manifests
            .iter()
            .any(|m| m.get("digest").and_then(|d| d.as_str()) == Some(digest))
        {
            return Ok(());
        }

        let mut entry = serde_json::json!({
            "mediaType": media_type,
            "digest": digest,
            "size": size,
        });
        if let Some(name) = ref_name {
            entry["annotations"] = serde_json::json!({ REF_NAME_ANNOTATION: name });
        }
        manifests.push(entry);
        self.write_index(&index)
    }

    /// Digest of the first manifest in `index.json`.
    pub fn first_manifest_digest(&self) -> Result<String> {
        let index = self.read_index()?;
        index["manifests"][0]["digest"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BundleError::OciImageError("No manifest digest in index.json".to_string()))
    }

    /// Copy a described image or index into the layout, manifests byte for byte.
    pub fn write_image_or_index(&self, item: &ImageOrIndex) -> Result<()> {
        let (digest, media_type, size) = match item {
            ImageOrIndex::Image(image) => {
                self.write_image(image)?;
                (image.digest(), image.media_type(), image.raw_manifest().len())
            }
            ImageOrIndex::Index(index) => {
                self.write_index_manifest(index)?;
                (index.digest(), index.media_type(), index.raw_manifest().len())
            }
        };
        self.add_manifest(
            digest,
            media_type,
            size as u64,
            item.refs().first().map(String::as_str),
        )?;

        tracing::debug!(digest, path = %self.root.display(), "Wrote image to layout");
        Ok(())
    }

    fn write_image(&self, image: &DescribedImage) -> Result<()> {
        let config = image.raw_config()?;
        self.write_blob_from(&image.descriptor().config.digest, &mut config.as_slice())?;
        for layer in image.layers() {
            let mut reader = layer.open()?;
            self.write_blob_from(layer.digest(), &mut reader)?;
        }
        let raw = image.raw_manifest();
        self.write_blob_from(image.digest(), &mut &raw[..])?;
        Ok(())
    }

    fn write_index_manifest(&self, index: &DescribedIndex) -> Result<()> {
        for image in index.images() {
            self.write_image(&image)?;
        }
        for child in index.indexes() {
            self.write_index_manifest(&child)?;
        }
        let raw = index.raw_manifest();
        self.write_blob_from(index.digest(), &mut &raw[..])?;
        Ok(())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn read_index(&self) -> Result<serde_json::Value> {
        let data = std::fs::read_to_string(self.index_path()).map_err(|e| {
            BundleError::OciImageError(format!("Failed to read index.json: {}", e))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    fn write_index(&self, index: &serde_json::Value) -> Result<()> {
        std::fs::write(self.index_path(), serde_json::to_string_pretty(index)?)?;
        Ok(())
    }
}

impl BlobSource for OciLayout {
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send + '_>> {
        let file = File::open(self.blob_path(digest)).map_err(|e| {
            BundleError::OciImageError(format!("Failed to open blob {}: {}", digest, e))
        })?;
        Ok(Box::new(file))
    }

    fn blob_size(&self, digest: &str) -> Option<u64> {
        std::fs::metadata(self.blob_path(digest))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }
}

fn empty_index() -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX_MEDIA_TYPE,
        "manifests": [],
    })
}
