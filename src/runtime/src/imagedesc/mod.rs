//! Positional descriptions of images and image indexes.
//!
//! A descriptor record captures everything needed to rebuild an image or
//! index (manifest bytes, media types, config and layer digests) without
//! carrying any blob payloads. The tar transport stores it as its first
//! chunk; blobs follow, one chunk per digest.
//!
//! ```text
//! [                                   ImageRefDescriptors (JSON array)
//!   { "image": {                      ImageDescriptor
//!       "refs": [...],
//!       "manifest": { mediaType, digest, raw },
//!       "config":   { mediaType, digest, size },
//!       "layers":   [ { mediaType, digest, size }, ... ] } },
//!   { "imageIndex": {                 ImageIndexDescriptor
//!       "refs": [...], mediaType, digest, raw,
//!       "images": [ ImageDescriptor... ],
//!       "indexes": [ ImageIndexDescriptor... ] } }
//! ]
//! ```

mod described;

pub use described::{
    BlobSource, DescribedImage, DescribedImages, DescribedIndex, DescribedLayer, DescribedReader,
    ImageOrIndex, MemoryBlobs,
};

use std::collections::HashSet;

use imgbundle_core::error::{BundleError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};

use crate::oci::{reference::validate_digest, sha256_digest};

/// Manifest of one image: bytes kept verbatim so the digest survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub digest: String,
    pub raw: String,
}

/// Image config blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Image layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayerDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// A single image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageDescriptor {
    #[serde(default)]
    pub refs: Vec<String>,
    pub manifest: ManifestDescriptor,
    pub config: ConfigDescriptor,
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
}

impl ImageDescriptor {
    /// Describe an image from its raw manifest.
    pub fn from_manifest(refs: Vec<String>, raw: &[u8], media_type: &str) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(raw).map_err(|e| {
            BundleError::OciImageError(format!("Failed to parse image manifest: {}", e))
        })?;
        let raw_str = std::str::from_utf8(raw).map_err(|e| {
            BundleError::OciImageError(format!("Image manifest is not UTF-8: {}", e))
        })?;

        let config = manifest.config();
        Ok(Self {
            refs,
            manifest: ManifestDescriptor {
                media_type: media_type.to_string(),
                digest: sha256_digest(raw),
                raw: raw_str.to_string(),
            },
            config: ConfigDescriptor {
                media_type: config.media_type().to_string(),
                digest: config.digest().to_string(),
                size: non_negative(config.size()),
            },
            layers: manifest
                .layers()
                .iter()
                .map(|l| LayerDescriptor {
                    media_type: l.media_type().to_string(),
                    digest: l.digest().to_string(),
                    size: non_negative(l.size()),
                })
                .collect(),
        })
    }

    fn validate(&self) -> Result<()> {
        validate_manifest(&self.manifest.digest, &self.manifest.raw)?;
        check_digest(&self.config.digest)?;
        for layer in &self.layers {
            check_digest(&layer.digest)?;
        }
        Ok(())
    }
}

/// An image index with its resolved children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageIndexDescriptor {
    #[serde(default)]
    pub refs: Vec<String>,
    pub media_type: String,
    pub digest: String,
    pub raw: String,
    #[serde(default)]
    pub images: Vec<ImageDescriptor>,
    #[serde(default)]
    pub indexes: Vec<ImageIndexDescriptor>,
}

impl ImageIndexDescriptor {
    /// Describe an index from its raw manifest and already described children.
    pub fn from_manifest(
        refs: Vec<String>,
        raw: &[u8],
        media_type: &str,
        images: Vec<ImageDescriptor>,
        indexes: Vec<ImageIndexDescriptor>,
    ) -> Result<Self> {
        let raw_str = std::str::from_utf8(raw).map_err(|e| {
            BundleError::OciImageError(format!("Image index is not UTF-8: {}", e))
        })?;
        Ok(Self {
            refs,
            media_type: media_type.to_string(),
            digest: sha256_digest(raw),
            raw: raw_str.to_string(),
            images,
            indexes,
        })
    }

    /// Child manifest digests listed by the raw index, in order.
    pub fn child_digests(raw: &[u8]) -> Result<Vec<String>> {
        let index: ImageIndex = serde_json::from_slice(raw).map_err(|e| {
            BundleError::OciImageError(format!("Failed to parse image index: {}", e))
        })?;
        Ok(index
            .manifests()
            .iter()
            .map(|m| m.digest().to_string())
            .collect())
    }

    fn validate(&self) -> Result<()> {
        validate_manifest(&self.digest, &self.raw)?;

        let described: HashSet<&str> = self
            .images
            .iter()
            .map(|i| i.manifest.digest.as_str())
            .chain(self.indexes.iter().map(|i| i.digest.as_str()))
            .collect();
        for child in Self::child_digests(self.raw.as_bytes())
            .map_err(|e| BundleError::Format(e.to_string()))?
        {
            if !described.contains(child.as_str()) {
                return Err(BundleError::Format(format!(
                    "Index {} lists {} but does not describe it",
                    self.digest, child
                )));
            }
        }

        self.images.iter().try_for_each(ImageDescriptor::validate)?;
        self.indexes.iter().try_for_each(ImageIndexDescriptor::validate)
    }
}

/// Exactly one of `image` / `image_index` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageOrIndexDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_index: Option<ImageIndexDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageDescriptor>,
}

impl From<ImageDescriptor> for ImageOrIndexDescriptor {
    fn from(image: ImageDescriptor) -> Self {
        Self {
            image_index: None,
            image: Some(image),
        }
    }
}

impl From<ImageIndexDescriptor> for ImageOrIndexDescriptor {
    fn from(index: ImageIndexDescriptor) -> Self {
        Self {
            image_index: Some(index),
            image: None,
        }
    }
}

/// Ordered descriptor record for a set of images and indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRefDescriptors {
    descriptors: Vec<ImageOrIndexDescriptor>,
}

impl ImageRefDescriptors {
    pub fn new(descriptors: Vec<ImageOrIndexDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Parse and validate a serialized record.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let parsed: Self = serde_json::from_slice(data).map_err(|e| {
            BundleError::Format(format!("Unmarshaling image descriptors: {}", e))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn push(&mut self, descriptor: impl Into<ImageOrIndexDescriptor>) {
        self.descriptors.push(descriptor.into());
    }

    pub fn descriptors(&self) -> &[ImageOrIndexDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Every config and layer digest, first-seen order, each once.
    pub fn blob_digests(&self) -> Vec<(String, u64)> {
        let mut seen = HashSet::new();
        self.blob_refs()
            .into_iter()
            .filter(|(digest, _)| seen.insert(digest.clone()))
            .collect()
    }

    /// Every config and layer reference with its described size, repeats included.
    pub(crate) fn blob_refs(&self) -> Vec<(String, u64)> {
        fn walk_image(image: &ImageDescriptor, out: &mut Vec<(String, u64)>) {
            out.push((image.config.digest.clone(), image.config.size));
            for layer in &image.layers {
                out.push((layer.digest.clone(), layer.size));
            }
        }
        fn walk_index(index: &ImageIndexDescriptor, out: &mut Vec<(String, u64)>) {
            for image in &index.images {
                walk_image(image, out);
            }
            for child in &index.indexes {
                walk_index(child, out);
            }
        }

        let mut out = Vec::new();
        for desc in &self.descriptors {
            if let Some(image) = &desc.image {
                walk_image(image, &mut out);
            }
            if let Some(index) = &desc.image_index {
                walk_index(index, &mut out);
            }
        }
        out
    }

    fn validate(&self) -> Result<()> {
        for (i, desc) in self.descriptors.iter().enumerate() {
            match (&desc.image, &desc.image_index) {
                (Some(image), None) => image.validate()?,
                (None, Some(index)) => index.validate()?,
                _ => {
                    return Err(BundleError::Format(format!(
                        "Descriptor {} must describe exactly one of image or imageIndex",
                        i
                    )))
                }
            }
        }
        Ok(())
    }
}

fn check_digest(digest: &str) -> Result<()> {
    validate_digest(digest)
        .map_err(|msg| BundleError::Format(format!("Invalid digest '{}': {}", digest, msg)))
}

fn validate_manifest(digest: &str, raw: &str) -> Result<()> {
    check_digest(digest)?;
    let actual = sha256_digest(raw.as_bytes());
    if actual != digest {
        return Err(BundleError::Format(format!(
            "Manifest digest mismatch: described {}, content is {}",
            digest, actual
        )));
    }
    Ok(())
}

fn non_negative(size: i64) -> u64 {
    u64::try_from(size).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Manifest JSON for a config blob and layer blobs.
    pub(crate) fn manifest_json(config: &[u8], layers: &[&[u8]]) -> Vec<u8> {
        let layers: Vec<serde_json::Value> = layers
            .iter()
            .map(|l| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": sha256_digest(l),
                    "size": l.len(),
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256_digest(config),
                "size": config.len(),
            },
            "layers": layers,
        }))
        .unwrap()
    }

    pub(crate) fn index_json(children: &[&[u8]]) -> Vec<u8> {
        let manifests: Vec<serde_json::Value> = children
            .iter()
            .map(|m| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": sha256_digest(m),
                    "size": m.len(),
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": manifests,
        }))
        .unwrap()
    }

    fn image(config: &[u8], layers: &[&[u8]]) -> ImageDescriptor {
        let raw = manifest_json(config, layers);
        ImageDescriptor::from_manifest(
            vec!["ghcr.io/org/app".to_string()],
            &raw,
            "application/vnd.oci.image.manifest.v1+json",
        )
        .unwrap()
    }

    #[test]
    fn test_image_from_manifest() {
        let desc = image(b"{}", &[b"layer-a", b"layer-b"]);
        assert_eq!(desc.config.digest, sha256_digest(b"{}"));
        assert_eq!(desc.config.size, 2);
        assert_eq!(desc.layers.len(), 2);
        assert_eq!(desc.layers[1].digest, sha256_digest(b"layer-b"));
        assert_eq!(desc.manifest.raw.as_bytes(), manifest_json(b"{}", &[b"layer-a", b"layer-b"]));
    }

    #[test]
    fn test_from_bytes_roundtrip_keeps_order() {
        let mut descs = ImageRefDescriptors::default();
        descs.push(image(b"{\"a\":1}", &[b"one"]));
        descs.push(image(b"{\"b\":2}", &[b"two"]));

        let parsed = ImageRefDescriptors::from_bytes(&descs.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, descs);
    }

    #[test]
    fn test_blob_digests_unique() {
        let mut descs = ImageRefDescriptors::default();
        descs.push(image(b"{}", &[b"shared", b"only-a"]));
        descs.push(image(b"{}", &[b"shared", b"only-b"]));

        let digests: Vec<String> = descs.blob_digests().into_iter().map(|(d, _)| d).collect();
        assert_eq!(
            digests,
            vec![
                sha256_digest(b"{}"),
                sha256_digest(b"shared"),
                sha256_digest(b"only-a"),
                sha256_digest(b"only-b"),
            ]
        );
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let err = ImageRefDescriptors::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, BundleError::Format(_)));
    }

    #[test]
    fn test_from_bytes_rejects_empty_entry() {
        let err = ImageRefDescriptors::from_bytes(b"[{}]").unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_from_bytes_rejects_tampered_manifest() {
        let mut desc = image(b"{}", &[b"layer"]);
        desc.manifest.raw.push(' ');
        let bytes = ImageRefDescriptors::new(vec![desc.into()]).to_bytes().unwrap();

        let err = ImageRefDescriptors::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn test_from_bytes_rejects_traversing_layer_digest() {
        let mut desc = image(b"{}", &[b"layer"]);
        desc.layers[0].digest = "../../escape:abcdef".to_string();
        let bytes = ImageRefDescriptors::new(vec![desc.into()]).to_bytes().unwrap();

        let err = ImageRefDescriptors::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, BundleError::Format(_)));
        assert!(err.to_string().contains("not a valid digest algorithm"));
    }

    #[test]
    fn test_index_must_describe_children() {
        let child = manifest_json(b"{}", &[b"layer"]);
        let raw = index_json(&[&child]);
        let index = ImageIndexDescriptor::from_manifest(
            vec![],
            &raw,
            "application/vnd.oci.image.index.v1+json",
            vec![],
            vec![],
        )
        .unwrap();
        let bytes = ImageRefDescriptors::new(vec![index.into()]).to_bytes().unwrap();

        let err = ImageRefDescriptors::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("does not describe"));
    }

    #[test]
    fn test_index_blob_digests_include_children() {
        let child = manifest_json(b"{}", &[b"layer"]);
        let raw = index_json(&[&child]);
        let index = ImageIndexDescriptor::from_manifest(
            vec![],
            &raw,
            "application/vnd.oci.image.index.v1+json",
            vec![image(b"{}", &[b"layer"])],
            vec![],
        )
        .unwrap();
        let descs = ImageRefDescriptors::new(vec![index.into()]);

        let bytes = descs.to_bytes().unwrap();
        assert!(ImageRefDescriptors::from_bytes(&bytes).is_ok());
        assert_eq!(descs.blob_digests().len(), 2);
    }
}
