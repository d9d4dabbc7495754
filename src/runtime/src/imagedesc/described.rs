//! Lazily readable images and indexes backed by a descriptor record.
//!
//! Handles carry only descriptors; blob bytes are pulled from the
//! [`BlobSource`] when a layer or config is opened.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use imgbundle_core::error::{BundleError, Result};

use super::{
    ImageDescriptor, ImageIndexDescriptor, ImageOrIndexDescriptor, ImageRefDescriptors,
    LayerDescriptor,
};

/// Content-addressed blob storage.
pub trait BlobSource: Send + Sync {
    /// Stream the bytes of blob `digest`.
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send + '_>>;

    /// Stored size of blob `digest`, `None` when absent.
    fn blob_size(&self, digest: &str) -> Option<u64>;

    /// Whether blob `digest` is available.
    fn has_blob(&self, digest: &str) -> bool {
        self.blob_size(digest).is_some()
    }
}

/// Blobs held in memory, keyed by digest.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobs {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes`, returning their digest.
    pub fn insert(&mut self, bytes: impl Into<Vec<u8>>) -> String {
        let bytes = bytes.into();
        let digest = crate::oci::sha256_digest(&bytes);
        self.blobs.insert(digest.clone(), bytes);
        digest
    }
}

impl BlobSource for MemoryBlobs {
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send + '_>> {
        self.blobs
            .get(digest)
            .map(|b| Box::new(b.as_slice()) as Box<dyn Read + Send + '_>)
            .ok_or_else(|| BundleError::OciImageError(format!("Blob {} not found", digest)))
    }

    fn blob_size(&self, digest: &str) -> Option<u64> {
        self.blobs.get(digest).map(|b| b.len() as u64)
    }
}

/// One layer of a described image.
#[derive(Clone)]
pub struct DescribedLayer {
    desc: LayerDescriptor,
    source: Arc<dyn BlobSource>,
}

impl DescribedLayer {
    pub fn digest(&self) -> &str {
        &self.desc.digest
    }

    pub fn media_type(&self) -> &str {
        &self.desc.media_type
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Stream this layer's (compressed) bytes.
    pub fn open(&self) -> Result<Box<dyn Read + Send + '_>> {
        self.source.open_blob(&self.desc.digest)
    }
}

/// An image whose blobs are read on demand.
#[derive(Clone)]
pub struct DescribedImage {
    desc: ImageDescriptor,
    source: Arc<dyn BlobSource>,
}

impl DescribedImage {
    pub fn new(desc: ImageDescriptor, source: Arc<dyn BlobSource>) -> Self {
        Self { desc, source }
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.desc
    }

    pub fn refs(&self) -> &[String] {
        &self.desc.refs
    }

    pub fn digest(&self) -> &str {
        &self.desc.manifest.digest
    }

    pub fn media_type(&self) -> &str {
        &self.desc.manifest.media_type
    }

    /// Manifest bytes, identical to the packed original.
    pub fn raw_manifest(&self) -> &[u8] {
        self.desc.manifest.raw.as_bytes()
    }

    /// Read the config blob fully (configs are small).
    pub fn raw_config(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.source
            .open_blob(&self.desc.config.digest)?
            .read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn layers(&self) -> Vec<DescribedLayer> {
        self.desc
            .layers
            .iter()
            .map(|l| DescribedLayer {
                desc: l.clone(),
                source: Arc::clone(&self.source),
            })
            .collect()
    }
}

/// An image index whose children are described images and indexes.
#[derive(Clone)]
pub struct DescribedIndex {
    desc: ImageIndexDescriptor,
    source: Arc<dyn BlobSource>,
}

impl DescribedIndex {
    pub fn new(desc: ImageIndexDescriptor, source: Arc<dyn BlobSource>) -> Self {
        Self { desc, source }
    }

    pub fn refs(&self) -> &[String] {
        &self.desc.refs
    }

    pub fn digest(&self) -> &str {
        &self.desc.digest
    }

    pub fn media_type(&self) -> &str {
        &self.desc.media_type
    }

    pub fn raw_manifest(&self) -> &[u8] {
        self.desc.raw.as_bytes()
    }

    pub fn images(&self) -> Vec<DescribedImage> {
        self.desc
            .images
            .iter()
            .map(|i| DescribedImage::new(i.clone(), Arc::clone(&self.source)))
            .collect()
    }

    pub fn indexes(&self) -> Vec<DescribedIndex> {
        self.desc
            .indexes
            .iter()
            .map(|i| DescribedIndex::new(i.clone(), Arc::clone(&self.source)))
            .collect()
    }
}

/// Either a single image or an index.
#[derive(Clone)]
pub enum ImageOrIndex {
    Image(DescribedImage),
    Index(DescribedIndex),
}

impl ImageOrIndex {
    pub fn digest(&self) -> &str {
        match self {
            ImageOrIndex::Image(i) => i.digest(),
            ImageOrIndex::Index(i) => i.digest(),
        }
    }

    pub fn refs(&self) -> &[String] {
        match self {
            ImageOrIndex::Image(i) => i.refs(),
            ImageOrIndex::Index(i) => i.refs(),
        }
    }
}

impl std::fmt::Debug for ImageOrIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageOrIndex::Image(i) => f.debug_tuple("Image").field(&i.digest()).finish(),
            ImageOrIndex::Index(i) => f.debug_tuple("Index").field(&i.digest()).finish(),
        }
    }
}

/// Turns a descriptor record plus a blob source into image handles.
pub struct DescribedReader {
    descs: ImageRefDescriptors,
    source: Arc<dyn BlobSource>,
}

impl DescribedReader {
    pub fn new(descs: ImageRefDescriptors, source: Arc<dyn BlobSource>) -> Self {
        Self { descs, source }
    }

    /// Fail if any described blob is missing from the source or stored
    /// with a size other than the one described.
    pub fn verify_complete(&self) -> Result<()> {
        for (digest, described) in self.descs.blob_refs() {
            match self.source.blob_size(&digest) {
                None => {
                    return Err(BundleError::Format(format!(
                        "Expected to find blob {} but it is missing",
                        digest
                    )))
                }
                Some(stored) if stored != described => {
                    return Err(BundleError::Format(format!(
                        "Blob {} is described as {} bytes but {} bytes are stored",
                        digest, described, stored
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Handles in record order, built one at a time.
    pub fn read(self) -> DescribedImages {
        DescribedImages {
            descs: self.descs.descriptors.into_iter(),
            source: self.source,
        }
    }
}

/// Iterator over described images and indexes.
pub struct DescribedImages {
    descs: std::vec::IntoIter<ImageOrIndexDescriptor>,
    source: Arc<dyn BlobSource>,
}

impl Iterator for DescribedImages {
    type Item = ImageOrIndex;

    fn next(&mut self) -> Option<ImageOrIndex> {
        let desc = self.descs.next()?;
        let source = Arc::clone(&self.source);
        // validated records hold exactly one of the two
        match (desc.image, desc.image_index) {
            (Some(image), _) => Some(ImageOrIndex::Image(DescribedImage::new(image, source))),
            (None, Some(index)) => Some(ImageOrIndex::Index(DescribedIndex::new(index, source))),
            (None, None) => self.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.descs.len()))
    }
}
