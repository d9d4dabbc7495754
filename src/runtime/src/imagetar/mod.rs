//! Single-file tar transport for images and indexes.
//!
//! Archive layout:
//! - `manifest.json`: the [`ImageRefDescriptors`] record
//! - one chunk per unique config/layer blob, named by digest with `:`
//!   replaced by `-` (`sha256-<hex>`)

mod tar_reader;
mod tar_writer;

pub use tar_reader::{TarFile, TarReader};
pub use tar_writer::TarWriter;

use futures::future::{BoxFuture, FutureExt};
use imgbundle_core::error::Result;

use crate::imagedesc::{
    BlobSource, ImageDescriptor, ImageIndexDescriptor, ImageOrIndexDescriptor, ImageRefDescriptors,
};
use crate::oci::{ImageReference, ImagesMetadata, OciLayout};

/// Name of the descriptor record chunk.
pub const MANIFEST_CHUNK: &str = "manifest.json";

/// Chunk name of blob `digest`.
pub fn chunk_name(digest: &str) -> String {
    digest.replace(':', "-")
}

/// Fetch `refs` (images or indexes) from the registry, staging every blob
/// in `layout`, and describe them in order.
pub async fn collect_descriptors(
    metadata: &dyn ImagesMetadata,
    refs: &[String],
    layout: &OciLayout,
) -> Result<ImageRefDescriptors> {
    let mut descs = ImageRefDescriptors::default();
    for reference in refs {
        tracing::info!(image = %reference, "Collecting image");
        descs.push(describe(metadata, reference.clone(), vec![reference.clone()], layout).await?);
    }
    Ok(descs)
}

fn describe<'a>(
    metadata: &'a dyn ImagesMetadata,
    reference: String,
    refs: Vec<String>,
    layout: &'a OciLayout,
) -> BoxFuture<'a, Result<ImageOrIndexDescriptor>> {
    async move {
        let manifest = metadata.fetch_manifest(&reference).await?;

        if !manifest.is_index() {
            let image =
                ImageDescriptor::from_manifest(refs, &manifest.bytes, &manifest.media_type)?;
            stage_image_blobs(metadata, &reference, &image, layout).await?;
            return Ok(image.into());
        }

        let repository = ImageReference::parse(&reference)?;
        let mut images = Vec::new();
        let mut indexes = Vec::new();
        for child in ImageIndexDescriptor::child_digests(&manifest.bytes)? {
            let child_ref = repository.with_digest(child).full_reference();
            let described = describe(metadata, child_ref, vec![], layout).await?;
            images.extend(described.image);
            indexes.extend(described.image_index);
        }

        let index = ImageIndexDescriptor::from_manifest(
            refs,
            &manifest.bytes,
            &manifest.media_type,
            images,
            indexes,
        )?;
        Ok(index.into())
    }
    .boxed()
}

async fn stage_image_blobs(
    metadata: &dyn ImagesMetadata,
    reference: &str,
    image: &ImageDescriptor,
    layout: &OciLayout,
) -> Result<()> {
    let digests = std::iter::once(&image.config.digest).chain(image.layers.iter().map(|l| &l.digest));
    for digest in digests {
        if layout.has_blob(digest) {
            continue;
        }
        let bytes = metadata.fetch_blob(reference, digest).await?;
        layout.write_blob_from(digest, &mut bytes.as_slice())?;
        tracing::debug!(digest = %digest, size = bytes.len(), "Staged blob");
    }
    Ok(())
}
