//! Bundles: directory trees with a `.imgpkg/images.yml` lock, stored as a
//! single-layer image labelled `dev.carvel.imgpkg.bundle`.

mod contents;
mod image_refs;
mod images_lock;
mod locations;

pub use contents::Contents;
pub use image_refs::{ImageRef, ImageRefs};
pub use images_lock::{ImagesLock, LocalizedImagesLock};
pub use locations::{
    locations_tag, ImageLocation, ImageLocationsConfig, LocationsConfigFetcher,
    RegistryLocationsConfig, LOCATIONS_FILE, LOCATIONS_KIND,
};

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use futures::future::{BoxFuture, FutureExt};
use imgbundle_core::config::DEFAULT_PROBE_CONCURRENCY;
use imgbundle_core::error::{BundleError, Result};
use imgbundle_core::{BUNDLE_DIR, IMAGES_LOCK_FILE};

use crate::lockconfig;
use crate::oci::{ImageReference, ImagesMetadata};
use crate::plainimage::FetchedImage;

/// Outcome of [`Bundle::pull`].
#[derive(Debug, Clone)]
pub struct PullResult {
    /// Pulled bundle, `repo@digest`.
    pub digest_ref: String,
    /// Whether the lock file was rewritten to relocated images.
    pub localized: bool,
    pub image_refs: ImageRefs,
}

/// A bundle image in a registry.
pub struct Bundle {
    reference: String,
    metadata: Arc<dyn ImagesMetadata>,
    probe_concurrency: usize,
}

impl Bundle {
    pub fn new(reference: impl Into<String>, metadata: Arc<dyn ImagesMetadata>) -> Self {
        Self {
            reference: reference.into(),
            metadata,
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
        }
    }

    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency;
        self
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub async fn is_bundle(&self) -> Result<bool> {
        self.metadata.probe_is_bundle(&self.reference).await
    }

    /// Unpack the bundle into `output` and localize its lock file.
    pub async fn pull(&self, output: &Path) -> Result<PullResult> {
        let image = self.fetch_bundle_image().await?;
        tracing::info!(bundle = %image.digest_ref, output = %output.display(), "Pulling bundle");

        image.unpack(output)?;

        let lock_path: PathBuf = output.join(BUNDLE_DIR).join(IMAGES_LOCK_FILE);
        let lock = lockconfig::ImagesLock::from_path(&lock_path)?;
        let mut engine = self.lock_engine(&lock, &image.digest_ref)?;

        let result = engine.localize_images_lock().await?;
        if result.skipped {
            tracing::info!("One or more images not found in bundle repo; skipping lock file update");
        } else {
            result.images_lock.write_to_path(&lock_path)?;
            tracing::info!(path = %lock_path.display(), "Updated images lock to relocated images");
        }

        Ok(PullResult {
            digest_ref: image.digest_ref,
            localized: !result.skipped,
            image_refs: result.image_refs,
        })
    }

    /// The bundle's images plus those of every nested bundle, with each
    /// reference classified as bundle or plain image.
    pub fn all_images_lock(&self) -> BoxFuture<'_, Result<ImagesLock>> {
        async move {
            let image = self.fetch_bundle_image().await?;
            let lock = images_lock_of(&image)?;
            let mut engine = self.lock_engine(&lock, &image.digest_ref)?;

            let refs = engine.image_refs().await?;
            for image_ref in refs.all() {
                if image_ref.is_bundle == Some(false) {
                    engine.add_image_ref(&image_ref.image_ref, false);
                    continue;
                }

                let found = self
                    .metadata
                    .first_image_exists(&image_ref.image_ref.locations())
                    .await?;
                let is_bundle = match image_ref.is_bundle {
                    Some(known) => known,
                    None => self.metadata.probe_is_bundle(&found).await?,
                };

                if is_bundle {
                    tracing::debug!(bundle = %found, "Collecting nested bundle images");
                    let nested = Bundle::new(found, Arc::clone(&self.metadata))
                        .with_probe_concurrency(self.probe_concurrency)
                        .all_images_lock()
                        .await?;
                    engine.merge(&nested);
                }
                engine.add_image_ref(&image_ref.image_ref, is_bundle);
            }
            Ok(engine)
        }
        .boxed()
    }

    fn lock_engine(&self, lock: &lockconfig::ImagesLock, digest_ref: &str) -> Result<ImagesLock> {
        let bundle = ImageReference::parse_digest_form(digest_ref)?;
        let locations = RegistryLocationsConfig::new(Arc::clone(&self.metadata), digest_ref)?;
        Ok(ImagesLock::new(
            lock,
            Arc::clone(&self.metadata),
            &bundle.repository_name(),
            Arc::new(locations),
        )?
        .with_probe_concurrency(self.probe_concurrency))
    }

    async fn fetch_bundle_image(&self) -> Result<FetchedImage> {
        let image = FetchedImage::fetch(self.metadata.as_ref(), &self.reference)
            .await?
            .ok_or_else(|| not_a_bundle(&self.reference))?;
        if !image.is_bundle()? {
            return Err(not_a_bundle(&self.reference));
        }
        Ok(image)
    }
}

/// Read `.imgpkg/images.yml` straight out of the layers.
fn images_lock_of(image: &FetchedImage) -> Result<lockconfig::ImagesLock> {
    let wanted = Path::new(BUNDLE_DIR).join(IMAGES_LOCK_FILE);
    for layer in &image.layers {
        let mut archive = tar::Archive::new(GzDecoder::new(layer.as_slice()));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path.strip_prefix(".").unwrap_or(&path) != wanted {
                continue;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return lockconfig::ImagesLock::from_bytes(&data);
        }
    }
    Err(BundleError::Content(format!(
        "Expected bundle {} to contain {}",
        image.digest_ref,
        wanted.display()
    )))
}

fn not_a_bundle(reference: &str) -> BundleError {
    BundleError::Content(format!(
        "Expected bundle image but found plain image '{}' (hint: did you use -i instead of -b?)",
        reference
    ))
}
