//! Image lock engine: tracks where a bundle's images live and rewrites the
//! lock to point at relocated copies on pull.
//!
//! Two sources decide localization:
//! 1. A locations record next to the bundle. When present every image is
//!    assumed to have been copied into the bundle repository.
//! 2. Otherwise every image is looked up. Localization happens only if every
//!    image was found at its in-bundle location; a single miss leaves the
//!    whole lock untouched.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use imgbundle_core::config::DEFAULT_PROBE_CONCURRENCY;
use imgbundle_core::error::{BundleError, Result};

use super::image_refs::{ImageRef, ImageRefs};
use super::locations::LocationsConfigFetcher;
use crate::lockconfig;
use crate::oci::ImagesMetadata;

/// Outcome of [`ImagesLock::localize_images_lock`].
#[derive(Debug, Clone)]
pub struct LocalizedImagesLock {
    pub image_refs: ImageRefs,
    /// Lock to write back; unchanged references when `skipped`.
    pub images_lock: lockconfig::ImagesLock,
    /// Whether localization was abandoned and the original references kept.
    pub skipped: bool,
}

/// A bundle's lock paired with the registry lookups needed to classify and
/// localize its images.
pub struct ImagesLock {
    image_refs: ImageRefs,
    metadata: Arc<dyn ImagesMetadata>,
    locations: Arc<dyn LocationsConfigFetcher>,
    probe_concurrency: usize,
}

impl ImagesLock {
    /// Build the engine, adding each image's in-bundle location
    /// (`relative_to_repo@<digest>`) as its primary candidate.
    pub fn new(
        lock: &lockconfig::ImagesLock,
        metadata: Arc<dyn ImagesMetadata>,
        relative_to_repo: &str,
        locations: Arc<dyn LocationsConfigFetcher>,
    ) -> Result<Self> {
        let mut image_refs = ImageRefs::new();
        for image in &lock.images {
            let mut image_ref = image.deep_copy();
            image_ref.add_location(image_relative_to_bundle(&image.image, relative_to_repo)?);
            image_refs.add([ImageRef::unclassified(image_ref)]);
        }

        Ok(Self {
            image_refs,
            metadata,
            locations,
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
        })
    }

    /// Maximum number of registry lookups in flight during fallback localization.
    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency.max(1);
        self
    }

    /// Snapshot of the references with bundle classification synced from
    /// the locations record, when there is one.
    pub async fn image_refs(&mut self) -> Result<ImageRefs> {
        self.sync_image_refs().await?;
        Ok(self.image_refs.deep_copy())
    }

    async fn sync_image_refs(&mut self) -> Result<()> {
        let config = match self.locations.config().await {
            Ok(config) => config,
            Err(e) if e.is_locations_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for image_ref in self.image_refs.iter_mut() {
            if let Some(location) = config.find(image_ref.image()) {
                image_ref.is_bundle = Some(location.is_bundle);
            }
        }
        Ok(())
    }

    /// Fold `other`'s references into this lock, replacing duplicates.
    pub fn merge(&mut self, other: &ImagesLock) {
        self.image_refs
            .add(other.image_refs.all().iter().map(ImageRef::deep_copy));
    }

    /// Record `image_ref` with a known bundle status.
    pub fn add_image_ref(&mut self, image_ref: &lockconfig::ImageRef, is_bundle: bool) {
        self.image_refs
            .add([ImageRef::new(image_ref.deep_copy(), is_bundle)]);
    }

    /// Decide whether (and how) to rewrite the lock for the pulled bundle.
    pub async fn localize_images_lock(&mut self) -> Result<LocalizedImagesLock> {
        let refs = self.image_refs().await?;

        match self.locations.config().await {
            Ok(_) => {
                tracing::debug!(images = refs.len(), "Locations record found, localizing all images");
                let rewritten = refs
                    .all()
                    .iter()
                    .map(|r| (rewrite(r, r.image_ref.primary_location()), r.is_bundle));
                Ok(localized(rewritten, false))
            }
            Err(e) => {
                tracing::debug!(error = %e, "No usable locations record, probing image locations");
                self.localize_by_probing(&refs).await
            }
        }
    }

    async fn localize_by_probing(&self, refs: &ImageRefs) -> Result<LocalizedImagesLock> {
        let lookups = refs.all().iter().map(|r| {
            let metadata = Arc::clone(&self.metadata);
            let candidates = r.image_ref.locations();
            async move { metadata.first_image_exists(&candidates).await }
        });
        let found: Vec<String> = stream::iter(lookups)
            .buffered(self.probe_concurrency)
            .collect::<Vec<Result<String>>>()
            .await
            .into_iter()
            .collect::<Result<_>>()?;

        let all_in_bundle = refs
            .all()
            .iter()
            .zip(&found)
            .all(|(r, found)| *found == r.image_ref.primary_location());

        if all_in_bundle {
            let rewritten = refs
                .all()
                .iter()
                .zip(found)
                .map(|(r, found)| (rewrite(r, found), r.is_bundle));
            return Ok(localized(rewritten, false));
        }

        tracing::info!("Images not found in bundle repository, skipping localization");
        let original = self.image_refs.all().iter().map(|r| {
            (
                r.image_ref.discard_locations_except(r.image()),
                r.is_bundle,
            )
        });
        Ok(localized(original, true))
    }
}

fn rewrite(r: &ImageRef, image: String) -> lockconfig::ImageRef {
    lockconfig::ImageRef::new(image).with_annotations(r.image_ref.annotations.clone())
}

fn localized(
    refs: impl Iterator<Item = (lockconfig::ImageRef, Option<bool>)>,
    skipped: bool,
) -> LocalizedImagesLock {
    let mut image_refs = ImageRefs::new();
    let mut images = Vec::new();
    for (image_ref, is_bundle) in refs {
        images.push(image_ref.clone());
        image_refs.add([ImageRef {
            image_ref,
            is_bundle,
        }]);
    }
    LocalizedImagesLock {
        image_refs,
        images_lock: lockconfig::ImagesLock::new(images),
        skipped,
    }
}

/// `repo@<digest of image>`: same content, addressed in the bundle repository.
fn image_relative_to_bundle(image: &str, relative_to_repo: &str) -> Result<String> {
    match image.split('@').collect::<Vec<_>>().as_slice() {
        [_, digest] => Ok(format!("{}@{}", relative_to_repo, digest)),
        _ => Err(BundleError::InvalidReference(format!(
            "Expected image '{}' to contain a digest",
            image
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::locations::{ImageLocation, ImageLocationsConfig};
    use crate::oci::FetchedManifest;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const D1: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const D2: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
    const D3: &str = "sha256:3333333333333333333333333333333333333333333333333333333333333333";
    const BUNDLE_REPO: &str = "registry.local/relocated/bundle";

    /// Registry holding exactly the listed references.
    struct FakeRegistry {
        present: HashSet<String>,
    }

    impl FakeRegistry {
        fn with(refs: &[String]) -> Arc<Self> {
            Arc::new(Self {
                present: refs.iter().cloned().collect(),
            })
        }
    }

    #[async_trait]
    impl ImagesMetadata for FakeRegistry {
        async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest> {
            if self.present.contains(reference) {
                Ok(FetchedManifest {
                    bytes: b"{}".to_vec(),
                    digest: D1.to_string(),
                    media_type: crate::oci::metadata::OCI_MANIFEST_MEDIA_TYPE.to_string(),
                })
            } else {
                Err(BundleError::ImageNotFound(reference.to_string()))
            }
        }

        async fn fetch_blob(&self, reference: &str, _digest: &str) -> Result<Vec<u8>> {
            Err(BundleError::ImageNotFound(reference.to_string()))
        }
    }

    enum Locations {
        Missing,
        Broken,
        Present(ImageLocationsConfig),
    }

    #[async_trait]
    impl LocationsConfigFetcher for Locations {
        async fn config(&self) -> Result<ImageLocationsConfig> {
            match self {
                Locations::Missing => Err(BundleError::LocationsNotFound {
                    bundle: BUNDLE_REPO.to_string(),
                }),
                Locations::Broken => Err(BundleError::RegistryError {
                    registry: "registry.local".to_string(),
                    message: "connection reset".to_string(),
                }),
                Locations::Present(config) => Ok(config.clone()),
            }
        }
    }

    fn original(digest: &str) -> String {
        format!("docker.io/library/app{}@{}", &digest[7..8], digest)
    }

    fn relocated(digest: &str) -> String {
        format!("{}@{}", BUNDLE_REPO, digest)
    }

    fn lock_of(digests: &[&str]) -> lockconfig::ImagesLock {
        lockconfig::ImagesLock::new(
            digests
                .iter()
                .map(|d| {
                    let mut annotations = BTreeMap::new();
                    annotations.insert("kbld.carvel.dev/id".to_string(), d[7..8].to_string());
                    lockconfig::ImageRef::new(original(d)).with_annotations(annotations)
                })
                .collect(),
        )
    }

    fn engine(
        digests: &[&str],
        registry: Arc<FakeRegistry>,
        locations: Locations,
    ) -> ImagesLock {
        ImagesLock::new(&lock_of(digests), registry, BUNDLE_REPO, Arc::new(locations)).unwrap()
    }

    fn images(lock: &lockconfig::ImagesLock) -> Vec<String> {
        lock.images.iter().map(|i| i.image.clone()).collect()
    }

    #[test]
    fn test_new_adds_in_bundle_location_first() {
        let lock = engine(&[D1], FakeRegistry::with(&[]), Locations::Missing);
        let r = lock.image_refs.find(&original(D1)).unwrap();
        assert_eq!(r.image_ref.locations(), vec![relocated(D1), original(D1)]);
        assert_eq!(r.is_bundle, None);
    }

    #[test]
    fn test_new_rejects_reference_without_digest() {
        let lock = lockconfig::ImagesLock::new(vec![lockconfig::ImageRef::new("nginx:v1")]);
        let err = ImagesLock::new(
            &lock,
            FakeRegistry::with(&[]),
            BUNDLE_REPO,
            Arc::new(Locations::Missing),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BundleError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn test_image_refs_without_record_leaves_classification_unknown() {
        let mut lock = engine(&[D1, D2], FakeRegistry::with(&[]), Locations::Missing);
        let refs = lock.image_refs().await.unwrap();
        assert!(refs.all().iter().all(|r| r.is_bundle.is_none()));
    }

    #[tokio::test]
    async fn test_image_refs_syncs_classification() {
        let config = ImageLocationsConfig::new(vec![ImageLocation {
            image: original(D2),
            is_bundle: true,
        }]);
        let mut lock = engine(&[D1, D2], FakeRegistry::with(&[]), Locations::Present(config));

        let refs = lock.image_refs().await.unwrap();
        assert_eq!(refs.find(&original(D1)).unwrap().is_bundle, None);
        assert_eq!(refs.find(&original(D2)).unwrap().is_bundle, Some(true));
        // locations untouched
        assert_eq!(
            refs.find(&original(D2)).unwrap().image_ref.primary_location(),
            relocated(D2)
        );
    }

    #[tokio::test]
    async fn test_image_refs_propagates_fetch_failure() {
        let mut lock = engine(&[D1], FakeRegistry::with(&[]), Locations::Broken);
        let err = lock.image_refs().await.unwrap_err();
        assert!(matches!(err, BundleError::RegistryError { .. }));
    }

    #[tokio::test]
    async fn test_locations_record_wins_even_if_originals_unreachable() {
        let config = ImageLocationsConfig::new(vec![
            ImageLocation {
                image: original(D1),
                is_bundle: false,
            },
            ImageLocation {
                image: original(D2),
                is_bundle: true,
            },
        ]);
        // nothing is reachable
        let mut lock = engine(&[D1, D2], FakeRegistry::with(&[]), Locations::Present(config));

        let result = lock.localize_images_lock().await.unwrap();
        assert!(!result.skipped);
        assert_eq!(images(&result.images_lock), vec![relocated(D1), relocated(D2)]);
        assert_eq!(
            result.image_refs.find(&relocated(D2)).unwrap().is_bundle,
            Some(true)
        );
        assert_eq!(
            result.images_lock.images[0].annotations["kbld.carvel.dev/id"],
            "1"
        );
    }

    #[tokio::test]
    async fn test_lookup_localizes_when_all_relocated() {
        let registry = FakeRegistry::with(&[relocated(D1), relocated(D2), original(D1)]);
        let mut lock = engine(&[D1, D2], registry, Locations::Missing);

        let result = lock.localize_images_lock().await.unwrap();
        assert!(!result.skipped);
        assert_eq!(images(&result.images_lock), vec![relocated(D1), relocated(D2)]);
    }

    #[tokio::test]
    async fn test_lookup_is_all_or_nothing() {
        // images 1 and 2 relocated, image 3 only at its source
        let registry = FakeRegistry::with(&[relocated(D1), relocated(D2), original(D3)]);
        let mut lock = engine(&[D1, D2, D3], registry, Locations::Missing);

        let result = lock.localize_images_lock().await.unwrap();
        assert!(result.skipped);
        assert_eq!(
            images(&result.images_lock),
            vec![original(D1), original(D2), original(D3)]
        );
        for r in result.image_refs.all() {
            assert_eq!(r.image_ref.primary_location(), r.image());
        }
    }

    /// Registry whose lookups for earlier images take longer, so answers
    /// arrive in reverse input order. Records peak overlap.
    struct DelayedRegistry {
        present: HashSet<String>,
        delay_ms: HashMap<String, u64>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl DelayedRegistry {
        fn new(digests: &[&str], present: &[String]) -> Arc<Self> {
            let delay_ms = digests
                .iter()
                .enumerate()
                .map(|(i, d)| (d.to_string(), 30 * (digests.len() - i) as u64))
                .collect();
            Arc::new(Self {
                present: present.iter().cloned().collect(),
                delay_ms,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImagesMetadata for DelayedRegistry {
        async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let digest = reference.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
            let delay = self.delay_ms.get(digest).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.present.contains(reference) {
                Ok(FetchedManifest {
                    bytes: b"{}".to_vec(),
                    digest: digest.to_string(),
                    media_type: crate::oci::metadata::OCI_MANIFEST_MEDIA_TYPE.to_string(),
                })
            } else {
                Err(BundleError::ImageNotFound(reference.to_string()))
            }
        }

        async fn fetch_blob(&self, reference: &str, _digest: &str) -> Result<Vec<u8>> {
            Err(BundleError::ImageNotFound(reference.to_string()))
        }
    }

    async fn localize_concurrently(
        registry: Arc<DelayedRegistry>,
        digests: &[&str],
    ) -> LocalizedImagesLock {
        let mut lock = ImagesLock::new(
            &lock_of(digests),
            Arc::clone(&registry) as Arc<dyn ImagesMetadata>,
            BUNDLE_REPO,
            Arc::new(Locations::Missing),
        )
        .unwrap()
        .with_probe_concurrency(3);
        let result = lock.localize_images_lock().await.unwrap();
        assert!(registry.max_in_flight.load(Ordering::SeqCst) > 1);
        result
    }

    #[tokio::test]
    async fn test_concurrent_lookups_miss_in_last_image_skips_all() {
        let digests = [D1, D2, D3];
        // the miss answers first
        let registry = DelayedRegistry::new(&digests, &[relocated(D1), relocated(D2), original(D3)]);

        let result = localize_concurrently(registry, &digests).await;
        assert!(result.skipped);
        assert_eq!(
            images(&result.images_lock),
            vec![original(D1), original(D2), original(D3)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_lookups_miss_in_first_image_skips_all() {
        let digests = [D1, D2, D3];
        // both hits answer before the miss
        let registry = DelayedRegistry::new(&digests, &[original(D1), relocated(D2), relocated(D3)]);

        let result = localize_concurrently(registry, &digests).await;
        assert!(result.skipped);
        assert_eq!(
            images(&result.images_lock),
            vec![original(D1), original(D2), original(D3)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_lookups_keep_input_order() {
        let digests = [D1, D2, D3];
        let registry = DelayedRegistry::new(&digests, &[relocated(D1), relocated(D2), relocated(D3)]);

        let result = localize_concurrently(registry, &digests).await;
        assert!(!result.skipped);
        assert_eq!(
            images(&result.images_lock),
            vec![relocated(D1), relocated(D2), relocated(D3)]
        );
        let order: Vec<&str> = result.image_refs.all().iter().map(ImageRef::image).collect();
        assert_eq!(order, vec![relocated(D1), relocated(D2), relocated(D3)]);
    }

    #[tokio::test]
    async fn test_lookup_fails_when_image_missing_everywhere() {
        let registry = FakeRegistry::with(&[relocated(D1)]);
        let mut lock = engine(&[D1, D2], registry, Locations::Missing);

        let err = lock.localize_images_lock().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_broken_record_fetch_propagates() {
        let mut lock = engine(&[D1], FakeRegistry::with(&[relocated(D1)]), Locations::Broken);
        assert!(lock.localize_images_lock().await.is_err());
    }

    #[test]
    fn test_merge_replaces_duplicates() {
        let mut parent = engine(&[D1, D2], FakeRegistry::with(&[]), Locations::Missing);
        let mut nested = engine(&[D2, D3], FakeRegistry::with(&[]), Locations::Missing);
        nested.add_image_ref(&lockconfig::ImageRef::new(original(D2)), true);

        parent.merge(&nested);
        let order: Vec<&str> = parent.image_refs.all().iter().map(ImageRef::image).collect();
        assert_eq!(order, vec![original(D1), original(D2), original(D3)]);
        assert_eq!(
            parent.image_refs.find(&original(D2)).unwrap().is_bundle,
            Some(true)
        );
    }
}
