//! Bundle contents on disk: structure validation and push.
//!
//! A set of input paths is a bundle when exactly one `.imgpkg` directory
//! exists among them and it sits directly under one of the inputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use imgbundle_core::error::{BundleError, Result};
use imgbundle_core::{BUNDLE_CONFIG_LABEL, BUNDLE_DIR, IMAGES_LOCK_FILE};

use crate::lockconfig;
use crate::oci::{ImageReference, ImagesMetadata, OciLayout, RegistryPusher};
use crate::plainimage::{is_excluded, PlainContents};

/// Input paths meant to be published as a bundle.
pub struct Contents {
    paths: Vec<PathBuf>,
    excluded_paths: Vec<PathBuf>,
}

impl Contents {
    pub fn new(paths: Vec<PathBuf>, excluded_paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            excluded_paths,
        }
    }

    /// Validate, package and push to `upload_ref`. Returns `repo@digest`.
    pub async fn push(
        &self,
        upload_ref: &ImageReference,
        metadata: &dyn ImagesMetadata,
        pusher: &RegistryPusher,
    ) -> Result<String> {
        self.validate(metadata).await?;

        let digest_ref = self
            .plain()
            .push(upload_ref, &bundle_labels(), metadata, pusher)
            .await?;
        tracing::info!(bundle = %digest_ref, "Pushed bundle");
        Ok(digest_ref)
    }

    /// Structure checks only; no registry access.
    pub fn presents_as_bundle(&self) -> Result<bool> {
        let dirs = self.find_bundle_dirs()?;
        self.validate_bundle_dirs(&dirs)?;
        Ok(true)
    }

    /// Whether any `.imgpkg` directory exists among the inputs, valid or not.
    pub fn contains_bundle_dir(&self) -> Result<bool> {
        Ok(!self.find_bundle_dirs()?.is_empty())
    }

    /// Full pre-push validation. Returns the `.imgpkg` directory.
    pub async fn validate(&self, metadata: &dyn ImagesMetadata) -> Result<PathBuf> {
        let dirs = self.find_bundle_dirs()?;
        self.validate_bundle_dirs(&dirs)?;
        let bundle_dir = dirs[0].clone();

        let lock = lockconfig::ImagesLock::from_path(&bundle_dir.join(IMAGES_LOCK_FILE))?;

        let mut bundles = Vec::new();
        for image in &lock.images {
            if metadata.probe_is_bundle(&image.image).await? {
                bundles.push(image.image.as_str());
            }
        }

        if !bundles.is_empty() {
            return Err(BundleError::Content(format!(
                "Expected image lock to not contain bundle reference: '{}'",
                bundles.join("', '")
            )));
        }
        Ok(bundle_dir)
    }

    /// Write the bundle image (one gzip tar layer, labelled config) into `layout`.
    pub fn stage(&self, layout: &OciLayout) -> Result<String> {
        self.plain().stage(layout, &bundle_labels())
    }

    fn plain(&self) -> PlainContents {
        PlainContents::new(self.paths.clone(), self.excluded_paths.clone())
    }

    fn find_bundle_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for path in &self.paths {
            if is_bundle_dir(path) {
                found.push(std::path::absolute(path)?);
            }
            if path.is_dir() {
                self.walk_for_bundle_dirs(path, path, &mut found)?;
            }
        }
        Ok(found)
    }

    /// Symlinked `.imgpkg` entries are counted but never descended into.
    fn walk_for_bundle_dirs(&self, root: &Path, dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        for entry in entries {
            if is_excluded(&self.excluded_paths, root, &entry) {
                continue;
            }
            if is_bundle_dir(&entry) {
                found.push(std::path::absolute(&entry)?);
            }
            if entry.is_dir() && !entry.is_symlink() {
                self.walk_for_bundle_dirs(root, &entry, found)?;
            }
        }
        Ok(())
    }

    fn validate_bundle_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        if dirs.len() != 1 {
            return Err(BundleError::Structure(format!(
                "Expected one '{}' dir, got {}: {}",
                BUNDLE_DIR,
                dirs.len(),
                join_paths(dirs)
            )));
        }

        let dir = &dirs[0];
        for input in &self.paths {
            if dir.parent() == Some(std::path::absolute(input)?.as_path()) {
                return Ok(());
            }
        }

        Err(BundleError::Structure(format!(
            "Expected '{}' directory, to be a direct child of one of: {}; was {}",
            BUNDLE_DIR,
            join_paths(&self.paths),
            dir.display()
        )))
    }
}

fn is_bundle_dir(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(BUNDLE_DIR) && path.is_dir()
}

fn bundle_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(BUNDLE_CONFIG_LABEL.to_string(), "true".to_string())])
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn write_lock(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(IMAGES_LOCK_FILE),
            "apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages: []\n",
        )
        .unwrap();
    }

    fn contents(paths: &[&Path]) -> Contents {
        Contents::new(paths.iter().map(|p| p.to_path_buf()).collect(), vec![])
    }

    #[test]
    fn test_direct_child_is_bundle() {
        let root = TempDir::new().unwrap();
        write_lock(&root.path().join(BUNDLE_DIR));

        assert!(contents(&[root.path()]).presents_as_bundle().unwrap());
    }

    #[test]
    fn test_no_bundle_dir() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("config.yml"), "a: 1").unwrap();

        let err = contents(&[root.path()]).presents_as_bundle().unwrap_err();
        assert!(matches!(err, BundleError::Structure(_)));
        assert!(err.to_string().contains("Expected one '.imgpkg' dir, got 0"));
    }

    #[test]
    fn test_two_bundle_dirs_across_inputs() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write_lock(&a.path().join(BUNDLE_DIR));
        write_lock(&b.path().join(BUNDLE_DIR));

        let err = contents(&[a.path(), b.path()]).presents_as_bundle().unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, BundleError::Structure(_)));
        assert!(msg.contains("got 2"));
        assert!(msg.contains(&a.path().join(BUNDLE_DIR).display().to_string()));
        assert!(msg.contains(&b.path().join(BUNDLE_DIR).display().to_string()));
    }

    #[test]
    fn test_nested_bundle_dir_rejected() {
        let root = TempDir::new().unwrap();
        write_lock(&root.path().join("sub").join("deeper").join(BUNDLE_DIR));

        let err = contents(&[root.path()]).presents_as_bundle().unwrap_err();
        assert!(matches!(err, BundleError::Structure(_)));
        assert!(err.to_string().contains("direct child"));
    }

    #[test]
    fn test_contains_bundle_dir() {
        let plain = TempDir::new().unwrap();
        std::fs::write(plain.path().join("config.yml"), "a: 1").unwrap();
        assert!(!contents(&[plain.path()]).contains_bundle_dir().unwrap());

        let nested = TempDir::new().unwrap();
        write_lock(&nested.path().join("sub").join(BUNDLE_DIR));
        assert!(contents(&[nested.path()]).contains_bundle_dir().unwrap());
    }

    #[test]
    fn test_excluded_dir_not_counted() {
        let root = TempDir::new().unwrap();
        write_lock(&root.path().join(BUNDLE_DIR));
        write_lock(&root.path().join("vendor").join(BUNDLE_DIR));

        let c = Contents::new(vec![root.path().to_path_buf()], vec![PathBuf::from("vendor")]);
        assert!(c.presents_as_bundle().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_bundle_dir_is_counted() {
        let root = TempDir::new().unwrap();
        let real = TempDir::new().unwrap();
        write_lock(real.path());
        std::os::unix::fs::symlink(real.path(), root.path().join(BUNDLE_DIR)).unwrap();

        assert!(contents(&[root.path()]).presents_as_bundle().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_dirs_not_descended() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        write_lock(&root.path().join(BUNDLE_DIR));
        write_lock(&elsewhere.path().join(BUNDLE_DIR));
        std::os::unix::fs::symlink(elsewhere.path(), root.path().join("linked")).unwrap();

        assert!(contents(&[root.path()]).presents_as_bundle().unwrap());
    }

    #[test]
    fn test_stage_writes_labelled_image() {
        let root = TempDir::new().unwrap();
        write_lock(&root.path().join(BUNDLE_DIR));
        std::fs::write(root.path().join("config.yml"), "a: 1").unwrap();
        std::fs::write(root.path().join("skip.txt"), "no").unwrap();

        let out = TempDir::new().unwrap();
        let layout = OciLayout::create(out.path()).unwrap();
        let c = Contents::new(vec![root.path().to_path_buf()], vec![PathBuf::from("skip.txt")]);
        let digest = c.stage(&layout).unwrap();
        assert_eq!(layout.first_manifest_digest().unwrap(), digest);

        let manifest: serde_json::Value =
            serde_json::from_slice(&layout.read_blob(&digest).unwrap()).unwrap();
        let config = layout
            .read_blob(manifest["config"]["digest"].as_str().unwrap())
            .unwrap();
        assert!(crate::oci::metadata::config_has_bundle_label(&config).unwrap());

        let layer = layout
            .read_blob(manifest["layers"][0]["digest"].as_str().unwrap())
            .unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(layer.as_slice()));
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            if name == "config.yml" {
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                assert_eq!(body, "a: 1");
            }
            names.push(name);
        }
        assert_eq!(names, vec![".imgpkg", ".imgpkg/images.yml", "config.yml"]);
    }
}
