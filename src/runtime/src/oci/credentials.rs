//! Registry credential file.
//!
//! Per-registry username/password pairs at
//! `~/.imgbundle/auth/credentials.json`, written atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use imgbundle_core::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, CredentialEntry>,
}

/// Registry credential file.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.imgbundle/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            BundleError::ConfigError("Cannot determine home directory for credentials".to_string())
        })?;
        Ok(Self::new(
            home.join(".imgbundle").join("auth").join("credentials.json"),
        ))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Save credentials for `registry`, replacing any previous entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// `(username, password)` for `registry`, if present.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(|e| (e.username.clone(), e.password.clone())))
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            BundleError::ConfigError(format!(
                "Failed to read credentials {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            BundleError::ConfigError(format!(
                "Failed to parse credentials {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Docker Hub aliases share one entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("auth").join("credentials.json"));

        store.store("ghcr.io", "user1", "pass1").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user1".to_string(), "pass1".to_string()))
        );
        assert_eq!(store.get("quay.io").unwrap(), None);
    }

    #[test]
    fn test_overwrite_existing() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        store.store("ghcr.io", "user1", "pass1").unwrap();
        store.store("ghcr.io", "user2", "pass2").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user2".to_string(), "pass2".to_string()))
        );
    }

    #[test]
    fn test_docker_io_normalization() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        store.store("docker.io", "user", "pass").unwrap();
        assert!(store.get("index.docker.io").unwrap().is_some());
        assert!(store.get("registry-1.docker.io").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = CredentialStore::new(path).get("ghcr.io").unwrap_err();
        assert!(matches!(err, BundleError::ConfigError(_)));
    }
}
