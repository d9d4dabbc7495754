//! OCI registry client.
//!
//! Uses the `oci-distribution` crate to read manifests and blobs (the
//! [`ImagesMetadata`] capability) and to push images staged as an on-disk
//! OCI layout.

use async_trait::async_trait;
use imgbundle_core::config::RegistryConfig;
use imgbundle_core::error::{BundleError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::credentials::CredentialStore;
use super::layout::OciLayout;
use super::metadata::{
    detect_media_type, FetchedManifest, ImagesMetadata, DOCKER_MANIFEST_LIST_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE, OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use super::reference::ImageReference;

/// Manifest media types requested from registries.
const ACCEPTED_MANIFEST_TYPES: [&str; 4] = [
    OCI_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, else anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Credential store first, then env vars, then anonymous.
    pub fn resolve(registry: &str, config: &RegistryConfig) -> Self {
        let store = match &config.credentials_path {
            Some(path) => Ok(CredentialStore::new(path.clone())),
            None => CredentialStore::default_path(),
        };
        if let Ok(store) = store {
            match store.get(registry) {
                Ok(Some((username, password))) => return Self::basic(username, password),
                Ok(None) => {}
                Err(e) => tracing::warn!(registry, error = %e, "Ignoring unreadable credential store"),
            }
        }
        Self::from_env()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

fn build_client(config: &RegistryConfig) -> Client {
    let protocol = if config.insecure {
        ClientProtocol::Http
    } else {
        ClientProtocol::Https
    };
    Client::new(ClientConfig {
        protocol,
        ..Default::default()
    })
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        BundleError::InvalidReference(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

fn is_not_found(err: &OciDistributionError) -> bool {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(
                e.code,
                OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown
            )
        }),
        _ => false,
    }
}

/// Reads manifests and blobs from container registries.
pub struct RegistryClient {
    client: Client,
    config: RegistryConfig,
    auth_override: Option<RegistryAuth>,
}

impl RegistryClient {
    /// Client that resolves credentials per registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            client: build_client(&config),
            config,
            auth_override: None,
        }
    }

    /// Client that uses `auth` for every registry.
    pub fn with_auth(config: RegistryConfig, auth: RegistryAuth) -> Self {
        Self {
            client: build_client(&config),
            config,
            auth_override: Some(auth),
        }
    }

    fn auth_for(&self, registry: &str) -> OciRegistryAuth {
        match &self.auth_override {
            Some(auth) => auth.to_oci_auth(),
            None => RegistryAuth::resolve(registry, &self.config).to_oci_auth(),
        }
    }

    fn registry_error(registry: &str, what: &str, e: impl std::fmt::Display) -> BundleError {
        BundleError::RegistryError {
            registry: registry.to_string(),
            message: format!("{}: {}", what, e),
        }
    }
}

#[async_trait]
impl ImagesMetadata for RegistryClient {
    async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest> {
        let parsed = ImageReference::parse(reference)?;
        let oci_ref = to_oci_reference(&parsed)?;
        let auth = self.auth_for(&parsed.registry);

        tracing::debug!(reference = %parsed, "Fetching manifest");

        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, &ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BundleError::ImageNotFound(parsed.to_string())
                } else {
                    Self::registry_error(&parsed.registry, "Failed to fetch manifest", e)
                }
            })?;

        let bytes = bytes.to_vec();
        let media_type = detect_media_type(&bytes)?;
        Ok(FetchedManifest {
            bytes,
            digest,
            media_type,
        })
    }

    async fn fetch_blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>> {
        let parsed = ImageReference::parse(reference)?;
        let oci_ref = to_oci_reference(&parsed)?;
        let auth = self.auth_for(&parsed.registry);

        self.client
            .auth(&oci_ref, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| Self::registry_error(&parsed.registry, "Failed to authenticate", e))?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| {
                Self::registry_error(&parsed.registry, &format!("Failed to pull blob {}", digest), e)
            })?;

        tracing::debug!(reference = %parsed, digest, size = data.len(), "Fetched blob");
        Ok(data)
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let parsed = ImageReference::parse(reference)?;
        let oci_ref = to_oci_reference(&parsed)?;
        let auth = self.auth_for(&parsed.registry);

        match self.client.fetch_manifest_digest(&oci_ref, &auth).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Self::registry_error(
                &parsed.registry,
                "Failed to check image existence",
                e,
            )),
        }
    }
}

/// Result of a successful image push.
#[derive(Debug, Clone)]
pub struct PushResult {
    /// URL of the pushed config blob.
    pub config_url: String,
    /// URL of the pushed manifest.
    pub manifest_url: String,
}

/// Pushes images staged in an OCI layout to container registries.
pub struct RegistryPusher {
    client: Client,
    config: RegistryConfig,
}

impl RegistryPusher {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            client: build_client(&config),
            config,
        }
    }

    /// Push the first image listed in `layout`'s `index.json` to `reference`.
    pub async fn push(&self, reference: &ImageReference, layout: &OciLayout) -> Result<PushResult> {
        let oci_ref = to_oci_reference(reference)?;

        tracing::info!(
            reference = %reference,
            source = %layout.root().display(),
            "Pushing image to registry"
        );

        let manifest_digest = layout.first_manifest_digest()?;
        let manifest: OciImageManifest =
            serde_json::from_slice(&layout.read_blob(&manifest_digest)?)?;

        let config = Config::new(
            layout.read_blob(&manifest.config.digest)?,
            manifest.config.media_type.clone(),
            None,
        );

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer_desc in &manifest.layers {
            let data = layout.read_blob(&layer_desc.digest)?;
            tracing::debug!(digest = %layer_desc.digest, size = data.len(), "Read layer for push");
            layers.push(ImageLayer::new(data, layer_desc.media_type.clone(), None));
        }

        let auth = RegistryAuth::resolve(&reference.registry, &self.config).to_oci_auth();
        let response: PushResponse = self
            .client
            .push(&oci_ref, &layers, config, &auth, Some(manifest))
            .await
            .map_err(|e| BundleError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("Failed to push image: {}", e),
            })?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );

        Ok(PushResult {
            config_url: response.config_url,
            manifest_url: response.manifest_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert_eq!(auth.username, Some("user".to_string()));
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_resolve_prefers_credential_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        CredentialStore::new(path.clone())
            .store("ghcr.io", "alice", "secret")
            .unwrap();

        let config = RegistryConfig {
            insecure: false,
            credentials_path: Some(path),
        };
        let auth = RegistryAuth::resolve("ghcr.io", &config);
        assert_eq!(auth.username.as_deref(), Some("alice"));
        assert_eq!(auth.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_to_oci_reference_with_digest() {
        let r = ImageReference::parse(
            "ghcr.io/org/app@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        let oci_ref = to_oci_reference(&r).unwrap();
        assert_eq!(oci_ref.registry(), "ghcr.io");
        assert_eq!(oci_ref.repository(), "org/app");
        assert!(oci_ref.digest().is_some());
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let r = ImageReference::parse("ghcr.io/org/app:v0.1.0").unwrap();
        let oci_ref = to_oci_reference(&r).unwrap();
        assert_eq!(oci_ref.tag(), Some("v0.1.0"));
    }

    #[test]
    fn test_is_not_found() {
        let missing = OciDistributionError::ImageManifestNotFoundError("nginx".to_string());
        let server_404 = OciDistributionError::ServerError {
            code: 404,
            url: "https://ghcr.io/v2/org/app/manifests/v1".to_string(),
            message: "not found".to_string(),
        };
        let server_500 = OciDistributionError::ServerError {
            code: 500,
            url: "https://ghcr.io/v2/org/app/manifests/v1".to_string(),
            message: "boom".to_string(),
        };
        assert!(is_not_found(&missing));
        assert!(is_not_found(&server_404));
        assert!(!is_not_found(&server_500));
    }
}
