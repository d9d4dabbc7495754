//! OCI image reference parsing.
//!
//! Parses references like `ghcr.io/org/app@sha256:...` into structured
//! components. Locked images must be in digest form; tags are only accepted
//! where a mutable upload target is expected (e.g. `push -b repo:tag`).

use imgbundle_core::error::{BundleError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myregistry.io:5000/app:v1` → registry with port
    /// - `ghcr.io/org/app@sha256:abc...` → digest form
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BundleError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|msg| {
                    BundleError::InvalidReference(format!(
                        "Invalid digest in reference '{}': {}",
                        reference, msg
                    ))
                })?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry_repository(name).map_err(|msg| {
            BundleError::InvalidReference(format!("{} in reference '{}'", msg, reference))
        })?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Parse a reference that must carry a digest.
    pub fn parse_digest_form(reference: &str) -> Result<Self> {
        let parsed = Self::parse(reference)?;
        if !parsed.is_digest_form() {
            return Err(BundleError::InvalidReference(format!(
                "Expected ref to be in digest form, got '{}'",
                reference
            )));
        }
        Ok(parsed)
    }

    /// Whether the reference pins content by digest.
    pub fn is_digest_form(&self) -> bool {
        self.digest.is_some()
    }

    /// `registry/repository`, without tag or digest.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Same repository, pinned to `digest`, tag dropped.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    /// Same repository with `tag`, digest dropped.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Check an `algorithm:hex` digest.
pub(crate) fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| "expected algorithm:hex".to_string())?;
    if algorithm.is_empty() || encoded.is_empty() {
        return Err("expected algorithm:hex".to_string());
    }
    // components of [a-z0-9] joined by single separators
    let valid_algorithm = algorithm
        .split(['+', '.', '_', '-'])
        .all(|c| !c.is_empty() && c.chars().all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit()));
    if !valid_algorithm {
        return Err(format!("'{}' is not a valid digest algorithm", algorithm));
    }
    if !encoded.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{}' is not hex encoded", encoded));
    }
    Ok(())
}

/// Split `name[:tag]`. A colon before the last slash belongs to a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            let tag = &name_tag[colon + 1..];
            // `localhost:5000` without a repository is a host, not a tag
            if last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(tag))
            }
        }
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> std::result::Result<(String, String), String> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err("Empty repository".to_string());
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    if name.is_empty() {
        return Err("Empty repository".to_string());
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
