use thiserror::Error;

/// imgbundle error types
#[derive(Error, Debug)]
pub enum BundleError {
    /// Bundle directory layout violates placement or cardinality rules
    #[error("Bundle structure error: {0}")]
    Structure(String),

    /// Bundle contents are not allowed (e.g. a bundle listed in its own lock)
    #[error("Bundle content error: {0}")]
    Content(String),

    /// No image locations record exists for the bundle.
    ///
    /// Not fatal: callers fall back to probing the registry.
    #[error("Image locations not found for bundle '{bundle}'")]
    LocationsNotFound { bundle: String },

    /// Malformed lock document
    #[error("Lock format error: {0}")]
    LockFormat(String),

    /// Malformed tar transport archive
    #[error("Tar format error: {0}")]
    Format(String),

    /// Image reference could not be parsed or is not in the required form
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// None of the requested image references exist in the registry
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BundleError {
    /// Whether this is the "no locations record" sentinel.
    pub fn is_locations_not_found(&self) -> bool {
        matches!(self, BundleError::LocationsNotFound { .. })
    }

    /// Whether the registry reported the image as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BundleError::ImageNotFound(_))
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BundleError {
    fn from(err: serde_yaml::Error) -> Self {
        BundleError::SerializationError(err.to_string())
    }
}

/// Result type alias for imgbundle operations
pub type Result<T> = std::result::Result<T, BundleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_error_display() {
        let error = BundleError::Structure("Expected one '.imgpkg' dir, got 0".to_string());
        assert_eq!(
            error.to_string(),
            "Bundle structure error: Expected one '.imgpkg' dir, got 0"
        );
    }

    #[test]
    fn test_locations_not_found_display() {
        let error = BundleError::LocationsNotFound {
            bundle: "ghcr.io/org/bundle@sha256:abc".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Image locations not found for bundle 'ghcr.io/org/bundle@sha256:abc'"
        );
    }

    #[test]
    fn test_locations_not_found_is_distinguishable() {
        let sentinel = BundleError::LocationsNotFound {
            bundle: "b".to_string(),
        };
        let transport = BundleError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(sentinel.is_locations_not_found());
        assert!(!transport.is_locations_not_found());
        assert!(!BundleError::ImageNotFound("x".to_string()).is_locations_not_found());
    }

    #[test]
    fn test_is_not_found() {
        assert!(BundleError::ImageNotFound("nginx".to_string()).is_not_found());
        assert!(!BundleError::Other("nope".to_string()).is_not_found());
    }

    #[test]
    fn test_registry_error_display() {
        let error = BundleError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - Authentication failed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BundleError = io_error.into();
        assert!(matches!(error, BundleError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: BundleError = result.unwrap_err().into();
        assert!(matches!(error, BundleError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: BundleError = result.unwrap_err().into();
        assert!(matches!(error, BundleError::SerializationError(_)));
    }
}
