//! OCI registry and image-layout plumbing.
//!
//! - [`ImagesMetadata`]: the read capability the bundle and lock engines consume
//! - [`RegistryClient`] / [`RegistryPusher`]: `oci-distribution` backed transport
//! - [`OciLayout`]: on-disk staging area for pushes and tar import/export
//! - [`ImageReference`]: reference parsing and digest-form checks

pub mod credentials;
pub mod layout;
pub mod metadata;
pub mod reference;
pub mod registry;

pub use credentials::CredentialStore;
pub use layout::OciLayout;
pub use metadata::{FetchedManifest, ImagesMetadata};
pub use reference::ImageReference;
pub use registry::{PushResult, RegistryAuth, RegistryClient, RegistryPusher};

use sha2::{Digest, Sha256};

/// `sha256:<hex>` digest of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
