//! imgbundle runtime - bundle validation, image-lock localization and the
//! tar transport.
//!
//! - [`bundle`]: `.imgpkg` structure checks, push/pull, lock localization
//! - [`plainimage`]: files published as a plain single-layer image
//! - [`lockconfig`]: `ImagesLock` / `BundleLock` documents
//! - [`imagedesc`] + [`imagetar`]: descriptor record and single-file tar transport
//! - [`oci`]: registry access, OCI layouts, reference parsing

#![allow(clippy::result_large_err)]

pub mod bundle;
pub mod imagedesc;
pub mod imagetar;
pub mod lockconfig;
pub mod oci;
pub mod plainimage;

// Re-export common types
pub use bundle::{Bundle, Contents, ImageRefs, ImagesLock, LocalizedImagesLock, PullResult};
pub use imagedesc::{BlobSource, ImageOrIndex, ImageRefDescriptors};
pub use imagetar::{collect_descriptors, TarReader, TarWriter};
pub use oci::{ImageReference, ImagesMetadata, OciLayout, RegistryClient, RegistryPusher};
pub use plainimage::{PlainContents, PlainImage};

/// imgbundle runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
