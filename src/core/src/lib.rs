//! imgbundle core - foundational types shared by the runtime and CLI.
//!
//! Error taxonomy, configuration, and the constants that define what a
//! bundle looks like on disk and in a registry.

pub mod config;
pub mod error;

pub use config::{BundleConfig, LogLevel, RegistryConfig};
pub use error::{BundleError, Result};

/// imgbundle version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reserved metadata directory that marks a directory tree as a bundle.
pub const BUNDLE_DIR: &str = ".imgpkg";

/// Image lock file inside [`BUNDLE_DIR`].
pub const IMAGES_LOCK_FILE: &str = "images.yml";

/// Image config label set on every bundle image.
pub const BUNDLE_CONFIG_LABEL: &str = "dev.carvel.imgpkg.bundle";

/// `apiVersion` of every lock and locations document.
pub const LOCK_API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";
