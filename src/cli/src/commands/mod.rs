//! CLI command definitions and dispatch.

mod copy;
mod login;
mod pull;
mod push;

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use imgbundle_core::config::BundleConfig;
use imgbundle_runtime::lockconfig::BundleLock;
use imgbundle_runtime::RegistryClient;

pub use copy::CopyArgs;
pub use login::LoginArgs;
pub use pull::PullArgs;
pub use push::PushArgs;

/// imgbundle - package, relocate and pull OCI image bundles.
#[derive(Parser)]
#[command(name = "imgbundle", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Push files as a bundle (`-b`) or a plain image (`-i`)
    Push(PushArgs),
    /// Pull a bundle, rewriting its lock to relocated images when possible, or a plain image
    Pull(PullArgs),
    /// Copy a bundle or image into a tar file, or a tar file into an OCI layout
    Copy(CopyArgs),
    /// Store registry credentials
    Login(LoginArgs),
}

/// Dispatch a parsed command.
pub async fn dispatch(
    cli: Cli,
    config: BundleConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Push(args) => push::execute(args, &config).await,
        Command::Pull(args) => pull::execute(args, &config).await,
        Command::Copy(args) => copy::execute(args, &config).await,
        Command::Login(args) => login::execute(args, &config).await,
    }
}

fn registry_client(config: &BundleConfig) -> Arc<RegistryClient> {
    Arc::new(RegistryClient::new(config.registry.clone()))
}

/// Bundle reference given directly with `-b` or through a BundleLock file.
fn bundle_source(
    bundle: Option<String>,
    lock: Option<&Path>,
) -> Result<String, Box<dyn std::error::Error>> {
    match (bundle, lock) {
        (Some(bundle), _) => Ok(bundle),
        (None, Some(path)) => Ok(BundleLock::from_path(path)?.bundle.image),
        (None, None) => Err("Expected one of --bundle or --lock".into()),
    }
}
