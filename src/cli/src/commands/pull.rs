//! `imgbundle pull` command - Pull a bundle (localizing its lock) or a plain image.

use std::path::PathBuf;

use clap::{ArgGroup, Args};
use imgbundle_core::config::BundleConfig;
use imgbundle_runtime::{Bundle, PlainImage};

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["bundle", "image", "lock"])))]
pub struct PullArgs {
    /// Bundle reference to pull
    #[arg(short, long)]
    pub bundle: Option<String>,

    /// Plain image reference to pull
    #[arg(short, long)]
    pub image: Option<String>,

    /// BundleLock file naming the bundle to pull
    #[arg(long)]
    pub lock: Option<PathBuf>,

    /// Directory to unpack into
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(
    args: PullArgs,
    config: &BundleConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let metadata = super::registry_client(config);

    if let Some(image) = args.image {
        let digest_ref = PlainImage::new(image, metadata).pull(&args.output).await?;
        println!("Pulled {}", digest_ref);
        println!("Extracted to {}", args.output.display());
        return Ok(());
    }

    let reference = super::bundle_source(args.bundle, args.lock.as_deref())?;
    let bundle = Bundle::new(reference, metadata).with_probe_concurrency(config.probe_concurrency);
    let result = bundle.pull(&args.output).await?;

    println!("Pulled {}", result.digest_ref);
    if result.localized {
        println!(
            "Updated .imgpkg/images.yml with the relocated references of {} images",
            result.image_refs.len()
        );
    } else {
        println!("Kept .imgpkg/images.yml unchanged; images were not relocated with this bundle");
    }
    println!("Extracted to {}", args.output.display());
    Ok(())
}
