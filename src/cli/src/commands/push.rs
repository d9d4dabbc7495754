//! `imgbundle push` command - Push a bundle or a plain image.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{ArgGroup, Args};
use imgbundle_core::config::BundleConfig;
use imgbundle_runtime::lockconfig::BundleLock;
use imgbundle_runtime::{Contents, ImageReference, PlainContents, RegistryPusher};

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["bundle", "image"])))]
pub struct PushArgs {
    /// Bundle reference to push to (e.g., registry.example.com/app-bundle:v1)
    #[arg(short, long)]
    pub bundle: Option<String>,

    /// Plain image reference to push to; inputs must not contain `.imgpkg`
    #[arg(short, long)]
    pub image: Option<String>,

    /// Files or directories to include; for bundles exactly one directory must hold `.imgpkg`
    #[arg(short = 'f', long = "file", required = true)]
    pub files: Vec<PathBuf>,

    /// Paths to leave out of the image
    #[arg(long)]
    pub exclude: Vec<PathBuf>,

    /// Write a BundleLock naming the pushed bundle to this file
    #[arg(long, requires = "bundle")]
    pub lock_output: Option<PathBuf>,
}

pub async fn execute(
    args: PushArgs,
    config: &BundleConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let metadata = super::registry_client(config);
    let pusher = RegistryPusher::new(config.registry.clone());

    match (args.bundle, args.image) {
        (Some(bundle), _) => {
            let upload_ref = ImageReference::parse(&bundle)?;
            let contents = Contents::new(args.files, args.exclude);
            let digest_ref = contents.push(&upload_ref, metadata.as_ref(), &pusher).await?;

            if let Some(path) = &args.lock_output {
                BundleLock::new(digest_ref.clone(), upload_ref.tag.clone()).write_to_path(path)?;
                tracing::info!(path = %path.display(), "Wrote bundle lock");
            }
            println!("Pushed {}", digest_ref);
        }
        (None, Some(image)) => {
            let upload_ref = ImageReference::parse(&image)?;
            if Contents::new(args.files.clone(), args.exclude.clone()).contains_bundle_dir()? {
                return Err(
                    "Images cannot be pushed with '.imgpkg' directories, consider using --bundle (-b) option"
                        .into(),
                );
            }

            let contents = PlainContents::new(args.files, args.exclude);
            let digest_ref = contents
                .push(&upload_ref, &BTreeMap::new(), metadata.as_ref(), &pusher)
                .await?;
            println!("Pushed {}", digest_ref);
        }
        (None, None) => return Err("Expected one of --bundle or --image".into()),
    }
    Ok(())
}
