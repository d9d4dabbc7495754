//! `imgbundle copy` command - Move bundles and images through a tar file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgGroup, Args};
use imgbundle_core::config::BundleConfig;
use imgbundle_runtime::{
    collect_descriptors, Bundle, ImageReference, ImagesMetadata, OciLayout, TarReader, TarWriter,
};

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["bundle", "image", "lock", "tar"])))]
pub struct CopyArgs {
    /// Bundle to copy together with every image its lock references
    #[arg(short, long)]
    pub bundle: Option<String>,

    /// BundleLock file naming the bundle to copy
    #[arg(long)]
    pub lock: Option<PathBuf>,

    /// Single image or index to copy
    #[arg(short, long)]
    pub image: Option<String>,

    /// Tar file written by `--to-tar`
    #[arg(long, requires = "to_layout", conflicts_with = "to_tar")]
    pub tar: Option<PathBuf>,

    /// Write the images into this tar file
    #[arg(long, required_unless_present = "tar")]
    pub to_tar: Option<PathBuf>,

    /// Write the images of `--tar` into this OCI image layout directory
    #[arg(long, requires = "tar")]
    pub to_layout: Option<PathBuf>,
}

pub async fn execute(
    args: CopyArgs,
    config: &BundleConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let (Some(tar), Some(layout)) = (&args.tar, &args.to_layout) {
        return tar_to_layout(tar, layout);
    }

    let Some(to_tar) = args.to_tar else {
        return Err("--to-tar is required when copying from a registry".into());
    };

    let metadata = super::registry_client(config);
    let refs = match args.image {
        Some(image) => vec![image],
        None => {
            let bundle = super::bundle_source(args.bundle, args.lock.as_deref())?;
            bundle_refs(&bundle, metadata.clone(), config).await?
        }
    };

    let staging = tempfile::tempdir()?;
    let layout = OciLayout::create(staging.path())?;
    let descs = collect_descriptors(metadata.as_ref(), &refs, &layout).await?;
    TarWriter::new(descs, Arc::new(layout)).write(&to_tar)?;

    println!("Wrote {} images to {}", refs.len(), to_tar.display());
    Ok(())
}

/// The bundle itself followed by the reachable location of every image in
/// its lock, nested bundles included.
async fn bundle_refs(
    reference: &str,
    metadata: Arc<dyn ImagesMetadata>,
    config: &BundleConfig,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let manifest = metadata.fetch_manifest(reference).await?;
    let digest_ref = ImageReference::parse(reference)?
        .with_digest(manifest.digest)
        .full_reference();

    let bundle = Bundle::new(digest_ref.clone(), metadata.clone())
        .with_probe_concurrency(config.probe_concurrency);
    if !bundle.is_bundle().await? {
        return Err(format!(
            "Expected bundle image but found plain image {} (hint: did you use -b instead of -i?)",
            reference
        )
        .into());
    }

    let mut lock = bundle.all_images_lock().await?;
    let mut refs = vec![digest_ref];
    for image_ref in lock.image_refs().await?.all() {
        let found = metadata
            .first_image_exists(&image_ref.image_ref.locations())
            .await?;
        if !refs.contains(&found) {
            refs.push(found);
        }
    }
    Ok(refs)
}

fn tar_to_layout(tar: &Path, dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reader = TarReader::open(tar)?;
    let layout = OciLayout::create(dir)?;

    let mut count = 0;
    for item in reader.read()? {
        layout.write_image_or_index(&item)?;
        count += 1;
    }

    println!("Wrote {} images from {} to {}", count, tar.display(), dir.display());
    Ok(())
}
