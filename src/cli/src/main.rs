use clap::Parser;
use imgbundle_cli::commands::{self, Cli};
use imgbundle_core::config::BundleConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match BundleConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let level: tracing::Level = config.log_level.into();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = commands::dispatch(cli, config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
