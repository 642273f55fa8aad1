//! protowatch binary entry point.

use anyhow::{Context, Result};
use clap::Parser;

use protowatch::Settings;
use protowatch::cli::commands::{classify, init, sync, watch};
use protowatch::cli::{Cli, Commands};
use protowatch::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before any settings file exists
    if let Commands::Init { force } = cli.command {
        return init::run_init(force);
    }

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Settings::load().context("loading configuration")?,
    };
    if let Some(root) = cli.root {
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .context("resolving current directory")?
                .join(root)
        };
        settings.watch.root = Some(root);
    }

    logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Config => init::run_config(&settings),
        Commands::Classify { paths } => classify::run_classify(&settings, &paths),
        Commands::Sync => sync::run_sync(&settings),
        Commands::Scan => sync::run_scan(&settings),
        Commands::Watch { no_presync } => watch::run_watch(&settings, !no_presync).await,
    }
}
