//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Mirror instrument output and keep the lab protocol in sync
#[derive(Parser)]
#[command(
    name = "protowatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Mirror instrument output and keep the lab protocol in sync",
    long_about = "Watch the directory an instrument writes into, mirror it, classify every \
                  file and maintain the protocol document built from the directory tree.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Examples:\n  protowatch init\n  protowatch sync\n  protowatch scan --root /data/session\n  protowatch watch\n  protowatch classify img_001.tif photo.jpg"
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true, env = "PROTOWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Watched root, overrides watch.root
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .protowatch directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings")]
    Config,

    /// Print the element type of each path
    #[command(about = "Classify paths with the configured instrument profile")]
    Classify {
        /// Files to classify
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },

    /// Copy everything missing from the mirror once
    #[command(about = "Mirror existing content without watching")]
    Sync,

    /// Build the protocol from existing content and publish it once
    #[command(about = "Replay existing content into the protocol and publish")]
    Scan,

    /// Pre-sync, then follow changes until interrupted
    #[command(about = "Watch the root and keep mirror and protocol in sync")]
    Watch {
        /// Skip mirroring and replaying existing content on start
        #[arg(long)]
        no_presync: bool,
    },
}
