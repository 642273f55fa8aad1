//! Sync and Scan commands.

use anyhow::{Context, Result, bail};

use crate::clock;
use crate::config::Settings;
use crate::mirror::MirrorSynchronizer;
use crate::protocol::dispatch::ProtocolDispatchEngine;

/// Copy everything missing from the mirror.
pub fn run_sync(settings: &Settings) -> Result<()> {
    settings.validate().context("invalid configuration")?;
    if !settings.watch.mirror_enabled {
        bail!("mirroring is disabled, set watch.mirror_enabled = true");
    }

    let mirror = MirrorSynchronizer::from_settings(settings, clock::system())
        .context("setting up mirror")?;
    let report = mirror.process_all_existing().context("mirroring existing content")?;

    println!(
        "Mirrored {} directories and {} files ({} failed)",
        report.directories, report.files, report.failed
    );
    Ok(())
}

/// Mirror, replay existing content into the protocol and publish once.
pub fn run_scan(settings: &Settings) -> Result<()> {
    let mut engine = ProtocolDispatchEngine::from_settings(settings, clock::system())
        .context("setting up engine")?;

    if let Some(mirror) = engine.mirror() {
        mirror.process_all_existing().context("mirroring existing content")?;
    }
    let report = engine.process_existing();

    let document = engine.document();
    let document = document.lock();
    println!(
        "Processed {} files ({} failed): {} samples, {} resources",
        report.files,
        report.failed,
        document.samples.len(),
        document.all_resources().count()
    );
    if let Some(path) = &settings.protocol.snapshot_path {
        println!("Protocol written to {}", path.display());
    }
    Ok(())
}
