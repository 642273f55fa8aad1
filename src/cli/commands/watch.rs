//! Watch command.

use anyhow::{Context, Result};

use crate::clock;
use crate::config::Settings;
use crate::protocol::dispatch::ProtocolDispatchEngine;
use crate::watcher::runner::ProtocolWatcher;

/// Watch until Ctrl-C or until the notification source goes away.
pub async fn run_watch(settings: &Settings, presync: bool) -> Result<()> {
    let engine = ProtocolDispatchEngine::from_settings(settings, clock::system())
        .context("setting up engine")?;
    let root = settings.watch_root()?.to_path_buf();

    let (watcher, stop) = ProtocolWatcher::watch(engine, &root)
        .with_context(|| format!("watching {}", root.display()))?;
    let watcher = watcher
        .idle_flush(settings.scheduler.idle_flush())
        .presync(presync);

    println!("Watching {} (Ctrl-C to stop)", root.display());
    let mut task = tokio::task::spawn_blocking(move || watcher.run());

    let (engine, report) = tokio::select! {
        finished = &mut task => finished.context("watcher thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            stop.stop();
            task.await.context("watcher thread panicked")?
        }
    };

    let document = engine.document();
    println!(
        "Stopped after {} events ({} discarded), {} samples in protocol",
        report.processed,
        report.discarded,
        document.lock().samples.len()
    );
    Ok(())
}
