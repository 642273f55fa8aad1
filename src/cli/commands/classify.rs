//! Classify command.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::Settings;
use crate::protocol::profile;

/// Print `path<TAB>type` for each path, `-` when nothing matches.
///
/// Existing files go through the content probes as well, so the output is
/// the type the engine would dispatch to.
pub fn run_classify(settings: &Settings, paths: &[PathBuf]) -> Result<()> {
    let registry = profile::registry_from_settings(settings).context("building registry")?;

    for path in paths {
        let kind = if path.is_file() {
            registry
                .effective_type(path)
                .with_context(|| format!("inspecting {}", path.display()))?
        } else {
            registry.classify(path)
        };
        let label = kind.map(|k| k.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{}\t{label}", path.display());
    }
    Ok(())
}
