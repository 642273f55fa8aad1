//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protowatch::clock::{Clock, ManualClock};
use protowatch::{ProtocolDispatchEngine, Settings};
use tempfile::TempDir;

pub const TIFF: &[u8] = b"II*\0instrument-data";
pub const PDF: &[u8] = b"%PDF-1.7 notes";

/// A watched root and a separate mirror root.
pub struct Session {
    pub watched: TempDir,
    pub mirror: TempDir,
}

impl Session {
    pub fn new() -> Self {
        Self {
            watched: TempDir::new().unwrap(),
            mirror: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.watched.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.watched.path().join(relative)
    }

    pub fn mirrored(&self, relative: &str) -> PathBuf {
        self.mirror.path().join(relative)
    }

    /// Write `contents` below the watched root, creating parents.
    pub fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn settings(&self, mirror: bool) -> Settings {
        let mut settings = Settings::default();
        settings.watch.root = Some(self.root().to_path_buf());
        if mirror {
            settings.watch.mirror_root = Some(self.mirror.path().to_path_buf());
            settings.watch.mirror_enabled = true;
        }
        settings.stability.max_polls = 5;
        settings
    }

    /// Engine on a manual clock, so stability polls and retries never sleep.
    pub fn engine(&self, settings: &Settings) -> ProtocolDispatchEngine {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        ProtocolDispatchEngine::from_settings(settings, clock).unwrap()
    }
}
