//! Replicates the watched tree into the mirror tree.
//!
//! Every handler is idempotent: copies overwrite, directory creation
//! creates parents, deleting something already gone succeeds. That makes
//! duplicate notifications and retries harmless.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::watcher::event::{EventKind, FileSystemEvent, PathMapper};
use crate::watcher::filter::EventFilter;
use crate::watcher::retry::RetryPolicy;
use crate::watcher::stability::{Stability, StabilityWaiter};

/// Counts from a bulk pre-sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub directories: usize,
    pub files: usize,
    pub failed: usize,
}

pub struct MirrorSynchronizer {
    mapper: PathMapper,
    filter: EventFilter,
    waiter: StabilityWaiter,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    /// Copy attempts when verification is on, `None` when off.
    verify_attempts: Option<u32>,
}

impl std::fmt::Debug for MirrorSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSynchronizer")
            .field("mapper", &self.mapper)
            .field("retry", &self.retry)
            .field("verify_attempts", &self.verify_attempts)
            .finish()
    }
}

impl MirrorSynchronizer {
    pub fn new(
        mapper: PathMapper,
        filter: EventFilter,
        waiter: StabilityWaiter,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mapper,
            filter,
            waiter,
            retry,
            clock,
            verify_attempts: None,
        }
    }

    /// Compare every copy with its source and redo it up to `attempts` times.
    pub fn with_verification(mut self, attempts: u32) -> Self {
        self.verify_attempts = Some(attempts.max(1));
        self
    }

    /// Build from settings. Fails when mirroring lacks a destination.
    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let mapper = PathMapper::new(settings.watch_root()?, settings.mirror_root()?);
        let filter = EventFilter::builder()
            .include([".*"])
            .exclude(settings.watch.mirror_excludes.iter())
            .case_sensitive(settings.watch.case_sensitive)
            .build()?;
        let waiter = StabilityWaiter::new(Arc::clone(&clock), settings.stability.max_polls);

        let mirror = Self::new(mapper, filter, waiter, settings.retry.mirror_policy(), clock);
        Ok(if settings.watch.verify_copies {
            mirror.with_verification(settings.watch.verify_attempts)
        } else {
            mirror
        })
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Apply one event to the mirror, retrying transient failures.
    pub fn handle(&self, event: &FileSystemEvent) -> EngineResult<()> {
        if !self.filter.should_dispatch(event) {
            crate::debug_event!("mirror", "filtered", "{event}");
            return Ok(());
        }
        if event.paths().any(|p| self.mapper.is_in_mirror(p)) {
            crate::debug_event!("mirror", "ignored event inside mirror", "{event}");
            return Ok(());
        }

        let what = format!("mirroring {event}");
        self.retry
            .run(self.clock.as_ref(), &what, |_| self.apply(event))
    }

    fn apply(&self, event: &FileSystemEvent) -> EngineResult<()> {
        match event.kind {
            EventKind::Created | EventKind::Modified => {
                let Some(target) = self.target_of(&event.src_path, event.mirror_path.as_deref())
                else {
                    return Ok(());
                };
                self.replicate(&event.src_path, &target, event.is_directory, event.kind)
            }
            EventKind::Deleted => {
                let Some(target) = self.target_of(&event.src_path, event.mirror_path.as_deref())
                else {
                    return Ok(());
                };
                remove_mirrored(&target)
            }
            EventKind::Moved => {
                let Some(dest) = event.dest_path.as_deref() else {
                    return Ok(());
                };
                if let Some(target) = self.target_of(dest, event.dest_mirror_path.as_deref()) {
                    self.replicate(dest, &target, event.is_directory, EventKind::Created)?;
                    if event.is_directory {
                        self.backfill(dest)?;
                    }
                }
                if let Some(old) = self.target_of(&event.src_path, event.mirror_path.as_deref()) {
                    remove_mirrored(&old)?;
                }
                Ok(())
            }
        }
    }

    fn target_of(&self, path: &Path, annotated: Option<&Path>) -> Option<PathBuf> {
        annotated
            .map(Path::to_path_buf)
            .or_else(|| self.mapper.mirror_of(path))
    }

    fn replicate(&self, source: &Path, target: &Path, is_dir: bool, kind: EventKind) -> EngineResult<()> {
        if is_dir {
            if kind == EventKind::Created {
                fs::create_dir_all(target).map_err(|e| EngineError::io("creating", target, e))?;
                crate::debug_event!("mirror", "directory", "{}", target.display());
            }
            return Ok(());
        }

        match self.waiter.wait_until_stable(source) {
            Stability::Vanished => {
                // The matching delete event is on its way
                crate::debug_event!("mirror", "source vanished", "{}", source.display());
                Ok(())
            }
            Stability::Stable { .. } | Stability::GaveUp { .. } => self.copy(source, target),
        }
    }

    /// Copy `source` over `target`, verifying when configured.
    pub fn copy(&self, source: &Path, target: &Path) -> EngineResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io("creating", parent, e))?;
        }

        let attempts = self.verify_attempts.unwrap_or(1);
        for _ in 0..attempts {
            fs::copy(source, target).map_err(|e| EngineError::io("copying", source, e))?;
            if self.verify_attempts.is_none() || same_content(source, target)? {
                crate::debug_event!(
                    "mirror",
                    "copied",
                    "{} -> {}",
                    source.display(),
                    target.display()
                );
                return Ok(());
            }
            crate::debug_event!("mirror", "verification mismatch", "{}", target.display());
        }

        Err(EngineError::MirrorDivergence {
            source_path: source.to_path_buf(),
            mirror_path: target.to_path_buf(),
            attempts,
        })
    }

    /// Copy the watched counterpart of `path` over its mirror again.
    ///
    /// `path` may live in either tree; the copy always goes from the
    /// watched tree to the mirror.
    pub fn recopy(&self, path: &Path) -> EngineResult<()> {
        let (source, target) = if self.mapper.is_in_mirror(path) {
            match self.mapper.mirror_of(path) {
                Some(source) => (source, path.to_path_buf()),
                None => return Ok(()),
            }
        } else {
            match self.mapper.mirror_of(path) {
                Some(target) => (path.to_path_buf(), target),
                None => return Ok(()),
            }
        };

        crate::log_event!("mirror", "re-copying", "{}", source.display());
        self.copy(&source, &target)
    }

    /// Mirror every entry of the watched tree missing from the mirror.
    ///
    /// Walks in sorted order. Failures are logged per entry and counted.
    pub fn process_all_existing(&self) -> EngineResult<SyncReport> {
        let root = self.mapper.watch_root().to_path_buf();
        let report = self.sync_tree(&root)?;
        crate::log_event!(
            "mirror",
            "pre-sync complete",
            "{} directories, {} files, {} failed",
            report.directories,
            report.files,
            report.failed
        );
        Ok(report)
    }

    fn backfill(&self, dir: &Path) -> EngineResult<()> {
        let report = self.sync_tree(dir)?;
        crate::debug_event!(
            "mirror",
            "backfilled",
            "{}: {} files",
            dir.display(),
            report.files
        );
        Ok(())
    }

    fn sync_tree(&self, start: &Path) -> EngineResult<SyncReport> {
        let mut report = SyncReport::default();
        let mirror_root = self.mapper.mirror_root().to_path_buf();

        let walker = WalkDir::new(start)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !entry.path().starts_with(&mirror_root));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[mirror] skipping unreadable entry: {e}");
                    report.failed += 1;
                    continue;
                }
            };

            let path = entry.path();
            let is_dir = entry.file_type().is_dir();
            let event = FileSystemEvent::created(path, is_dir);
            if !self.filter.should_dispatch(&event) {
                continue;
            }
            let Some(target) = self.mapper.mirror_of(path) else {
                continue;
            };
            if target.exists() {
                continue;
            }

            let result = if is_dir {
                fs::create_dir_all(&target).map_err(|e| EngineError::io("creating", &target, e))
            } else {
                self.copy(path, &target)
            };

            match result {
                Ok(()) if is_dir => report.directories += 1,
                Ok(()) => report.files += 1,
                Err(e) => {
                    tracing::warn!("[mirror] pre-sync of {} failed: {e}", path.display());
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Unlink a mirrored file or remove a mirrored directory tree.
fn remove_mirrored(target: &Path) -> EngineResult<()> {
    if target.is_dir() {
        if let Err(e) = fs::remove_dir_all(target) {
            tracing::warn!("[mirror] could not remove {}: {e}", target.display());
        }
        return Ok(());
    }

    match fs::remove_file(target) {
        Ok(()) => {
            crate::debug_event!("mirror", "removed", "{}", target.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io("removing", target, e)),
    }
}

fn same_content(a: &Path, b: &Path) -> EngineResult<bool> {
    let left = fs::read(a).map_err(|e| EngineError::io("reading", a, e))?;
    let right = fs::read(b).map_err(|e| EngineError::io("reading", b, e))?;
    Ok(left == right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    struct Trees {
        _dir: TempDir,
        root: PathBuf,
        mirror: PathBuf,
    }

    fn trees() -> Trees {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&mirror).unwrap();
        Trees {
            _dir: dir,
            root,
            mirror,
        }
    }

    fn synchronizer(trees: &Trees) -> MirrorSynchronizer {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let filter = EventFilter::builder()
            .include([".*"])
            .exclude([r"\.tmp$"])
            .build()
            .unwrap();
        MirrorSynchronizer::new(
            PathMapper::new(&trees.root, &trees.mirror),
            filter,
            StabilityWaiter::new(Arc::clone(&clock), 10),
            RetryPolicy::fixed(2, std::time::Duration::from_millis(1)),
            clock,
        )
    }

    fn annotated(mut event: FileSystemEvent, sync: &MirrorSynchronizer) -> FileSystemEvent {
        event.annotate(sync.mapper());
        event
    }

    #[test]
    fn test_created_directory_and_file() {
        let t = trees();
        let sync = synchronizer(&t);

        fs::create_dir(t.root.join("S1")).unwrap();
        fs::write(t.root.join("S1/img.tif"), b"II*\0data").unwrap();

        sync.handle(&annotated(FileSystemEvent::created(t.root.join("S1"), true), &sync))
            .unwrap();
        assert!(t.mirror.join("S1").is_dir());

        sync.handle(&annotated(
            FileSystemEvent::created(t.root.join("S1/img.tif"), false),
            &sync,
        ))
        .unwrap();
        assert_eq!(fs::read(t.mirror.join("S1/img.tif")).unwrap(), b"II*\0data");
    }

    #[test]
    fn test_duplicate_create_is_idempotent() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::write(t.root.join("a.txt"), b"content").unwrap();

        let event = annotated(FileSystemEvent::created(t.root.join("a.txt"), false), &sync);
        sync.handle(&event).unwrap();
        let first = fs::read(t.mirror.join("a.txt")).unwrap();
        sync.handle(&event).unwrap();

        assert_eq!(fs::read(t.mirror.join("a.txt")).unwrap(), first);
        assert_eq!(fs::read_dir(&t.mirror).unwrap().count(), 1);
    }

    #[test]
    fn test_excluded_files_are_not_mirrored() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::write(t.root.join("scan.tmp"), b"partial").unwrap();

        sync.handle(&annotated(
            FileSystemEvent::created(t.root.join("scan.tmp"), false),
            &sync,
        ))
        .unwrap();
        assert!(!t.mirror.join("scan.tmp").exists());
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let t = trees();
        let sync = synchronizer(&t);

        sync.handle(&annotated(
            FileSystemEvent::deleted(t.root.join("gone.tif"), false),
            &sync,
        ))
        .unwrap();
    }

    #[test]
    fn test_delete_removes_file_and_directory() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::create_dir_all(t.mirror.join("S1/inner")).unwrap();
        fs::write(t.mirror.join("S1/inner/a.tif"), b"x").unwrap();
        fs::write(t.mirror.join("b.tif"), b"x").unwrap();

        sync.handle(&annotated(FileSystemEvent::deleted(t.root.join("b.tif"), false), &sync))
            .unwrap();
        // Notification sources may report directory deletions as files
        sync.handle(&annotated(FileSystemEvent::deleted(t.root.join("S1"), false), &sync))
            .unwrap();

        assert!(!t.mirror.join("b.tif").exists());
        assert!(!t.mirror.join("S1").exists());
    }

    #[test]
    fn test_moved_file() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::create_dir_all(t.root.join("S2")).unwrap();
        fs::create_dir_all(t.mirror.join("S1")).unwrap();
        fs::write(t.mirror.join("S1/a.tif"), b"old").unwrap();
        fs::write(t.root.join("S2/a.tif"), b"new").unwrap();

        sync.handle(&annotated(
            FileSystemEvent::moved(t.root.join("S1/a.tif"), t.root.join("S2/a.tif"), false),
            &sync,
        ))
        .unwrap();

        assert!(!t.mirror.join("S1/a.tif").exists());
        assert_eq!(fs::read(t.mirror.join("S2/a.tif")).unwrap(), b"new");
    }

    #[test]
    fn test_moved_directory_backfills_content() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::create_dir_all(t.mirror.join("old/sub")).unwrap();
        fs::create_dir_all(t.root.join("new/sub")).unwrap();
        fs::write(t.root.join("new/sub/a.tif"), b"a").unwrap();

        sync.handle(&annotated(
            FileSystemEvent::moved(t.root.join("old"), t.root.join("new"), true),
            &sync,
        ))
        .unwrap();

        assert!(!t.mirror.join("old").exists());
        assert_eq!(fs::read(t.mirror.join("new/sub/a.tif")).unwrap(), b"a");
    }

    #[test]
    fn test_process_all_existing_skips_present_entries() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::create_dir_all(t.root.join("A/B")).unwrap();
        fs::write(t.root.join("A/B/one.tif"), b"1").unwrap();
        fs::write(t.root.join("A/two.tif"), b"2").unwrap();
        fs::write(t.root.join("A/skip.tmp"), b"t").unwrap();
        fs::create_dir_all(t.mirror.join("A")).unwrap();
        fs::write(t.mirror.join("A/two.tif"), b"kept").unwrap();

        let report = sync.process_all_existing().unwrap();

        assert_eq!(report.directories, 1);
        assert_eq!(report.files, 1);
        assert_eq!(fs::read(t.mirror.join("A/B/one.tif")).unwrap(), b"1");
        assert_eq!(fs::read(t.mirror.join("A/two.tif")).unwrap(), b"kept");
        assert!(!t.mirror.join("A/skip.tmp").exists());
    }

    #[test]
    fn test_recopy_from_mirror_path() {
        let t = trees();
        let sync = synchronizer(&t);
        fs::write(t.root.join("img.tif"), b"good").unwrap();
        fs::write(t.mirror.join("img.tif"), b"bad").unwrap();

        sync.recopy(&t.mirror.join("img.tif")).unwrap();
        assert_eq!(fs::read(t.mirror.join("img.tif")).unwrap(), b"good");
    }

    #[test]
    fn test_verified_copy() {
        let t = trees();
        let sync = synchronizer(&t).with_verification(2);
        fs::write(t.root.join("a.tif"), b"payload").unwrap();

        sync.copy(&t.root.join("a.tif"), &t.mirror.join("a.tif")).unwrap();
        assert_eq!(fs::read(t.mirror.join("a.tif")).unwrap(), b"payload");
    }
}
