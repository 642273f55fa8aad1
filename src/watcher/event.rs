//! File-system events as seen by the pipeline.
//!
//! Events arrive from the notification source with a kind, a source path,
//! an optional destination (moves only) and a directory flag. Before they
//! reach any component the engine annotates them with their mirror paths.

use std::fmt;
use std::path::{Path, PathBuf};

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
            EventKind::Moved => "moved",
        };
        f.write_str(name)
    }
}

/// A single notification from the watched tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemEvent {
    pub kind: EventKind,
    pub src_path: PathBuf,
    /// Destination of a move, `None` for every other kind.
    pub dest_path: Option<PathBuf>,
    pub is_directory: bool,
    /// Counterpart of `src_path` in the other tree.
    pub mirror_path: Option<PathBuf>,
    /// Counterpart of `dest_path` in the other tree.
    pub dest_mirror_path: Option<PathBuf>,
}

impl FileSystemEvent {
    fn new(kind: EventKind, path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind,
            src_path: path.into(),
            dest_path: None,
            is_directory,
            mirror_path: None,
            dest_mirror_path: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self::new(EventKind::Created, path, is_directory)
    }

    pub fn modified(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self::new(EventKind::Modified, path, is_directory)
    }

    pub fn deleted(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self::new(EventKind::Deleted, path, is_directory)
    }

    pub fn moved(src: impl Into<PathBuf>, dest: impl Into<PathBuf>, is_directory: bool) -> Self {
        let mut event = Self::new(EventKind::Moved, src, is_directory);
        event.dest_path = Some(dest.into());
        event
    }

    /// All paths this event touches, source first.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.src_path.as_path()).chain(self.dest_path.as_deref())
    }

    /// Fill in `mirror_path` (and `dest_mirror_path` for moves).
    pub fn annotate(&mut self, mapper: &PathMapper) {
        self.mirror_path = mapper.mirror_of(&self.src_path);
        self.dest_mirror_path = self.dest_path.as_deref().and_then(|p| mapper.mirror_of(p));
    }

    /// Split a move into the synthetic create-at-destination and
    /// delete-at-source pair, in that order.
    pub fn split_move(&self) -> Option<(FileSystemEvent, FileSystemEvent)> {
        let dest = self.dest_path.as_ref()?;
        if self.kind != EventKind::Moved {
            return None;
        }

        let mut created = FileSystemEvent::created(dest.clone(), self.is_directory);
        created.mirror_path = self.dest_mirror_path.clone();

        let mut deleted = FileSystemEvent::deleted(self.src_path.clone(), self.is_directory);
        deleted.mirror_path = self.mirror_path.clone();

        Some((created, deleted))
    }
}

impl fmt::Display for FileSystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = if self.is_directory { "directory" } else { "file" };
        match &self.dest_path {
            Some(dest) => write!(
                f,
                "{} {what} {} -> {}",
                self.kind,
                self.src_path.display(),
                dest.display()
            ),
            None => write!(f, "{} {what} {}", self.kind, self.src_path.display()),
        }
    }
}

/// Maps paths between the watched tree and its mirror.
#[derive(Debug, Clone)]
pub struct PathMapper {
    watch_root: PathBuf,
    mirror_root: PathBuf,
}

impl PathMapper {
    pub fn new(watch_root: impl Into<PathBuf>, mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            watch_root: watch_root.into(),
            mirror_root: mirror_root.into(),
        }
    }

    pub fn watch_root(&self) -> &Path {
        &self.watch_root
    }

    pub fn mirror_root(&self) -> &Path {
        &self.mirror_root
    }

    /// Re-root `path` under the other tree.
    ///
    /// The watched root is tried first. The mirror root is a fallback for
    /// events raised on the mirror itself, which happens when the mirror is
    /// nested inside the watched tree.
    pub fn mirror_of(&self, path: &Path) -> Option<PathBuf> {
        // A mirror nested in the watched root must win over the watched root
        if self.mirror_root.starts_with(&self.watch_root) {
            if let Ok(rel) = path.strip_prefix(&self.mirror_root) {
                return Some(self.watch_root.join(rel));
            }
        }
        if let Ok(rel) = path.strip_prefix(&self.watch_root) {
            return Some(self.mirror_root.join(rel));
        }
        if let Ok(rel) = path.strip_prefix(&self.mirror_root) {
            return Some(self.watch_root.join(rel));
        }
        None
    }

    /// Whether `path` lies inside the mirror tree.
    pub fn is_in_mirror(&self, path: &Path) -> bool {
        path.starts_with(&self.mirror_root)
    }
}
