//! Suppression of the modify notification that follows a create.
//!
//! Instrument software commonly fires create and modify back to back for a
//! single write. Only the immediately preceding event is compared, so a burst
//! of three or more redundant notifications is only partially coalesced.

use crate::watcher::event::{EventKind, FileSystemEvent};

/// Outcome of [`EventCoalescer::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesce {
    Dispatch,
    Suppress,
}

/// Remembers the previous event to coalesce create+modify pairs.
#[derive(Debug, Default)]
pub struct EventCoalescer {
    previous: Option<(EventKind, std::path::PathBuf)>,
}

impl EventCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `event` is redundant and remember it as the previous one.
    ///
    /// Mirror annotations are not part of the comparison; a suppressed event
    /// keeps the annotations it already carries.
    pub fn observe(&mut self, event: &FileSystemEvent) -> Coalesce {
        let decision = match &self.previous {
            Some((EventKind::Created, prev_path))
                if event.kind == EventKind::Modified && *prev_path == event.src_path =>
            {
                Coalesce::Suppress
            }
            _ => Coalesce::Dispatch,
        };

        self.previous = Some((event.kind, event.src_path.clone()));
        decision
    }

    /// Forget the previous event (used after a bulk pre-sync).
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::PathMapper;
    use std::path::PathBuf;

    #[test]
    fn test_modify_after_create_is_suppressed() {
        let mut coalescer = EventCoalescer::new();
        let mapper = PathMapper::new("/root", "/mirror");

        let created = FileSystemEvent::created("/root/S1/img.tif", false);
        let mut modified = FileSystemEvent::modified("/root/S1/img.tif", false);
        modified.annotate(&mapper);

        assert_eq!(coalescer.observe(&created), Coalesce::Dispatch);
        assert_eq!(coalescer.observe(&modified), Coalesce::Suppress);
        assert_eq!(modified.mirror_path, Some(PathBuf::from("/mirror/S1/img.tif")));
    }

    #[test]
    fn test_modify_of_other_path_is_dispatched() {
        let mut coalescer = EventCoalescer::new();
        coalescer.observe(&FileSystemEvent::created("/root/S1/a.tif", false));
        assert_eq!(
            coalescer.observe(&FileSystemEvent::modified("/root/S1/b.tif", false)),
            Coalesce::Dispatch
        );
    }

    #[test]
    fn test_only_immediately_previous_event_counts() {
        let mut coalescer = EventCoalescer::new();
        let created = FileSystemEvent::created("/root/S1/img.tif", false);
        let modified = FileSystemEvent::modified("/root/S1/img.tif", false);

        coalescer.observe(&created);
        assert_eq!(coalescer.observe(&modified), Coalesce::Suppress);
        // A second modify follows a modify, not a create
        assert_eq!(coalescer.observe(&modified), Coalesce::Dispatch);
    }

    #[test]
    fn test_reset_forgets_previous() {
        let mut coalescer = EventCoalescer::new();
        coalescer.observe(&FileSystemEvent::created("/root/a.tif", false));
        coalescer.reset();
        assert_eq!(
            coalescer.observe(&FileSystemEvent::modified("/root/a.tif", false)),
            Coalesce::Dispatch
        );
    }
}
