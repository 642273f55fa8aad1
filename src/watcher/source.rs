//! `notify` adapter.
//!
//! Raw notifications are queued as they arrive on a FIFO channel; the
//! consuming thread translates them into [`FileSystemEvent`]s. Rename halves
//! are paired into a single move, by tracker id when the platform provides
//! one and by adjacency otherwise. A half that finds no partner degrades to
//! a delete (source side) or a create (destination side). inotify follows
//! a paired From/To with a `Both` summary of the same rename; that summary
//! is dropped so each rename is dispatched once.

use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::EngineResult;
use crate::watcher::event::FileSystemEvent;

/// What the notification thread puts on the queue.
pub type RawEvent = notify::Result<Event>;

/// Recursive watch on one root feeding an unbounded FIFO.
pub struct NotifySource {
    _watcher: RecommendedWatcher,
    rx: Receiver<RawEvent>,
}

impl NotifySource {
    pub fn watch(root: &Path) -> EngineResult<Self> {
        let (tx, rx) = unbounded();
        let mut watcher = notify::recommended_watcher(forward(tx))?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        crate::log_event!("watcher", "watching", "{}", root.display());

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Split into the watcher guard and the receiving end.
    pub fn into_parts(self) -> (RecommendedWatcher, Receiver<RawEvent>) {
        (self._watcher, self.rx)
    }
}

fn forward(tx: Sender<RawEvent>) -> impl FnMut(RawEvent) + Send + 'static {
    move |res| {
        // The receiver only goes away at shutdown
        let _ = tx.send(res);
    }
}

/// Pending rename-from half.
#[derive(Debug, Clone)]
struct RenameFrom {
    tracker: Option<usize>,
    path: PathBuf,
    is_directory: bool,
}

/// A rename already released from its From/To halves.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PairedRename {
    tracker: Option<usize>,
    from: PathBuf,
    to: PathBuf,
}

impl PairedRename {
    fn summarized_by(&self, tracker: Option<usize>, paths: &[PathBuf]) -> bool {
        let same_tracker = tracker.is_none() || self.tracker.is_none() || self.tracker == tracker;
        same_tracker && paths.len() == 2 && paths[0] == self.from && paths[1] == self.to
    }
}

/// Turns raw notifications into pipeline events.
#[derive(Debug, Default)]
pub struct EventTranslator {
    pending: Option<RenameFrom>,
    paired: Option<PairedRename>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one notification, possibly releasing an unpaired rename.
    pub fn translate(&mut self, event: Event) -> Vec<FileSystemEvent> {
        let mut out = Vec::new();
        let tracker = event.attrs.tracker();
        let paired = self.paired.take();

        match event.kind {
            NotifyKind::Modify(ModifyKind::Name(RenameMode::Both))
                if paired
                    .as_ref()
                    .is_some_and(|p| p.summarized_by(tracker, &event.paths)) =>
            {
                crate::debug_event!("watcher", "rename summary dropped", "{:?}", event.paths);
            }
            NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                out.extend(self.flush());
                if let Some(path) = event.paths.into_iter().next() {
                    // Already gone from disk, so the type is unknown; the
                    // engine resolves directories by sample name
                    self.pending = Some(RenameFrom {
                        tracker,
                        is_directory: false,
                        path,
                    });
                }
            }
            NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let Some(dest) = event.paths.into_iter().next() else {
                    return self.flush().into_iter().collect();
                };
                let is_directory = dest.is_dir();
                match self.pending.take() {
                    Some(from) if tracker.is_none() || from.tracker.is_none() || from.tracker == tracker => {
                        self.paired = Some(PairedRename {
                            tracker: from.tracker.or(tracker),
                            from: from.path.clone(),
                            to: dest.clone(),
                        });
                        out.push(FileSystemEvent::moved(from.path, dest, is_directory));
                    }
                    Some(from) => {
                        out.push(FileSystemEvent::deleted(from.path, from.is_directory));
                        out.push(FileSystemEvent::created(dest, is_directory));
                    }
                    None => out.push(FileSystemEvent::created(dest, is_directory)),
                }
            }
            kind => {
                out.extend(self.flush());
                out.extend(translate_plain(kind, event.paths));
            }
        }

        out
    }

    /// Release an unpaired rename-from as a deletion.
    pub fn flush(&mut self) -> Option<FileSystemEvent> {
        self.pending
            .take()
            .map(|from| FileSystemEvent::deleted(from.path, from.is_directory))
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

fn translate_plain(kind: NotifyKind, paths: Vec<PathBuf>) -> Vec<FileSystemEvent> {
    match kind {
        NotifyKind::Create(create) => paths
            .into_iter()
            .map(|path| {
                let is_directory = match create {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => path.is_dir(),
                };
                FileSystemEvent::created(path, is_directory)
            })
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => {
                    let is_directory = to.is_dir();
                    vec![FileSystemEvent::moved(from, to, is_directory)]
                }
                _ => Vec::new(),
            }
        }
        NotifyKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|path| {
                // Platforms without rename halves report both ends alike
                if path.exists() {
                    let is_directory = path.is_dir();
                    FileSystemEvent::created(path, is_directory)
                } else {
                    FileSystemEvent::deleted(path, false)
                }
            })
            .collect(),
        NotifyKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        NotifyKind::Modify(_) => paths
            .into_iter()
            .map(|path| {
                let is_directory = path.is_dir();
                FileSystemEvent::modified(path, is_directory)
            })
            .collect(),
        NotifyKind::Remove(remove) => paths
            .into_iter()
            .map(|path| FileSystemEvent::deleted(path, remove == RemoveKind::Folder))
            .collect(),
        NotifyKind::Access(_) | NotifyKind::Any | NotifyKind::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::EventKind;
    use notify::event::DataChange;

    fn rename(mode: RenameMode, path: &str, tracker: Option<usize>) -> Event {
        let mut event = Event::new(NotifyKind::Modify(ModifyKind::Name(mode))).add_path(PathBuf::from(path));
        if let Some(tracker) = tracker {
            event = event.set_tracker(tracker);
        }
        event
    }

    #[test]
    fn test_rename_halves_pair_by_tracker() {
        let mut translator = EventTranslator::new();

        assert!(translator.translate(rename(RenameMode::From, "/root/a.tmp", Some(7))).is_empty());
        let events = translator.translate(rename(RenameMode::To, "/root/a.tif", Some(7)));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Moved);
        assert_eq!(events[0].src_path, PathBuf::from("/root/a.tmp"));
        assert_eq!(events[0].dest_path, Some(PathBuf::from("/root/a.tif")));
        assert!(!translator.has_pending());
    }

    #[test]
    fn test_mismatched_tracker_degrades() {
        let mut translator = EventTranslator::new();

        translator.translate(rename(RenameMode::From, "/root/a.tif", Some(1)));
        let events = translator.translate(rename(RenameMode::To, "/root/b.tif", Some(2)));

        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Deleted, EventKind::Created]);
    }

    #[test]
    fn test_unpaired_from_flushes_as_delete() {
        let mut translator = EventTranslator::new();

        translator.translate(rename(RenameMode::From, "/root/gone.tif", None));
        let events = translator.translate(
            Event::new(NotifyKind::Create(CreateKind::File)).add_path(PathBuf::from("/root/new.tif")),
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], FileSystemEvent::deleted("/root/gone.tif", false));
        assert_eq!(events[1], FileSystemEvent::created("/root/new.tif", false));

        translator.translate(rename(RenameMode::From, "/root/out.tif", None));
        assert_eq!(
            translator.flush(),
            Some(FileSystemEvent::deleted("/root/out.tif", false))
        );
    }

    #[test]
    fn test_plain_kinds() {
        let mut translator = EventTranslator::new();

        let created = translator
            .translate(Event::new(NotifyKind::Create(CreateKind::Folder)).add_path(PathBuf::from("/root/S1")));
        assert_eq!(created, vec![FileSystemEvent::created("/root/S1", true)]);

        let modified = translator.translate(
            Event::new(NotifyKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path(PathBuf::from("/root/S1/a.tif")),
        );
        assert_eq!(modified, vec![FileSystemEvent::modified("/root/S1/a.tif", false)]);

        let removed = translator
            .translate(Event::new(NotifyKind::Remove(RemoveKind::Folder)).add_path(PathBuf::from("/root/S1")));
        assert_eq!(removed, vec![FileSystemEvent::deleted("/root/S1", true)]);

        let both = translator.translate(
            Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(PathBuf::from("/root/S1/a.tif"))
                .add_path(PathBuf::from("/root/S2/a.tif")),
        );
        assert_eq!(
            both,
            vec![FileSystemEvent::moved("/root/S1/a.tif", "/root/S2/a.tif", false)]
        );

        assert!(translator
            .translate(Event::new(NotifyKind::Access(notify::event::AccessKind::Any)))
            .is_empty());
    }

    #[test]
    fn test_inotify_rename_sequence_yields_one_move() {
        let mut translator = EventTranslator::new();
        let both = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/root/a.tmp"))
            .add_path(PathBuf::from("/root/a.tif"))
            .set_tracker(9);

        let mut events = translator.translate(rename(RenameMode::From, "/root/a.tmp", Some(9)));
        events.extend(translator.translate(rename(RenameMode::To, "/root/a.tif", Some(9))));
        events.extend(translator.translate(both.clone()));

        assert_eq!(
            events,
            vec![FileSystemEvent::moved("/root/a.tmp", "/root/a.tif", false)]
        );

        // A later summary on its own is a rename in its own right
        let again = translator.translate(both);
        assert_eq!(
            again,
            vec![FileSystemEvent::moved("/root/a.tmp", "/root/a.tif", false)]
        );
    }
}
