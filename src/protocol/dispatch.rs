//! The per-event pipeline.
//!
//! Each event walks `annotate -> scope -> coalesce -> mirror -> filter ->
//! classify -> handle -> schedule`. Failures are caught and logged here with the event
//! kind and path; they never reach the caller, so one bad file cannot stop
//! the stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::clock::{self, Clock};
use crate::config::Settings;
use crate::error::{ConfigError, EngineResult};
use crate::mirror::MirrorSynchronizer;
use crate::protocol::document::{ProtocolDocument, SharedDocument};
use crate::protocol::handlers::DispatchContext;
use crate::protocol::profile;
use crate::protocol::publisher::{DocumentPublisher, NullPublisher, PublishOutcome, SnapshotPublisher};
use crate::protocol::registry::DispatchRegistry;
use crate::protocol::scheduler::{Decision, UpdateScheduler};
use crate::watcher::coalescer::{Coalesce, EventCoalescer};
use crate::watcher::event::{EventKind, FileSystemEvent, PathMapper};
use crate::watcher::filter::EventFilter;
use crate::watcher::retry::RetryPolicy;
use crate::watcher::stability::{Stability, StabilityWaiter};

/// How far one event got through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Dropped as the modify twin of the previous create.
    Coalesced,
    /// Rejected by the classification filter.
    Filtered,
    /// Reached the handlers.
    Dispatched,
    /// Mirroring or dispatch failed; the failure was logged.
    Failed,
}

/// Counts from [`ProtocolDispatchEngine::process_existing`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub files: usize,
    pub failed: usize,
}

enum FileOp {
    Create,
    Modify,
}

pub struct ProtocolDispatchEngine {
    document: SharedDocument,
    registry: DispatchRegistry,
    filter: EventFilter,
    filter_settings: FilterSettings,
    mapper: Option<PathMapper>,
    mirror: Option<MirrorSynchronizer>,
    coalescer: EventCoalescer,
    waiter: StabilityWaiter,
    retry: RetryPolicy,
    scheduler: UpdateScheduler,
    publisher: Arc<dyn DocumentPublisher>,
    clock: Arc<dyn Clock>,
    changed: bool,
}

/// Inputs needed to rebuild the classification filter after the registry
/// changes.
#[derive(Debug, Clone, Default)]
struct FilterSettings {
    excludes: Vec<String>,
    case_sensitive: bool,
    ignore_directories: bool,
}

impl FilterSettings {
    fn build(&self, registry: &DispatchRegistry) -> EngineResult<EventFilter> {
        EventFilter::builder()
            .include(registry.include_patterns())
            .exclude(self.excludes.iter())
            .case_sensitive(self.case_sensitive)
            .ignore_directories(self.ignore_directories)
            .build()
    }
}

impl ProtocolDispatchEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine wired from settings: profile registry, optional mirror and a
    /// snapshot publisher when a snapshot path is configured.
    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        settings.validate()?;
        let root = settings.watch_root()?.to_path_buf();

        let title = settings.protocol.title.clone().unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "protocol".to_string())
        });
        let mut document = ProtocolDocument::new(title, &root);
        document.read_only = settings.protocol.read_only;

        let publisher: Arc<dyn DocumentPublisher> = match &settings.protocol.snapshot_path {
            Some(path) => Arc::new(SnapshotPublisher::new(path)),
            None => Arc::new(NullPublisher),
        };

        let mut builder = Self::builder()
            .document(document.shared())
            .registry(profile::registry_from_settings(settings)?)
            .excludes(settings.watch.mirror_excludes.clone())
            .case_sensitive(settings.watch.case_sensitive)
            .ignore_directories(settings.watch.ignore_directories)
            .retry(settings.retry.dispatch_policy())
            .scheduler(UpdateScheduler::from_config(&settings.scheduler, Arc::clone(&clock)))
            .waiter(StabilityWaiter::new(Arc::clone(&clock), settings.stability.max_polls))
            .publisher(publisher)
            .clock(Arc::clone(&clock));

        if settings.watch.mirror_enabled {
            builder = builder.mirror(MirrorSynchronizer::from_settings(settings, clock)?);
        }
        builder.build()
    }

    pub fn document(&self) -> SharedDocument {
        Arc::clone(&self.document)
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    pub fn mirror(&self) -> Option<&MirrorSynchronizer> {
        self.mirror.as_ref()
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    /// Whether the last processed event changed the document.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Edit the registry at runtime. The classification filter follows.
    pub fn update_registry<F>(&mut self, edit: F) -> EngineResult<()>
    where
        F: FnOnce(&mut DispatchRegistry) -> EngineResult<()>,
    {
        let mut registry = self.registry.clone();
        edit(&mut registry)?;
        self.filter = self.filter_settings.build(&registry)?;
        self.registry = registry;
        Ok(())
    }

    /// Run one event through the pipeline.
    pub fn process(&mut self, mut event: FileSystemEvent, queue_depth: usize) -> EventOutcome {
        self.changed = false;
        if let Some(mapper) = &self.mapper {
            event.annotate(mapper);
        }

        let outcome = self.run_pipeline(&event);
        self.schedule(queue_depth);
        outcome
    }

    fn run_pipeline(&mut self, event: &FileSystemEvent) -> EventOutcome {
        // Out of scope events must not become the coalescer's previous event
        if !self.in_scope(event) {
            crate::debug_event!("dispatch", "out of scope", "{event}");
            return EventOutcome::Filtered;
        }

        if self.coalescer.observe(event) == Coalesce::Suppress {
            crate::debug_event!("dispatch", "coalesced", "{event}");
            return EventOutcome::Coalesced;
        }

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.handle(event) {
                tracing::error!(
                    "[mirror] dropping {} event for {}: {e}",
                    event.kind,
                    event.src_path.display()
                );
                return EventOutcome::Failed;
            }
        }

        if !self.filter.should_dispatch(event) && !self.names_sample(event) {
            crate::debug_event!("dispatch", "filtered", "{event}");
            return EventOutcome::Filtered;
        }

        match self.dispatch(event) {
            Ok(()) => EventOutcome::Dispatched,
            Err(e) => {
                tracing::error!(
                    "[dispatch] dropping {} event for {}: {e}",
                    event.kind,
                    event.src_path.display()
                );
                EventOutcome::Failed
            }
        }
    }

    /// The broadest filter the event has to pass: the mirror's when
    /// mirroring, the classification filter otherwise.
    fn in_scope(&self, event: &FileSystemEvent) -> bool {
        match &self.mirror {
            Some(mirror) => mirror.filter().should_dispatch(event),
            None => self.filter.should_dispatch(event) || self.names_sample(event),
        }
    }

    /// A deletion of a known sample directory, possibly reported as a file.
    fn names_sample(&self, event: &FileSystemEvent) -> bool {
        event.kind == EventKind::Deleted
            && self
                .document
                .lock()
                .sample_for_directory(&event.src_path)
                .is_some()
    }

    fn dispatch(&mut self, event: &FileSystemEvent) -> EngineResult<()> {
        let Some((created, deleted)) = event.split_move() else {
            return self.dispatch_one(event);
        };

        // Create at the destination first, then delete at the source. The
        // source is gone either way, so a failed create still deletes.
        let created_result = self.dispatch_one(&created);
        if created_result.is_ok() && created.is_directory {
            self.replay_directory(&created.src_path);
        }
        let deleted_result = self.dispatch_one(&deleted);

        match (created_result, deleted_result) {
            (Err(e), Err(also)) => {
                tracing::error!("[dispatch] delete half of {event} failed as well: {also}");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Dispatch every file below a directory that moved into place.
    fn replay_directory(&mut self, dir: &Path) {
        for path in sorted_files(dir, self.excluded_root()) {
            let event = FileSystemEvent::created(path, false);
            if !self.filter.should_dispatch(&event) {
                continue;
            }
            if let Err(e) = self.dispatch_one(&event) {
                tracing::error!("[dispatch] failed to replay {}: {e}", event.src_path.display());
            }
        }
    }

    /// Route one event with retries. `touched` outlives the attempts, so a
    /// mutation made by an attempt that later failed still schedules a push.
    fn dispatch_one(&mut self, event: &FileSystemEvent) -> EngineResult<()> {
        let what = format!("dispatching {event}");
        let mut touched = false;
        let result = self
            .retry
            .run(self.clock.as_ref(), &what, |_| self.route(event, &mut touched));
        self.changed |= touched;
        result
    }

    fn route(&self, event: &FileSystemEvent, touched: &mut bool) -> EngineResult<()> {
        match event.kind {
            EventKind::Created | EventKind::Modified if event.is_directory => Ok(()),
            EventKind::Created => self.route_file(&event.src_path, FileOp::Create, touched),
            EventKind::Modified => self.route_file(&event.src_path, FileOp::Modify, touched),
            EventKind::Deleted => self.route_delete(&event.src_path, event.is_directory, touched),
            EventKind::Moved => Ok(()),
        }
    }

    fn route_file(&self, path: &Path, op: FileOp, touched: &mut bool) -> EngineResult<()> {
        if let Stability::Vanished = self.waiter.wait_until_stable(path) {
            return Ok(());
        }

        let Some(kind) = self.registry.effective_type(path)? else {
            crate::debug_event!("dispatch", "unclassified", "{}", path.display());
            return Ok(());
        };
        let Some(handler) = self.registry.handler(kind) else {
            return Ok(());
        };

        let mut document = self.document.lock();
        let previous = document.resource(path).map(|r| r.kind);
        let mut ctx = DispatchContext::new(&mut document, self.mirror.as_ref());

        let result = match previous {
            // Same name, different content: re-attach under the new type
            Some(old) if old != kind => {
                crate::log_event!("dispatch", "type changed", "{} {old} -> {kind}", path.display());
                let detached = match self.registry.handler(old) {
                    Some(old_handler) => old_handler.on_delete(&mut ctx, path, old),
                    None => Ok(()),
                };
                detached.and_then(|()| handler.on_create(&mut ctx, path, kind))
            }
            _ => match op {
                FileOp::Create => handler.on_create(&mut ctx, path, kind),
                FileOp::Modify => handler.on_modify(&mut ctx, path, kind),
            },
        };

        *touched |= ctx.changed();
        result
    }

    fn route_delete(&self, path: &Path, is_directory: bool, touched: &mut bool) -> EngineResult<()> {
        let mut document = self.document.lock();

        // Deleted directories are often reported as files; a path naming a
        // known sample takes the whole subtree with it
        if document.resource(path).is_none() {
            if let Some(name) = document.sample_for_directory(path) {
                let dropped = document.remove_sample_subtree(&name)?;
                *touched = true;
                crate::log_event!("dispatch", "sample removed", "{name} ({dropped} resources)");
                return Ok(());
            }
        }
        if is_directory {
            return Ok(());
        }

        let kind = document
            .resource(path)
            .map(|r| r.kind)
            .or_else(|| self.registry.classify(path));
        let Some(kind) = kind else {
            return Ok(());
        };
        let Some(handler) = self.registry.handler(kind) else {
            return Ok(());
        };

        let mut ctx = DispatchContext::new(&mut document, self.mirror.as_ref());
        let result = handler.on_delete(&mut ctx, path, kind);
        *touched |= ctx.changed();
        result
    }

    fn excluded_root(&self) -> Option<PathBuf> {
        self.mapper.as_ref().map(|m| m.mirror_root().to_path_buf())
    }

    fn schedule(&mut self, queue_depth: usize) {
        if let Decision::Push = self.scheduler.decide(self.changed, queue_depth) {
            self.push(true);
        }
    }

    /// Push a held back change if the queue has gone quiet.
    pub fn flush_idle(&mut self, queue_depth: usize) {
        if let Decision::Push = self.scheduler.flush_pending(queue_depth) {
            self.push(true);
        }
    }

    /// Post the document now, bypassing the scheduler's checks.
    pub fn push(&mut self, skip_attachments: bool) {
        let snapshot = self.document.lock().snapshot();
        match self.publisher.post(&snapshot, skip_attachments) {
            Ok(PublishOutcome::Published) => {
                self.scheduler.record_push();
                crate::log_event!(
                    "scheduler",
                    "pushed",
                    "{} samples via {}",
                    snapshot.samples.len(),
                    self.publisher.name()
                );
            }
            Ok(PublishOutcome::ReadOnly) => {
                self.scheduler.record_push();
                self.document.lock().read_only = true;
                tracing::warn!("[scheduler] remote protocol is read-only, further changes are refused");
            }
            Err(e) => tracing::error!("[scheduler] push via {} failed: {e}", self.publisher.name()),
        }
    }

    /// Replay every file already in the watched tree as a create.
    ///
    /// Runs in sorted order with pushes suppressed, then posts once with
    /// attachments included. The mirror is not touched; run its own
    /// pre-sync first.
    pub fn process_existing(&mut self) -> ScanReport {
        let root = self.document.lock().root.clone();
        let mut report = ScanReport::default();

        self.scheduler.suppress();
        self.coalescer.reset();
        for path in sorted_files(&root, self.excluded_root()) {
            let mut event = FileSystemEvent::created(path, false);
            if let Some(mapper) = &self.mapper {
                event.annotate(mapper);
            }
            if !self.filter.should_dispatch(&event) {
                continue;
            }

            report.files += 1;
            if let Err(e) = self.dispatch_one(&event) {
                report.failed += 1;
                tracing::error!(
                    "[dispatch] pre-sync failed for {}: {e}",
                    event.src_path.display()
                );
            }
        }
        self.scheduler.resume();

        crate::log_event!(
            "dispatch",
            "pre-sync complete",
            "{} files, {} failed",
            report.files,
            report.failed
        );
        self.push(false);
        report
    }
}

/// Regular files under `dir`, sorted, skipping the mirror when nested.
fn sorted_files(dir: &Path, skip: Option<PathBuf>) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| skip.as_deref().is_none_or(|s| !entry.path().starts_with(s)))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("[dispatch] skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Builder for [`ProtocolDispatchEngine`].
pub struct EngineBuilder {
    document: Option<SharedDocument>,
    registry: Option<DispatchRegistry>,
    mirror: Option<MirrorSynchronizer>,
    publisher: Option<Arc<dyn DocumentPublisher>>,
    scheduler: Option<UpdateScheduler>,
    waiter: Option<StabilityWaiter>,
    retry: RetryPolicy,
    clock: Option<Arc<dyn Clock>>,
    filter: FilterSettings,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            document: None,
            registry: None,
            mirror: None,
            publisher: None,
            scheduler: None,
            waiter: None,
            retry: RetryPolicy::once(),
            clock: None,
            filter: FilterSettings::default(),
        }
    }

    pub fn document(mut self, document: SharedDocument) -> Self {
        self.document = Some(document);
        self
    }

    pub fn registry(mut self, registry: DispatchRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn mirror(mut self, mirror: MirrorSynchronizer) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn DocumentPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn scheduler(mut self, scheduler: UpdateScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn waiter(mut self, waiter: StabilityWaiter) -> Self {
        self.waiter = Some(waiter);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Patterns excluded from classification on top of the registry's.
    pub fn excludes(mut self, patterns: Vec<String>) -> Self {
        self.filter.excludes = patterns;
        self
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.filter.case_sensitive = yes;
        self
    }

    pub fn ignore_directories(mut self, yes: bool) -> Self {
        self.filter.ignore_directories = yes;
        self
    }

    pub fn build(self) -> EngineResult<ProtocolDispatchEngine> {
        let document = self.document.ok_or_else(|| ConfigError::MissingParameter {
            parameter: "document".to_string(),
        })?;
        let registry = self.registry.ok_or_else(|| ConfigError::MissingParameter {
            parameter: "registry".to_string(),
        })?;

        let clock = self.clock.unwrap_or_else(clock::system);
        let filter = self.filter.build(&registry)?;
        let mapper = self.mirror.as_ref().map(|m| m.mapper().clone());
        let scheduler = self.scheduler.unwrap_or_else(|| {
            UpdateScheduler::new(Arc::clone(&clock), std::time::Duration::ZERO, 1)
        });
        let waiter = self
            .waiter
            .unwrap_or_else(|| StabilityWaiter::new(Arc::clone(&clock), 1));

        Ok(ProtocolDispatchEngine {
            document,
            registry,
            filter,
            filter_settings: self.filter,
            mapper,
            mirror: self.mirror,
            coalescer: EventCoalescer::new(),
            waiter,
            retry: self.retry,
            scheduler,
            publisher: self.publisher.unwrap_or_else(|| Arc::new(NullPublisher)),
            clock,
            changed: false,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
