//! The consuming thread.
//!
//! One runner owns one engine and drains one queue, so handlers for a
//! watched root never run concurrently. Stopping lets the event in hand
//! finish; whatever is still queued is discarded and counted, since the
//! pre-sync of the next start re-derives that state from disk.

use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use notify::RecommendedWatcher;

use crate::error::EngineResult;
use crate::protocol::dispatch::ProtocolDispatchEngine;
use crate::watcher::source::{EventTranslator, NotifySource, RawEvent};

/// Asks a running [`ProtocolWatcher`] to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        // Full or disconnected both mean a stop is already under way
        let _ = self.tx.try_send(());
    }
}

/// Counts from one [`ProtocolWatcher::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Pipeline events handled, after rename pairing.
    pub processed: usize,
    /// Raw notifications still queued at stop.
    pub discarded: usize,
}

pub struct ProtocolWatcher {
    engine: ProtocolDispatchEngine,
    rx: Receiver<RawEvent>,
    stop_rx: Receiver<()>,
    translator: EventTranslator,
    idle_flush: Duration,
    presync: bool,
    _watcher: Option<RecommendedWatcher>,
}

impl ProtocolWatcher {
    /// Consume an existing queue of raw notifications.
    pub fn new(engine: ProtocolDispatchEngine, rx: Receiver<RawEvent>) -> (Self, StopHandle) {
        let (stop_tx, stop_rx) = bounded(1);
        let watcher = Self {
            engine,
            rx,
            stop_rx,
            translator: EventTranslator::new(),
            idle_flush: Duration::from_secs(2),
            presync: true,
            _watcher: None,
        };
        (watcher, StopHandle { tx: stop_tx })
    }

    /// Watch `root` recursively. Watching starts immediately, so nothing
    /// written during the pre-sync is missed.
    pub fn watch(engine: ProtocolDispatchEngine, root: &Path) -> EngineResult<(Self, StopHandle)> {
        let (guard, rx) = NotifySource::watch(root)?.into_parts();
        let (mut watcher, stop) = Self::new(engine, rx);
        watcher._watcher = Some(guard);
        Ok((watcher, stop))
    }

    /// Queue silence after which held back updates are re-checked.
    pub fn idle_flush(mut self, idle: Duration) -> Self {
        self.idle_flush = idle;
        self
    }

    /// Mirror and replay existing content before the live loop.
    pub fn presync(mut self, yes: bool) -> Self {
        self.presync = yes;
        self
    }

    pub fn engine(&self) -> &ProtocolDispatchEngine {
        &self.engine
    }

    /// Process events until stopped or the source disconnects.
    ///
    /// Returns the engine so callers can inspect the final document.
    pub fn run(mut self) -> (ProtocolDispatchEngine, RunReport) {
        if self.presync {
            self.synchronize_existing();
        }

        crate::log_event!("watcher", "started");
        let mut report = RunReport::default();

        loop {
            if self.stop_rx.try_recv().is_ok() {
                break;
            }

            select! {
                recv(self.stop_rx) -> _ => break,
                recv(self.rx) -> message => match message {
                    Ok(Ok(raw)) => {
                        for event in self.translator.translate(raw) {
                            self.engine.process(event, self.rx.len());
                            report.processed += 1;
                        }
                    }
                    Ok(Err(e)) => tracing::error!("[watcher] file watch error: {e}"),
                    Err(_) => {
                        crate::debug_event!("watcher", "source closed");
                        break;
                    }
                },
                default(self.idle_flush) => {
                    if let Some(event) = self.translator.flush() {
                        self.engine.process(event, self.rx.len());
                        report.processed += 1;
                    }
                    self.engine.flush_idle(self.rx.len());
                }
            }
        }

        report.discarded = self.rx.try_iter().count();
        if let Some(event) = self.translator.flush() {
            crate::debug_event!("watcher", "dropped unpaired rename", "{event}");
        }
        crate::log_event!(
            "watcher",
            "stopped",
            "{} events processed, {} discarded",
            report.processed,
            report.discarded
        );

        (self.engine, report)
    }

    fn synchronize_existing(&mut self) {
        if let Some(mirror) = self.engine.mirror() {
            if let Err(e) = mirror.process_all_existing() {
                tracing::error!("[mirror] pre-sync failed: {e}");
            }
        }
        self.engine.process_existing();
    }
}
