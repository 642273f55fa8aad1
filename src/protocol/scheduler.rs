//! Debounced pushes to the external document store.
//!
//! The scheduler is a coalescing rate limiter: changes mark the document
//! pending, and a pending document is pushed by the first check that finds
//! the queue nearly drained and the minimum interval elapsed. A burst of
//! changes therefore produces at most one push per interval.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::SchedulerConfig;

/// Why a check did not push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing changed since the last push.
    Unchanged,
    /// Pushes are held during the bulk pre-sync.
    Suppressed,
    /// More events are queued right behind this one.
    QueueBusy { depth: usize },
    /// The previous push is too recent.
    TooRecent { remaining: Duration },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unchanged => f.write_str("no changes"),
            SkipReason::Suppressed => f.write_str("updates suppressed"),
            SkipReason::QueueBusy { depth } => write!(f, "queue not empty ({depth} pending)"),
            SkipReason::TooRecent { remaining } => {
                write!(f, "last update too recent ({remaining:?} to go)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Push,
    Skip(SkipReason),
}

pub struct UpdateScheduler {
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    queue_threshold: usize,
    last_push: Option<Instant>,
    pending: bool,
    suppressed: bool,
}

impl fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("min_interval", &self.min_interval)
            .field("queue_threshold", &self.queue_threshold)
            .field("pending", &self.pending)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl UpdateScheduler {
    pub fn new(clock: Arc<dyn Clock>, min_interval: Duration, queue_threshold: usize) -> Self {
        Self {
            clock,
            min_interval,
            queue_threshold: queue_threshold.max(1),
            last_push: None,
            pending: false,
            suppressed: false,
        }
    }

    pub fn from_config(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, config.min_interval(), config.queue_threshold)
    }

    /// Decide after one event whether the document should be pushed.
    ///
    /// `changed` is the event's document-changed flag; `queue_depth` the
    /// number of events still waiting.
    pub fn decide(&mut self, changed: bool, queue_depth: usize) -> Decision {
        self.pending |= changed;

        let decision = self.check(queue_depth);
        if let Decision::Skip(reason) = decision {
            if reason != SkipReason::Unchanged {
                crate::debug_event!("scheduler", "held back", "{reason}");
            }
        }
        decision
    }

    /// Re-check a held back change while the queue is idle.
    pub fn flush_pending(&mut self, queue_depth: usize) -> Decision {
        self.decide(false, queue_depth)
    }

    fn check(&self, queue_depth: usize) -> Decision {
        if !self.pending {
            return Decision::Skip(SkipReason::Unchanged);
        }
        if self.suppressed {
            return Decision::Skip(SkipReason::Suppressed);
        }
        if queue_depth >= self.queue_threshold {
            return Decision::Skip(SkipReason::QueueBusy { depth: queue_depth });
        }
        if let Some(last) = self.last_push {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < self.min_interval {
                return Decision::Skip(SkipReason::TooRecent {
                    remaining: self.min_interval - elapsed,
                });
            }
        }
        Decision::Push
    }

    /// Record a successful push.
    pub fn record_push(&mut self) {
        self.last_push = Some(self.clock.now());
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    pub fn resume(&mut self) {
        self.suppressed = false;
    }

    pub fn last_push(&self) -> Option<Instant> {
        self.last_push
    }
}
