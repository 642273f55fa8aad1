//! Event intake for one watched root.
//!
//! # Architecture
//!
//! ```text
//! notify thread ──► FIFO (crossbeam) ──► ProtocolWatcher (one thread)
//!                                           │ EventTranslator
//!                                           ▼
//!                                  ProtocolDispatchEngine
//!            annotate ─► coalesce ─► mirror ─► filter ─► classify ─► handle
//!                                           │
//!                                     UpdateScheduler
//! ```

pub mod coalescer;
pub mod event;
pub mod filter;
pub mod retry;
pub mod runner;
pub mod source;
pub mod stability;

pub use coalescer::{Coalesce, EventCoalescer};
pub use event::{EventKind, FileSystemEvent, PathMapper};
pub use filter::{EventFilter, EventFilterBuilder};
pub use retry::RetryPolicy;
pub use runner::{ProtocolWatcher, RunReport, StopHandle};
pub use source::{EventTranslator, NotifySource, RawEvent};
pub use stability::{Stability, StabilityWaiter, poll_delay};
