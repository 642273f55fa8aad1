pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod protocol;
pub mod watcher;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use error::{ConfigError, EngineError, EngineResult};
pub use mirror::{MirrorSynchronizer, SyncReport};
pub use protocol::{
    DispatchRegistry, ElementType, EventOutcome, InstrumentProfile, ProtocolDispatchEngine,
    ProtocolDocument, UpdateScheduler,
};
pub use watcher::{EventFilter, EventKind, FileSystemEvent, ProtocolWatcher, StopHandle};
