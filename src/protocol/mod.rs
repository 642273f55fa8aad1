//! Protocol document model, classification and dispatch.

pub mod dispatch;
pub mod document;
pub mod element;
pub mod handlers;
pub mod hierarchy;
pub mod profile;
pub mod publisher;
pub mod registry;
pub mod sample;
pub mod scheduler;

pub use dispatch::{EngineBuilder, EventOutcome, ProtocolDispatchEngine, ScanReport};
pub use document::{ProtocolDocument, SharedDocument};
pub use element::{ElementType, TypeGuesser};
pub use handlers::{DispatchContext, ElementHandler};
pub use profile::InstrumentProfile;
pub use publisher::{DocumentPublisher, NullPublisher, PublishOutcome, SnapshotPublisher};
pub use registry::{ContentProbe, DispatchRegistry, RegistryEntry};
pub use sample::{Resource, Sample};
pub use scheduler::{Decision, SkipReason, UpdateScheduler};
