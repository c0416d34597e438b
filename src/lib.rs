pub mod alert;
pub mod bbox;
pub mod config;
pub mod coordinator;
pub mod detection;
pub mod detector;
pub mod error;
pub mod events;
pub mod frame;
pub mod math;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod rolling_avg;
pub mod source;
pub mod store;
pub mod stream;
pub mod tracker;
pub mod worker;

mod circular_queue;
mod track;

pub use alert::{AlertObserver, AlertScheduler, AlertState, EvaluationReport, PendingAlert};
pub use config::Config;
pub use coordinator::TrackingCoordinator;
pub use detection::Detection;
pub use detector::{Detector, FilteredDetector};
pub use error::{Error, Result};
pub use events::{EventBus, MonitorEvent};
pub use frame::Frame;
pub use pipeline::{Pipeline, PipelineHandle};
pub use registry::SourceRegistry;
pub use resolver::{ExternalResolver, IdentityResolver, NullResolver};
pub use source::{FrameSource, SourceDescriptor, SourceKind};
pub use store::{MemoryStore, PresenceStore};
pub use stream::StreamBuffer;
pub use track::{IdentityState, TrackedIdentity, TrackingId};
pub use tracker::{IdAllocator, IdentityTracker, TrackerUpdate};
