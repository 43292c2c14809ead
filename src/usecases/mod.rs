//! Application use cases. Orchestrate domain logic via ports.

pub mod engine;
pub mod events;
pub mod gate;
pub mod remote_store;
pub mod restore;
pub mod scheduler;
pub mod settings_store;
pub mod snapshot;
pub mod status_tracker;

pub use engine::{BackupEngine, EngineOptions};
pub use events::{EventBus, Subscription};
pub use gate::LiveStateGate;
pub use remote_store::{ListCursor, RemoteStore, RetryPolicy};
pub use restore::{RestoreController, RestorePlan};
pub use scheduler::{BackupScheduler, SchedulerState, TriggerSource};
pub use settings_store::SettingsStore;
pub use snapshot::{Manifest, SnapshotProducer};
pub use status_tracker::BackupStatusTracker;
