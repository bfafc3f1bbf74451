//! offline-sync: Offline-first document synchronization using Loro CRDTs.
//!
//! This crate provides the core functionality for:
//! - A durable, capacity-bounded queue of pending document updates
//! - Merging and compacting queued updates with Loro
//! - Draining the queue through a transport with backoff and partial-failure recovery
//! - Tracking local and remote editing sessions
//! - Storage health reporting and event channels for a UI layer

pub mod config;
pub mod events;
pub mod health;
pub mod merge;
pub mod operation;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod sessions;
pub mod storage;
pub mod transport;

pub use config::{
    ConfigError, EngineConfig, ExecutionStrategy, HealthConfig, MergeConfig, QueueConfig,
    QueueLimits, SessionConfig, SyncConfig,
};
pub use events::{
    ActivitySource, EventBus, EventLog, SessionActivity, StorageEvent, StorageEventKind,
    Subscription,
};
pub use health::{CompactionReport, HealthLevel, StorageHealthMonitor};
pub use merge::{DocMergeResult, DocUpdates, ExecutionPath, MergeEngine, MergeError, MergeExecutor};
pub use operation::{OfflineOperation, OperationError, SpaceType};
pub use orchestrator::{DrainOutcome, DrainReport, SkipReason, SyncError, SyncOrchestrator, SyncStatus};
pub use queue::{BackendKind, OperationQueue, QueueError, StorageStatus};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use sessions::{SessionInfo, SessionRegistry};
pub use storage::{FileBackend, MemoryBackend, QueueBackend, StorageError, StoredEntry};
pub use transport::{MockFailure, MockTransport, PushAck, PushUpdateRequest, SyncTransport, TransportError};
