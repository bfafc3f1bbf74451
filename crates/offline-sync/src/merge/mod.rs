//! CRDT merge engine.
//!
//! Collapses opaque Loro update payloads into one equivalent payload. The
//! actual work happens behind a [`MergeExecutor`], selected once when the
//! engine is built:
//! - [`WorkerExecutor`] - dedicated thread, spawned lazily
//! - [`InlineExecutor`] - caller's thread
//!
//! When the worker cannot take a request the engine runs it inline instead
//! and records which path served the call.

mod crdt;
mod worker;

pub use crdt::{InlineExecutor, batch_merge, merge_updates, update_stats, validate};
pub use worker::WorkerExecutor;

use crate::config::{ExecutionStrategy, MergeConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Failed to decode update: {0}")]
    Decode(String),

    #[error("Failed to encode merged update: {0}")]
    Encode(String),

    #[error("Updates depend on changes that are not present: {0}")]
    MissingDependencies(String),

    #[error("Merge worker unavailable")]
    WorkerUnavailable,

    #[error("Executor returned an unexpected response")]
    UnexpectedResponse,
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Updates of one document to be merged together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdates {
    pub doc_id: String,
    pub updates: Vec<Vec<u8>>,
}

impl DocUpdates {
    pub fn new(doc_id: impl Into<String>, updates: Vec<Vec<u8>>) -> Self {
        Self {
            doc_id: doc_id.into(),
            updates,
        }
    }
}

/// Outcome for one document of a batch merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocMergeResult {
    pub doc_id: String,
    pub merged: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub valid: bool,
    pub size: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStats {
    pub size: usize,
    pub changes: usize,
    pub ops: usize,
}

/// Where a merge call actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPath {
    Worker,
    Inline,
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPath::Worker => f.write_str("worker"),
            ExecutionPath::Inline => f.write_str("inline"),
        }
    }
}

/// Request understood by every executor.
#[derive(Debug, Clone)]
pub enum MergeRequest {
    Merge(Vec<Vec<u8>>),
    Batch(Vec<DocUpdates>),
    Validate(Vec<u8>),
    Stats(Vec<u8>),
}

#[derive(Debug)]
pub enum MergeResponse {
    Merged(Vec<u8>),
    Batch(Vec<DocMergeResult>),
    Validation(Validation),
    Stats(UpdateStats),
}

/// Strategy for running merge requests.
///
/// Returning [`MergeError::WorkerUnavailable`] tells the engine to retry the
/// request inline; any other error is final.
#[async_trait]
pub trait MergeExecutor: Send + Sync {
    fn path(&self) -> ExecutionPath;

    /// Acquire whatever the executor needs. Called lazily by the engine.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Release the executor's resources. It may be re-initialized later.
    fn terminate(&self) {}

    async fn execute(&self, request: MergeRequest) -> Result<MergeResponse>;
}

/// Merge engine with a fixed execution strategy and inline fallback.
pub struct MergeEngine {
    executor: Box<dyn MergeExecutor>,
    last_path: Mutex<Option<ExecutionPath>>,
}

impl MergeEngine {
    pub fn new(config: &MergeConfig) -> Self {
        match config.strategy {
            ExecutionStrategy::Worker => Self::with_executor(WorkerExecutor::new()),
            ExecutionStrategy::Inline => Self::with_executor(InlineExecutor),
        }
    }

    pub fn with_executor(executor: impl MergeExecutor + 'static) -> Self {
        Self {
            executor: Box::new(executor),
            last_path: Mutex::new(None),
        }
    }

    /// Eagerly initialize the executor. Returns false if it is unavailable;
    /// calls will then run inline.
    pub fn init(&self) -> bool {
        match self.executor.init() {
            Ok(()) => true,
            Err(e) => {
                warn!("Merge executor failed to initialize: {}", e);
                false
            }
        }
    }

    pub fn terminate(&self) {
        self.executor.terminate();
    }

    /// Terminate the executor and forget the last path. The executor is
    /// re-initialized on the next call.
    pub fn reset(&self) {
        self.executor.terminate();
        *self.last_path.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Path that served the most recent call, if any.
    pub fn last_path(&self) -> Option<ExecutionPath> {
        *self.last_path.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, path: ExecutionPath) {
        *self.last_path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path);
    }

    async fn run(&self, request: MergeRequest) -> Result<MergeResponse> {
        if self.executor.path() == ExecutionPath::Inline {
            self.record(ExecutionPath::Inline);
            return crdt::execute(request);
        }

        match self.executor.execute(request.clone()).await {
            Err(MergeError::WorkerUnavailable) => {
                debug!("Merge worker unavailable, running inline");
                self.record(ExecutionPath::Inline);
                crdt::execute(request)
            }
            result => {
                self.record(self.executor.path());
                result
            }
        }
    }

    pub async fn merge_updates(&self, updates: Vec<Vec<u8>>) -> Result<Vec<u8>> {
        match self.run(MergeRequest::Merge(updates)).await? {
            MergeResponse::Merged(bytes) => Ok(bytes),
            _ => Err(MergeError::UnexpectedResponse),
        }
    }

    pub async fn batch_merge(&self, docs: Vec<DocUpdates>) -> Result<Vec<DocMergeResult>> {
        match self.run(MergeRequest::Batch(docs)).await? {
            MergeResponse::Batch(results) => Ok(results),
            _ => Err(MergeError::UnexpectedResponse),
        }
    }

    pub async fn validate(&self, update: Vec<u8>) -> Result<Validation> {
        match self.run(MergeRequest::Validate(update)).await? {
            MergeResponse::Validation(validation) => Ok(validation),
            _ => Err(MergeError::UnexpectedResponse),
        }
    }

    pub async fn update_stats(&self, update: Vec<u8>) -> Result<UpdateStats> {
        match self.run(MergeRequest::Stats(update)).await? {
            MergeResponse::Stats(stats) => Ok(stats),
            _ => Err(MergeError::UnexpectedResponse),
        }
    }
}

impl Drop for MergeEngine {
    fn drop(&mut self) {
        self.executor.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loro::{ExportMode, LoroDoc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn edit(peer: u64, text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer).unwrap();
        doc.get_text("body").insert(0, text).unwrap();
        doc.commit();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    /// Worker stand-in that is never reachable.
    struct DeadWorker {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MergeExecutor for DeadWorker {
        fn path(&self) -> ExecutionPath {
            ExecutionPath::Worker
        }

        fn init(&self) -> Result<()> {
            Err(MergeError::WorkerUnavailable)
        }

        async fn execute(&self, _request: MergeRequest) -> Result<MergeResponse> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(MergeError::WorkerUnavailable)
        }
    }

    #[tokio::test]
    async fn test_worker_strategy_records_worker_path() {
        let engine = MergeEngine::new(&MergeConfig::default());
        assert_eq!(engine.last_path(), None);

        let merged = engine
            .merge_updates(vec![edit(1, "a"), edit(2, "b")])
            .await
            .unwrap();
        assert!(!merged.is_empty());
        assert_eq!(engine.last_path(), Some(ExecutionPath::Worker));

        engine.reset();
        assert_eq!(engine.last_path(), None);
    }

    #[tokio::test]
    async fn test_unavailable_worker_falls_back_inline() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let engine = MergeEngine::with_executor(DeadWorker {
            attempts: Arc::clone(&attempts),
        });
        assert!(!engine.init());

        let stats = engine.update_stats(edit(1, "abc")).await.unwrap();
        assert_eq!(stats.changes, 1);
        assert_eq!(engine.last_path(), Some(ExecutionPath::Inline));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inline_strategy_never_touches_worker() {
        let engine = MergeEngine::new(&MergeConfig {
            strategy: ExecutionStrategy::Inline,
        });
        let only = edit(1, "x");
        let results = engine
            .batch_merge(vec![DocUpdates::new("d", vec![only.clone()])])
            .await
            .unwrap();
        assert_eq!(results[0].merged.as_deref(), Some(only.as_slice()));
        assert_eq!(engine.last_path(), Some(ExecutionPath::Inline));
    }

    #[tokio::test]
    async fn test_merge_errors_are_not_retried_inline() {
        let engine = MergeEngine::new(&MergeConfig::default());
        let err = engine
            .merge_updates(vec![edit(1, "a"), vec![0xff; 8]])
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Decode(_)));
        assert_eq!(engine.last_path(), Some(ExecutionPath::Worker));
    }
}
