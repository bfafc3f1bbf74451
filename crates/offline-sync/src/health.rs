//! Storage health monitor.
//!
//! Watches queue usage, warns when it crosses the low and critical
//! thresholds, and compacts the queue by merging each document's pending
//! updates into one.

use crate::config::HealthConfig;
use crate::events::{StorageEvent, StorageEventKind};
use crate::merge::{DocUpdates, MergeEngine, MergeError};
use crate::operation::OfflineOperation;
use crate::queue::{OperationQueue, QueueError, StorageStatus};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),
}

pub type Result<T> = std::result::Result<T, HealthError>;

/// Usage level derived from a status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Ok,
    Low,
    Critical,
}

impl HealthLevel {
    pub fn of(status: &StorageStatus) -> Self {
        if status.is_critical {
            HealthLevel::Critical
        } else if status.is_low {
            HealthLevel::Low
        } else {
            HealthLevel::Ok
        }
    }
}

/// A document group that could not be compacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionFailure {
    pub space_id: String,
    pub doc_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub operations_before: usize,
    pub operations_after: usize,
    /// Groups collapsed into a single operation.
    pub groups_compacted: usize,
    pub failures: Vec<CompactionFailure>,
}

struct CompactionGuard<'a>(&'a AtomicBool);

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct StorageHealthMonitor {
    queue: Arc<OperationQueue>,
    merge: Arc<MergeEngine>,
    config: HealthConfig,
    /// Level at the last check; a warning fires only when it rises.
    level: Mutex<HealthLevel>,
    compacting: AtomicBool,
    last_compaction: Mutex<Option<Instant>>,
}

impl StorageHealthMonitor {
    pub fn new(queue: Arc<OperationQueue>, merge: Arc<MergeEngine>, config: HealthConfig) -> Self {
        Self {
            queue,
            merge,
            config,
            level: Mutex::new(HealthLevel::Ok),
            compacting: AtomicBool::new(false),
            last_compaction: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> StorageStatus {
        self.queue.status().await
    }

    /// Compute status and warn if usage rose into `Low` or `Critical`.
    pub async fn check(&self) -> StorageStatus {
        let status = self.queue.status().await;
        let level = HealthLevel::of(&status);

        let previous = {
            let mut current = self.level.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, level)
        };

        if level > previous {
            let message = match level {
                HealthLevel::Critical => format!(
                    "Offline storage is critically full ({:.0}% used)",
                    status.percent_used
                ),
                _ => format!("Offline storage is running low ({:.0}% used)", status.percent_used),
            };
            warn!("{}", message);
            self.queue.events().emit(
                StorageEvent::new(StorageEventKind::StorageLow, message).with_details(json!({
                    "level": level,
                    "percentUsed": status.percent_used,
                    "operationCount": status.operation_count,
                    "estimatedBytes": status.estimated_bytes,
                    "backend": status.backend,
                })),
            );
        } else if level < previous {
            debug!("Storage usage dropped to {:?}", level);
        }
        status
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    /// Compact if the queue is over the threshold, the cooldown has passed,
    /// and no compaction is running.
    pub async fn maybe_compact(&self, now: Instant) -> Result<Option<CompactionReport>> {
        if self.is_compacting() {
            return Ok(None);
        }
        let cooling_down = self
            .last_compaction
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| now.duration_since(at) < self.config.compact_cooldown);
        if cooling_down {
            return Ok(None);
        }

        let status = self.queue.status().await;
        if status.operation_count < self.config.auto_compact_threshold {
            return Ok(None);
        }

        info!(
            "Queue holds {} operations, compacting",
            status.operation_count
        );
        self.compact().await
    }

    /// Merge each document's queued operations into one.
    ///
    /// Returns `None` if a compaction is already running.
    pub async fn compact(&self) -> Result<Option<CompactionReport>> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = CompactionGuard(&self.compacting);

        let report = self.run_compaction().await;
        *self.last_compaction.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        report.map(Some)
    }

    async fn run_compaction(&self) -> Result<CompactionReport> {
        let ops = self.queue.list().await?;
        let operations_before = ops.len();

        let mut groups: BTreeMap<(String, String), Vec<OfflineOperation>> = BTreeMap::new();
        for op in ops {
            groups.entry(op.doc_key()).or_default().push(op);
        }
        let groups: Vec<Vec<OfflineOperation>> =
            groups.into_values().filter(|g| g.len() >= 2).collect();

        let mut report = CompactionReport {
            operations_before,
            ..Default::default()
        };
        if groups.is_empty() {
            report.operations_after = operations_before;
            return Ok(report);
        }

        let requests = groups
            .iter()
            .map(|g| DocUpdates::new(g[0].doc_id.clone(), g.iter().map(|o| o.update.clone()).collect()))
            .collect();
        let results = self.merge.batch_merge(requests).await?;

        let mut removed = 0;
        for (group, result) in groups.iter().zip(results) {
            let first = &group[0];
            let merged = match (result.merged, result.error) {
                (Some(merged), None) => merged,
                (_, error) => {
                    let error = error.unwrap_or_else(|| "no merged update".into());
                    warn!("Skipping compaction of {}: {}", first.doc_id, error);
                    report.failures.push(CompactionFailure {
                        space_id: first.space_id.clone(),
                        doc_id: first.doc_id.clone(),
                        error,
                    });
                    continue;
                }
            };

            // Groups are in timestamp order, so the last one is the latest.
            let Some(latest) = group.last() else { continue };
            let replacement = OfflineOperation::merged_from(latest, merged);
            let ids: Vec<String> = group.iter().map(|o| o.id.clone()).collect();
            match self.queue.replace(&ids, replacement).await {
                Ok(()) => {
                    report.groups_compacted += 1;
                    removed += ids.len() - 1;
                }
                Err(e) => {
                    warn!("Failed to store compacted {}: {}", first.doc_id, e);
                    report.failures.push(CompactionFailure {
                        space_id: first.space_id.clone(),
                        doc_id: first.doc_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.operations_after = operations_before - removed;
        info!(
            "Compacted {} documents: {} -> {} operations",
            report.groups_compacted, report.operations_before, report.operations_after
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionStrategy, MergeConfig, QueueConfig, QueueLimits};
    use crate::events::{EventBus, EventLog};
    use crate::operation::SpaceType;
    use crate::storage::MemoryBackend;
    use loro::{ExportMode, LoroDoc};
    use std::time::Duration;

    fn edit(peer: u64, text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer).unwrap();
        doc.get_text("body").insert(0, text).unwrap();
        doc.commit();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    fn monitor(limits: QueueLimits, config: HealthConfig) -> (StorageHealthMonitor, Arc<OperationQueue>, EventLog<StorageEvent>) {
        let events = Arc::new(EventBus::new());
        let log = EventLog::attach(&events);
        let queue = Arc::new(
            OperationQueue::new(
                Arc::new(MemoryBackend::new()),
                Arc::new(MemoryBackend::named("fallback")),
                QueueConfig::default().with_primary(limits),
                events,
            )
            .with_thresholds(&config),
        );
        let merge = Arc::new(MergeEngine::new(&MergeConfig {
            strategy: ExecutionStrategy::Inline,
        }));
        (
            StorageHealthMonitor::new(Arc::clone(&queue), merge, config),
            queue,
            log,
        )
    }

    fn op(space: &str, doc: &str, update: Vec<u8>) -> OfflineOperation {
        OfflineOperation::new(SpaceType::Workspace, space, doc, update, "s1", None).unwrap()
    }

    #[tokio::test]
    async fn test_compacts_one_operation_per_document() {
        let (monitor, queue, _log) = monitor(QueueLimits::primary(), HealthConfig::default());
        for round in 0..10u64 {
            for doc in 0..10u64 {
                let peer = doc * 100 + round + 1;
                queue
                    .save(op("ws", &format!("doc-{doc}"), edit(peer, "x")))
                    .await
                    .unwrap();
            }
        }

        let report = monitor.compact().await.unwrap().unwrap();
        assert_eq!(report.operations_before, 100);
        assert_eq!(report.operations_after, 10);
        assert_eq!(report.groups_compacted, 10);

        let ops = queue.list().await.unwrap();
        assert_eq!(ops.len(), 10);
        for compacted in ops {
            let doc = LoroDoc::new();
            doc.import(&compacted.update).unwrap();
            assert_eq!(doc.len_changes(), 10);
        }
    }

    #[tokio::test]
    async fn test_failed_group_is_left_untouched() {
        let (monitor, queue, _log) = monitor(QueueLimits::primary(), HealthConfig::default());
        queue.save(op("ws", "good", edit(1, "a"))).await.unwrap();
        queue.save(op("ws", "good", edit(2, "b"))).await.unwrap();
        queue.save(op("ws", "bad", edit(3, "c"))).await.unwrap();
        queue.save(op("ws", "bad", vec![1, 2, 3])).await.unwrap();

        let report = monitor.compact().await.unwrap().unwrap();
        assert_eq!(report.groups_compacted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].doc_id, "bad");
        assert_eq!(queue.list_for_doc("bad").await.unwrap().len(), 2);
        assert_eq!(queue.list_for_doc("good").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_group_without_base_is_kept_and_reported() {
        let (monitor, queue, _log) = monitor(QueueLimits::primary(), HealthConfig::default());

        // The base edit was synced earlier; only later increments are queued.
        let doc = LoroDoc::new();
        doc.set_peer_id(9).unwrap();
        let text = doc.get_text("body");
        text.insert(0, "synced").unwrap();
        doc.commit();
        let mut ids = Vec::new();
        for word in [" one", " two"] {
            let since = doc.oplog_vv();
            text.insert(text.len_unicode(), word).unwrap();
            doc.commit();
            let update = doc.export(ExportMode::updates(&since)).unwrap();
            let queued = op("ws", "note", update);
            ids.push(queued.id.clone());
            queue.save(queued).await.unwrap();
        }

        for _ in 0..2 {
            let report = monitor.compact().await.unwrap().unwrap();
            assert_eq!(report.groups_compacted, 0);
            assert_eq!(report.operations_after, 2);
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].doc_id, "note");
            assert!(report.failures[0].error.contains("not present"));

            let kept: Vec<String> = queue.list().await.unwrap().into_iter().map(|o| o.id).collect();
            assert_eq!(kept, ids);
        }
    }

    #[tokio::test]
    async fn test_same_doc_in_different_spaces_is_not_mixed() {
        let (monitor, queue, _log) = monitor(QueueLimits::primary(), HealthConfig::default());
        queue.save(op("ws-1", "doc", edit(1, "a"))).await.unwrap();
        queue.save(op("ws-2", "doc", edit(2, "b"))).await.unwrap();

        let report = monitor.compact().await.unwrap().unwrap();
        assert_eq!(report.groups_compacted, 0);
        assert_eq!(queue.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_threshold_warning_fires_once_per_crossing() {
        let (monitor, queue, log) = monitor(QueueLimits::new(10, 1_000_000, 10), HealthConfig::default());
        for _ in 0..7 {
            queue.save(op("ws", "d", vec![1])).await.unwrap();
        }

        assert!(monitor.check().await.is_low);
        monitor.check().await;
        assert_eq!(log.events().len(), 1);

        for _ in 0..2 {
            queue.save(op("ws", "d", vec![1])).await.unwrap();
        }
        assert!(monitor.check().await.is_critical);
        assert_eq!(log.events().len(), 2);

        queue.clear().await.unwrap();
        monitor.check().await;
        for _ in 0..7 {
            queue.save(op("ws", "d", vec![1])).await.unwrap();
        }
        monitor.check().await;

        let events = log.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == StorageEventKind::StorageLow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maybe_compact_respects_threshold_and_cooldown() {
        let config = HealthConfig::default().with_auto_compact(4, Duration::from_secs(60));
        let (monitor, queue, _log) = monitor(QueueLimits::primary(), config);
        for peer in 1..=3 {
            queue.save(op("ws", "d", edit(peer, "x"))).await.unwrap();
        }
        assert!(monitor.maybe_compact(Instant::now()).await.unwrap().is_none());

        queue.save(op("ws", "d", edit(4, "x"))).await.unwrap();
        let report = monitor.maybe_compact(Instant::now()).await.unwrap().unwrap();
        assert_eq!(report.operations_after, 1);

        for peer in 5..=8 {
            queue.save(op("ws", "d", edit(peer, "x"))).await.unwrap();
        }
        assert!(monitor.maybe_compact(Instant::now()).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(monitor.maybe_compact(Instant::now()).await.unwrap().is_some());
        assert_eq!(queue.list().await.unwrap().len(), 1);
    }
}
