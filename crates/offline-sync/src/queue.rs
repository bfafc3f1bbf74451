//! Persistent operation queue.
//!
//! Capacity-bounded log of pending document updates on top of two
//! [`QueueBackend`]s: a durable primary and a lower-capacity fallback used
//! whenever the primary reports itself unavailable.
//!
//! Entries that fail to decode are purged and reported on the event bus so a
//! single bad record never blocks the rest of the queue.

use crate::config::{HealthConfig, QueueConfig, QueueLimits};
use crate::events::{EventBus, StorageEvent, StorageEventKind};
use crate::operation::{OfflineOperation, OperationError, normalize_doc_id};
use crate::storage::{QueueBackend, StorageError, StoredEntry};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(#[from] OperationError),

    #[error("Operation of {size} bytes exceeds queue capacity of {max} bytes")]
    CapacityExceeded { size: u64, max: u64 },

    #[error("No storage backend available")]
    Unavailable,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Encoding error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Which backend served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Primary,
    Fallback,
    Unavailable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Primary => f.write_str("primary"),
            BackendKind::Fallback => f.write_str("fallback"),
            BackendKind::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Capacity and usage snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub operation_count: usize,
    pub max_operations: usize,
    pub estimated_bytes: u64,
    pub max_bytes: u64,
    /// Larger of the count ratio and the byte ratio, 0-100.
    pub percent_used: f64,
    pub is_low: bool,
    pub is_critical: bool,
    pub backend: BackendKind,
}

impl StorageStatus {
    fn from_usage(
        operation_count: usize,
        estimated_bytes: u64,
        limits: QueueLimits,
        thresholds: &Thresholds,
        backend: BackendKind,
    ) -> Self {
        let count_ratio = operation_count as f64 / limits.max_operations as f64;
        let byte_ratio = estimated_bytes as f64 / limits.max_bytes as f64;
        let percent_used = (count_ratio.max(byte_ratio) * 100.0).min(100.0);

        Self {
            operation_count,
            max_operations: limits.max_operations,
            estimated_bytes,
            max_bytes: limits.max_bytes,
            percent_used,
            is_low: percent_used >= thresholds.low,
            is_critical: percent_used >= thresholds.critical,
            backend,
        }
    }

    /// Status reported when neither backend can be reached.
    fn unavailable(limits: QueueLimits) -> Self {
        Self {
            operation_count: 0,
            max_operations: limits.max_operations,
            estimated_bytes: 0,
            max_bytes: limits.max_bytes,
            percent_used: 100.0,
            is_low: true,
            is_critical: true,
            backend: BackendKind::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    low: f64,
    critical: f64,
}

/// Eviction candidate: just enough of an entry to pick what to drop.
struct Slot {
    id: String,
    size: u64,
}

/// Durable, capacity-bounded queue of offline operations.
pub struct OperationQueue {
    primary: Arc<dyn QueueBackend>,
    fallback: Arc<dyn QueueBackend>,
    config: QueueConfig,
    thresholds: Thresholds,
    events: Arc<EventBus<StorageEvent>>,
    /// Last backend choice, so switches are logged once per transition.
    on_fallback: AtomicBool,
}

impl OperationQueue {
    pub fn new(
        primary: Arc<dyn QueueBackend>,
        fallback: Arc<dyn QueueBackend>,
        config: QueueConfig,
        events: Arc<EventBus<StorageEvent>>,
    ) -> Self {
        let health = HealthConfig::default();
        Self {
            primary,
            fallback,
            config,
            thresholds: Thresholds {
                low: health.low_percent,
                critical: health.critical_percent,
            },
            events,
            on_fallback: AtomicBool::new(false),
        }
    }

    /// Use the monitor's low/critical percentages when classifying status.
    pub fn with_thresholds(mut self, health: &HealthConfig) -> Self {
        self.thresholds = Thresholds {
            low: health.low_percent,
            critical: health.critical_percent,
        };
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus<StorageEvent>> {
        &self.events
    }

    /// Pick the backend for this call.
    async fn active(&self) -> Option<(&dyn QueueBackend, QueueLimits, BackendKind)> {
        if self.primary.is_available().await {
            if self.on_fallback.swap(false, Ordering::SeqCst) {
                info!("Primary queue backend '{}' is available again", self.primary.name());
            }
            return Some((self.primary.as_ref(), self.config.primary, BackendKind::Primary));
        }
        if self.fallback.is_available().await {
            if !self.on_fallback.swap(true, Ordering::SeqCst) {
                warn!(
                    "Primary queue backend '{}' unavailable, using fallback '{}'",
                    self.primary.name(),
                    self.fallback.name()
                );
            }
            return Some((self.fallback.as_ref(), self.config.fallback, BackendKind::Fallback));
        }
        None
    }

    async fn require_active(&self) -> Result<(&dyn QueueBackend, QueueLimits, BackendKind)> {
        self.active().await.ok_or(QueueError::Unavailable)
    }

    /// Append one operation, evicting older entries as the caps require.
    pub async fn save(&self, mut op: OfflineOperation) -> Result<()> {
        op.doc_id = normalize_doc_id(&op.doc_id).ok_or(OperationError::EmptyDocId)?;
        if op.space_id.trim().is_empty() {
            return Err(OperationError::EmptySpaceId.into());
        }
        if op.session_id.trim().is_empty() {
            return Err(OperationError::EmptySessionId.into());
        }

        let Some((backend, limits, kind)) = self.active().await else {
            self.emit(
                StorageEvent::new(
                    StorageEventKind::WriteFailure,
                    "No storage backend available; offline edit was not saved",
                )
                .with_details(json!({ "docId": op.doc_id, "operationId": op.id })),
            );
            return Err(QueueError::Unavailable);
        };

        let size = op.estimated_size();
        if size > limits.max_bytes {
            warn!(
                "Rejecting operation {} for {}: {} bytes exceeds queue capacity",
                op.id, op.doc_id, size
            );
            self.emit(
                StorageEvent::new(
                    StorageEventKind::DataLoss,
                    format!("Update for {} is too large to store offline", op.doc_id),
                )
                .with_details(json!({ "docId": op.doc_id, "size": size, "maxBytes": limits.max_bytes })),
            );
            return Err(QueueError::CapacityExceeded {
                size,
                max: limits.max_bytes,
            });
        }

        let doc_id = op.doc_id.clone();
        let entry = encode(&op)?;
        let (backend, limits) = match backend.put(entry.clone()).await {
            Ok(()) => (backend, limits),
            Err(e) if kind == BackendKind::Primary => {
                if !self.fallback.is_available().await {
                    return Err(self.write_failed(&doc_id, e));
                }
                warn!("Primary queue write failed ({}), writing to fallback", e);
                self.on_fallback.store(true, Ordering::SeqCst);
                self.fallback.put(entry).await.map_err(|e| self.write_failed(&doc_id, e))?;
                (self.fallback.as_ref(), self.config.fallback)
            }
            Err(e) => return Err(self.write_failed(&doc_id, e)),
        };

        debug!("Queued operation {} for {} ({} bytes)", op.id, doc_id, size);
        self.enforce_document_cap(backend, limits, &op.space_id, &doc_id).await?;
        self.enforce_global_caps(backend, limits).await
    }

    fn write_failed(&self, doc_id: &str, error: StorageError) -> QueueError {
        self.emit(
            StorageEvent::new(
                StorageEventKind::WriteFailure,
                format!("Failed to persist offline edit for {doc_id}"),
            )
            .with_details(json!({ "docId": doc_id, "error": error.to_string() })),
        );
        QueueError::Storage(error)
    }

    async fn enforce_document_cap(
        &self,
        backend: &dyn QueueBackend,
        limits: QueueLimits,
        space_id: &str,
        doc_id: &str,
    ) -> Result<()> {
        let listing = backend.get_by_doc(doc_id).await?;
        self.purge_corrupt(backend, listing.corrupt).await;

        // The same doc id in another space is a different document.
        let entries: Vec<StoredEntry> = listing
            .entries
            .into_iter()
            .filter(|e| e.space_id == space_id)
            .collect();
        let excess = entries.len().saturating_sub(limits.max_per_document);
        if excess == 0 {
            return Ok(());
        }

        let ids: Vec<String> = entries.into_iter().take(excess).map(|e| e.id).collect();
        backend.delete_many(&ids).await?;
        info!("Evicted {} oldest operations of {} (per-document cap)", excess, doc_id);
        self.emit(
            StorageEvent::new(
                StorageEventKind::OfflineOverflow,
                format!("Evicted {excess} offline operations for {doc_id}"),
            )
            .with_details(json!({
                "evicted": excess,
                "spaceId": space_id,
                "docId": doc_id,
                "cap": "perDocument",
            })),
        );
        Ok(())
    }

    async fn enforce_global_caps(&self, backend: &dyn QueueBackend, limits: QueueLimits) -> Result<()> {
        let mut slots = Vec::new();
        let mut corrupt = Vec::new();
        let mut total_bytes = 0u64;

        let mut stream = backend.scan().await?;
        while let Some(item) = stream.next().await {
            match item {
                Ok(entry) => {
                    total_bytes += entry.size;
                    slots.push(Slot {
                        id: entry.id,
                        size: entry.size,
                    });
                }
                Err(StorageError::Corrupt { id, .. }) => corrupt.push(id),
                Err(e) => return Err(e.into()),
            }
        }
        drop(stream);
        self.purge_corrupt(backend, corrupt).await;

        let mut count = slots.len();
        let mut evict = Vec::new();
        for slot in slots {
            if count <= limits.max_operations && total_bytes <= limits.max_bytes {
                break;
            }
            count -= 1;
            total_bytes -= slot.size;
            evict.push(slot.id);
        }
        if evict.is_empty() {
            return Ok(());
        }

        backend.delete_many(&evict).await?;
        info!("Evicted {} oldest operations (global cap)", evict.len());
        self.emit(
            StorageEvent::new(
                StorageEventKind::OfflineOverflow,
                format!("Offline queue full; evicted {} oldest operations", evict.len()),
            )
            .with_details(json!({ "evicted": evict.len(), "cap": "global" })),
        );
        Ok(())
    }

    /// All operations, oldest first.
    pub async fn list(&self) -> Result<Vec<OfflineOperation>> {
        let (backend, _, _) = self.require_active().await?;
        let listing = backend.get_all().await?;
        Ok(self.decode_listing(backend, listing.entries, listing.corrupt).await)
    }

    /// Operations of one document, oldest first.
    pub async fn list_for_doc(&self, doc_id: &str) -> Result<Vec<OfflineOperation>> {
        let doc_id = normalize_doc_id(doc_id).ok_or(OperationError::EmptyDocId)?;
        let (backend, _, _) = self.require_active().await?;
        let listing = backend.get_by_doc(&doc_id).await?;
        Ok(self.decode_listing(backend, listing.entries, listing.corrupt).await)
    }

    async fn decode_listing(
        &self,
        backend: &dyn QueueBackend,
        entries: Vec<StoredEntry>,
        mut corrupt: Vec<String>,
    ) -> Vec<OfflineOperation> {
        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode(&entry) {
                Ok(op) => ops.push(op),
                Err(reason) => {
                    warn!("Queue entry {} failed to decode: {}", entry.id, reason);
                    corrupt.push(entry.id);
                }
            }
        }
        self.purge_corrupt(backend, corrupt).await;
        ops.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        ops
    }

    async fn purge_corrupt(&self, backend: &dyn QueueBackend, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        warn!("Dropping {} corrupt queue entries: {:?}", ids.len(), ids);
        if let Err(e) = backend.delete_many(&ids).await {
            warn!("Failed to delete corrupt queue entries: {}", e);
        }
        self.emit(
            StorageEvent::new(
                StorageEventKind::IntegrityError,
                format!("Dropped {} unreadable offline operations", ids.len()),
            )
            .with_details(json!({ "ids": ids })),
        );
    }

    /// Remove the given ids in one transaction. Returns how many existed.
    pub async fn delete_many(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (backend, _, _) = self.require_active().await?;
        Ok(backend.delete_many(ids).await?)
    }

    /// Delete `ids` and insert `replacement` in one transaction.
    pub async fn replace(&self, ids: &[String], replacement: OfflineOperation) -> Result<()> {
        let (backend, _, _) = self.require_active().await?;
        let entry = encode(&replacement)?;
        backend.replace(ids, vec![entry]).await?;
        debug!(
            "Replaced {} operations of {} with {}",
            ids.len(),
            replacement.doc_id,
            replacement.id
        );
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let (backend, _, _) = self.require_active().await?;
        backend.clear().await?;
        Ok(())
    }

    /// Move every entry of `legacy` into the primary backend, then clear it.
    ///
    /// Ids the primary already holds are skipped, so running this on every
    /// startup is safe. Returns the number of entries copied.
    pub async fn migrate(&self, legacy: &dyn QueueBackend) -> Result<usize> {
        if !self.primary.is_available().await {
            debug!("Skipping migration: primary backend unavailable");
            return Ok(0);
        }
        if !legacy.is_available().await {
            return Ok(0);
        }

        let listing = legacy.get_all().await?;
        if listing.entries.is_empty() && listing.corrupt.is_empty() {
            return Ok(0);
        }
        if !listing.corrupt.is_empty() {
            self.emit(
                StorageEvent::new(
                    StorageEventKind::IntegrityError,
                    format!(
                        "Dropped {} unreadable operations during migration",
                        listing.corrupt.len()
                    ),
                )
                .with_details(json!({ "ids": listing.corrupt })),
            );
        }

        let mut migrated = 0;
        for entry in listing.entries {
            if self.primary.get(&entry.id).await?.is_some() {
                continue;
            }
            self.primary.put(entry).await?;
            migrated += 1;
        }
        legacy.clear().await?;

        info!("Migrated {} operations from '{}'", migrated, legacy.name());
        if migrated > 0 {
            self.enforce_global_caps(self.primary.as_ref(), self.config.primary)
                .await?;
        }
        Ok(migrated)
    }

    /// Move anything written to the fallback during an outage back into the primary.
    pub async fn migrate_fallback(&self) -> Result<usize> {
        self.migrate(self.fallback.as_ref()).await
    }

    /// Usage snapshot computed by streaming the queue one entry at a time.
    pub async fn status(&self) -> StorageStatus {
        let Some((backend, limits, kind)) = self.active().await else {
            return StorageStatus::unavailable(self.config.primary);
        };

        let mut stream = match backend.scan().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Queue status scan failed: {}", e);
                return StorageStatus::unavailable(limits);
            }
        };

        let mut count = 0usize;
        let mut bytes = 0u64;
        let mut corrupt = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(entry) => {
                    count += 1;
                    bytes += entry.size;
                }
                Err(StorageError::Corrupt { id, .. }) => corrupt.push(id),
                Err(e) => warn!("Skipping unreadable entry during status scan: {}", e),
            }
        }
        drop(stream);
        self.purge_corrupt(backend, corrupt).await;

        StorageStatus::from_usage(count, bytes, limits, &self.thresholds, kind)
    }

    fn emit(&self, event: StorageEvent) {
        self.events.emit(event);
    }
}

fn encode(op: &OfflineOperation) -> Result<StoredEntry> {
    let payload = bincode::serialize(op).map_err(|e| QueueError::Codec(e.to_string()))?;
    Ok(StoredEntry {
        id: op.id.clone(),
        doc_id: op.doc_id.clone(),
        space_id: op.space_id.clone(),
        timestamp: op.timestamp,
        size: op.estimated_size(),
        payload,
    })
}

fn decode(entry: &StoredEntry) -> std::result::Result<OfflineOperation, String> {
    let op: OfflineOperation = bincode::deserialize(&entry.payload).map_err(|e| e.to_string())?;
    if op.id != entry.id {
        return Err(format!("payload belongs to operation {}", op.id));
    }
    Ok(op)
}
