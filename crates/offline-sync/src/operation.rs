//! OfflineOperation: one pending document update waiting to be delivered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;
use web_time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("Document ID cannot be empty")]
    EmptyDocId,

    #[error("Space ID cannot be empty")]
    EmptySpaceId,

    #[error("Session ID cannot be empty")]
    EmptySessionId,
}

/// Kind of space a document lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    Workspace,
    Userspace,
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceType::Workspace => f.write_str("workspace"),
            SpaceType::Userspace => f.write_str("userspace"),
        }
    }
}

/// A queued document update.
///
/// The `update` payload is opaque to everything except the merge engine.
/// Operations are never edited in place: compaction and sync replace them
/// as whole records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: String,
    pub doc_id: String,
    pub update: Vec<u8>,
    /// Creation time in milliseconds, strictly increasing within a process.
    pub timestamp: u64,
    pub space_id: String,
    pub space_type: SpaceType,
    pub session_id: String,
    pub client_id: Option<String>,
}

impl OfflineOperation {
    /// Create an operation with a fresh id and the next monotonic timestamp.
    pub fn new(
        space_type: SpaceType,
        space_id: &str,
        doc_id: &str,
        update: Vec<u8>,
        session_id: &str,
        client_id: Option<&str>,
    ) -> Result<Self, OperationError> {
        let doc_id = normalize_doc_id(doc_id).ok_or(OperationError::EmptyDocId)?;
        let space_id = space_id.trim();
        if space_id.is_empty() {
            return Err(OperationError::EmptySpaceId);
        }
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(OperationError::EmptySessionId);
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            doc_id,
            update,
            timestamp: next_timestamp(),
            space_id: space_id.to_string(),
            space_type,
            session_id: session_id.to_string(),
            client_id: client_id
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        })
    }

    /// Replacement for a group of operations whose updates were merged.
    ///
    /// Takes the timestamp and attribution of `latest` and a fresh id.
    pub fn merged_from(latest: &OfflineOperation, update: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            update,
            ..latest.clone()
        }
    }

    /// Estimated storage cost of this operation.
    pub fn estimated_size(&self) -> u64 {
        self.update.len() as u64
    }

    /// Key used to group operations of the same document.
    pub fn doc_key(&self) -> (String, String) {
        (self.space_id.clone(), self.doc_id.clone())
    }
}

/// Normalize a document id. Returns `None` for ids that are empty after trimming.
pub fn normalize_doc_id(doc_id: &str) -> Option<String> {
    let trimmed = doc_id.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Next timestamp from the process-wide monotonic clock.
///
/// Equal to the wall clock unless that would not advance past the previous
/// value, in which case it is `previous + 1`.
pub fn next_timestamp() -> u64 {
    let now = now_millis();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(doc_id: &str) -> Result<OfflineOperation, OperationError> {
        OfflineOperation::new(SpaceType::Workspace, "ws", doc_id, vec![1, 2, 3], "s1", None)
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let a = next_timestamp();
        let b = next_timestamp();
        let c = next_timestamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_new_normalizes_doc_id() {
        let op = op("  doc-1 \n").unwrap();
        assert_eq!(op.doc_id, "doc-1");
        assert_eq!(op.estimated_size(), 3);
    }

    #[test]
    fn test_new_rejects_empty_ids() {
        assert_eq!(op("   ").unwrap_err(), OperationError::EmptyDocId);
        let err = OfflineOperation::new(SpaceType::Workspace, "ws", "d", vec![], " ", None);
        assert_eq!(err.unwrap_err(), OperationError::EmptySessionId);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = op("d").unwrap();
        let b = op("d").unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.timestamp < b.timestamp);
    }

    #[test]
    fn test_merged_from_keeps_attribution() {
        let latest = OfflineOperation::new(SpaceType::Workspace, "ws", "d", vec![1], "s2", Some("c2"))
            .unwrap();
        let merged = OfflineOperation::merged_from(&latest, vec![9, 9]);
        assert_ne!(merged.id, latest.id);
        assert_eq!(merged.timestamp, latest.timestamp);
        assert_eq!(merged.session_id, "s2");
        assert_eq!(merged.client_id.as_deref(), Some("c2"));
        assert_eq!(merged.update, vec![9, 9]);
    }

    #[test]
    fn test_blank_client_id_becomes_none() {
        let op =
            OfflineOperation::new(SpaceType::Userspace, "u", "d", vec![], "s", Some("  ")).unwrap();
        assert_eq!(op.client_id, None);
        assert_eq!(op.space_type.to_string(), "userspace");
    }
}
