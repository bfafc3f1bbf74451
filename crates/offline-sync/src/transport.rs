//! Transport seam between the orchestrator and the remote authority.
//!
//! The connection itself (handshake, reconnects) belongs to the host; the
//! orchestrator only needs to know whether it is connected and to run one
//! request/acknowledge exchange per queued operation.

use crate::operation::{OfflineOperation, SpaceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Remote rejected update: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::SendFailed(_))
    }
}

/// Request carrying one queued update to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushUpdateRequest {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
    /// Base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub update: Vec<u8>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl From<&OfflineOperation> for PushUpdateRequest {
    fn from(op: &OfflineOperation) -> Self {
        Self {
            space_type: op.space_type,
            space_id: op.space_id.clone(),
            doc_id: op.doc_id.clone(),
            update: op.update.clone(),
            session_id: op.session_id.clone(),
            client_id: op.client_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub message: String,
}

/// Acknowledgement: `{}` on success, `{"error": {"message": ...}}` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl PushAck {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            error: Some(AckError {
                message: message.into(),
            }),
        }
    }

    pub fn into_result(self) -> Result<(), TransportError> {
        match self.error {
            None => Ok(()),
            Some(e) => Err(TransportError::Rejected(e.message)),
        }
    }
}

/// Connection used to deliver queued updates.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn push_update(&self, request: PushUpdateRequest) -> Result<PushAck, TransportError>;
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// How the mock answers requests for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Acknowledge with an error message.
    Reject(String),
    /// Fail to send.
    SendFailed,
    /// Never answer, so the caller's timeout fires.
    Hang,
}

/// In-process transport for tests and demos.
///
/// Records every request it receives and fails on demand per document.
pub struct MockTransport {
    connected: AtomicBool,
    failures: Mutex<HashMap<String, MockFailure>>,
    requests: Mutex<Vec<PushUpdateRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_doc(&self, doc_id: &str, failure: MockFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id.to_string(), failure);
    }

    pub fn heal_doc(&self, doc_id: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(doc_id);
    }

    /// Delay every answer by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<PushUpdateRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn push_update(&self, request: PushUpdateRequest) -> Result<PushAck, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.doc_id)
            .cloned();
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            None => Ok(PushAck::ok()),
            Some(MockFailure::Reject(message)) => Ok(PushAck::rejected(message)),
            Some(MockFailure::SendFailed) => Err(TransportError::SendFailed("mock".into())),
            Some(MockFailure::Hang) => std::future::pending().await,
        }
    }
}
