//! WebSocket transport to the remote authority.
//!
//! Each queued operation is sent as a JSON text frame carrying a request id;
//! the remote answers with an acknowledgement echoing that id:
//!
//! ```text
//! -> {"id":"<uuid>","type":"pushUpdate","payload":{"spaceType":"workspace",...}}
//! <- {"id":"<uuid>"}                              success
//! <- {"id":"<uuid>","error":{"message":"..."}}   rejected
//! ```
//!
//! A background task reads frames and completes the matching pending request.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use offline_sync::{PushAck, PushUpdateRequest, SyncTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// Maximum accepted frame size (50MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

pub const PUSH_UPDATE: &str = "pushUpdate";

/// Request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: PushUpdateRequest,
}

/// Acknowledgement frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub ack: PushAck,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<std::sync::Mutex<HashMap<String, oneshot::Sender<PushAck>>>>;

/// Removes a pending request when its caller stops waiting (e.g. on timeout).
struct PendingGuard {
    pending: Pending,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct WsTransport {
    url: String,
    write: Mutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
}

impl WsTransport {
    /// Open a connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::SendFailed(format!("connect to {url}: {e}")))?;
        info!("Connected to {}", url);

        let (write, read) = ws_stream.split();
        let pending: Pending = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let read_task = tokio::spawn(Self::read_loop(
            url.to_string(),
            read,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        Ok(Self {
            url: url.to_string(),
            write: Mutex::new(write),
            pending,
            connected,
            read_task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requests sent and not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn read_loop(
        url: String,
        mut read: SplitStream<WsStream>,
        pending: Pending,
        connected: Arc<AtomicBool>,
    ) {
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", url);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Connection {} closed", url);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", url, e);
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", url);
                    break;
                }
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!("Frame from {} exceeds max size ({} bytes), dropping", url, data.len());
                continue;
            }

            let envelope: AckEnvelope = match serde_json::from_slice(&data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Ignoring unrecognized frame from {}: {}", url, e);
                    continue;
                }
            };

            let waiter = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&envelope.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope.ack);
                }
                None => debug!("Acknowledgement for unknown request {}", envelope.id),
            }
        }

        connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every outstanding request.
        pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Disconnected from {}", url);
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(None)).await;
        self.read_task.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[async_trait]
impl SyncTransport for WsTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn push_update(&self, request: PushUpdateRequest) -> Result<PushAck, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&RequestEnvelope {
            id: id.clone(),
            kind: PUSH_UPDATE.to_string(),
            payload: request,
        })
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        self.write
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        rx.await
            .map_err(|_| TransportError::SendFailed("connection closed before acknowledgement".into()))
    }
}
