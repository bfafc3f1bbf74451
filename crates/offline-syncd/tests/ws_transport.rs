//! End-to-end tests for the WebSocket transport.
//!
//! A small in-process authority accepts connections and acknowledges
//! `pushUpdate` frames. Document ids steer its behavior:
//! `rejected-*` gets an error ack, `hang-*` gets no reply and `drop-*`
//! closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use offline_sync::{
    DrainOutcome, PushAck, PushUpdateRequest, SpaceType, SyncTransport, TransportError,
};
use offline_syncd::{AckEnvelope, DaemonConfig, Engine, RequestEnvelope, WsTransport};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Requests the authority has accepted, in arrival order.
type Received = Arc<Mutex<Vec<PushUpdateRequest>>>;

async fn start_authority() -> (SocketAddr, Received) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received: Received = Arc::default();

    let log = Arc::clone(&received);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let request: RequestEnvelope = serde_json::from_str(&text).unwrap();
                    assert_eq!(request.kind, "pushUpdate");

                    let doc_id = request.payload.doc_id.clone();
                    if doc_id.starts_with("drop") {
                        let _ = ws.close(None).await;
                        return;
                    }
                    if doc_id.starts_with("hang") {
                        continue;
                    }

                    let ack = if doc_id.starts_with("rejected") {
                        PushAck::rejected("document is read-only")
                    } else {
                        log.lock().await.push(request.payload.clone());
                        PushAck::ok()
                    };
                    let reply = serde_json::to_string(&AckEnvelope {
                        id: request.id,
                        ack,
                    })
                    .unwrap();
                    if ws.send(Message::Text(reply)).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, received)
}

fn request(doc_id: &str, update: Vec<u8>) -> PushUpdateRequest {
    PushUpdateRequest {
        space_type: SpaceType::Workspace,
        space_id: "ws".into(),
        doc_id: doc_id.into(),
        update,
        session_id: "session-a".into(),
        client_id: None,
    }
}

#[tokio::test]
async fn test_push_update_is_acknowledged() {
    let (addr, received) = start_authority().await;
    let transport = WsTransport::connect(&format!("ws://{}", addr)).await.unwrap();
    assert!(transport.is_connected());

    let ack = transport
        .push_update(request("note", vec![0, 1, 2, 255]))
        .await
        .unwrap();
    assert_eq!(ack, PushAck::ok());
    assert_eq!(transport.pending_count(), 0);

    let received = received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].update, vec![0, 1, 2, 255]);
}

#[tokio::test]
async fn test_rejection_is_reported() {
    let (addr, _) = start_authority().await;
    let transport = WsTransport::connect(&format!("ws://{}", addr)).await.unwrap();

    let ack = transport
        .push_update(request("rejected-note", vec![1]))
        .await
        .unwrap();
    assert_eq!(
        ack.into_result(),
        Err(TransportError::Rejected("document is read-only".into()))
    );
}

#[tokio::test]
async fn test_timeout_cleans_up_pending_request() {
    let (addr, _) = start_authority().await;
    let transport = WsTransport::connect(&format!("ws://{}", addr)).await.unwrap();

    let result = timeout(
        Duration::from_millis(200),
        transport.push_update(request("hang-note", vec![1])),
    )
    .await;
    assert!(result.is_err(), "authority never answers hang-*");
    assert_eq!(transport.pending_count(), 0);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_request() {
    let (addr, _) = start_authority().await;
    let transport = WsTransport::connect(&format!("ws://{}", addr)).await.unwrap();

    let result = timeout(
        Duration::from_secs(5),
        transport.push_update(request("drop-note", vec![1])),
    )
    .await
    .expect("request should fail once the connection closes");
    assert!(matches!(result, Err(TransportError::SendFailed(_))));

    // The read loop flags the disconnect after failing waiters.
    timeout(Duration::from_secs(5), async {
        while transport.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let result = transport.push_update(request("note", vec![1])).await;
    assert_eq!(result, Err(TransportError::NotConnected));
}

#[tokio::test]
async fn test_connect_failure_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WsTransport::connect(&format!("ws://{}", addr))
        .await
        .err()
        .unwrap();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_engine_drains_queue_over_websocket() {
    let (addr, received) = start_authority().await;
    let dir = TempDir::new().unwrap();
    let mut config = DaemonConfig::from_sources(None, |_| None).unwrap();
    config.data_dir = dir.path().to_path_buf();
    config.engine.sync.workspace_id = Some("ws".into());
    config.engine.sync.request_attempts = 1;

    let engine = Engine::open(config).await.unwrap();
    engine
        .enqueue(SpaceType::Workspace, "ws", "first", vec![1])
        .await
        .unwrap();
    engine
        .enqueue(SpaceType::Workspace, "ws", "rejected-second", vec![2])
        .await
        .unwrap();
    engine
        .enqueue(SpaceType::Workspace, "ws", "third", vec![3])
        .await
        .unwrap();

    let transport = Arc::new(WsTransport::connect(&format!("ws://{}", addr)).await.unwrap());
    let orchestrator = engine.orchestrator(transport.clone());
    let outcome = orchestrator.drain().await.unwrap();

    let DrainOutcome::Completed(report) = outcome else {
        panic!("expected a completed pass, got {:?}", outcome);
    };
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.retained, 1);

    let remaining = engine.queue.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].doc_id, "rejected-second");

    let docs: Vec<String> = received
        .lock()
        .await
        .iter()
        .map(|r| r.doc_id.clone())
        .collect();
    assert_eq!(docs, vec!["first", "third"]);
    assert!(received.lock().await.iter().all(|r| r.session_id == engine.session_id()));

    transport.close().await;
}
