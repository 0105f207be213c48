//! End-to-end viewer tests.
//!
//! Each test starts a full bridge over an in-memory store on a random port and
//! talks to it with real WebSocket clients.
//!
//! ```text
//! ┌──────────┐   WebSocket   ┌────────────────┐   ChangeFeed   ┌─────────────┐
//! │ Viewer A │ ←───────────→ │                │ ←───────────── │             │
//! └──────────┘               │  AdminBridge   │                │ MemoryStore │
//! ┌──────────┐   WebSocket   │                │  write_state   │             │
//! │ Viewer B │ ←───────────→ │                │ ─────────────→ │             │
//! └──────────┘               └────────────────┘                └─────────────┘
//! ```

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use statemirror_protocol::{ClientMessage, ServerMessage};
use statemirror_server::{
    bridge::AdminBridge,
    config::{Config, TlsPaths},
    store::{MemoryStore, StoreClient},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Test Infrastructure
// =============================================================================

fn test_config(auth: bool, www_dir: PathBuf) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        listen_port: Some(0),
        listen_port_ssl: None,
        tls: TlsPaths {
            cert_path: PathBuf::from("/nonexistent/certificate.pem"),
            key_path: PathBuf::from("/nonexistent/privatekey.pem"),
        },
        auth,
        auth_user: None,
        auth_password: None,
        cache: false,
        www_dir,
        store_url: None,
        store_seed_path: None,
        store_request_timeout_secs: 5,
        session_expiry_hours: 1,
        broadcast_capacity: 64,
    }
}

struct TestBridge {
    bridge: AdminBridge,
    addr: SocketAddr,
    _www: tempfile::TempDir,
}

async fn start_bridge(store: Arc<MemoryStore>, auth: bool) -> TestBridge {
    let www = tempfile::tempdir().expect("temp www dir");
    let mut bridge = AdminBridge::new(test_config(auth, www.path().to_path_buf()), store);
    bridge.install().expect("install");
    bridge.ready().await.expect("ready");
    let addr = bridge.local_addrs()[0].1;
    TestBridge {
        bridge,
        addr,
        _www: www,
    }
}

async fn send(viewer: &mut Viewer, request: ClientMessage) {
    let text = serde_json::to_string(&request).unwrap();
    viewer.send(Message::Text(text.into())).await.unwrap();
}

/// Next message within a generous deadline.
async fn recv(viewer: &mut Viewer) -> ServerMessage {
    recv_within(viewer, Duration::from_secs(5))
        .await
        .expect("expected a message from the bridge")
}

/// Next message, or `None` if nothing arrives within `wait`.
async fn recv_within(viewer: &mut Viewer, wait: Duration) -> Option<ServerMessage> {
    loop {
        let msg = tokio::time::timeout(wait, viewer.next()).await.ok()??;
        match msg.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Connect and wait until the bridge has attached the viewer.
async fn connect_viewer(addr: SocketAddr) -> Viewer {
    let (mut viewer, _) = connect_async(format!("ws://{}/socket", addr))
        .await
        .expect("connect viewer");
    send(&mut viewer, ClientMessage::GetStates { request_id: 0 }).await;
    match recv(&mut viewer).await {
        ServerMessage::Response { request_id: 0, .. } => viewer,
        other => panic!("unexpected first message: {:?}", other),
    }
}

fn result_of(message: ServerMessage, expected_id: u64) -> Result<Value, String> {
    match message {
        ServerMessage::Response {
            request_id,
            error,
            result,
        } => {
            assert_eq!(request_id, expected_id);
            match error {
                Some(e) => Err(e),
                None => Ok(result),
            }
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_snapshots_reflect_primed_store() {
    let store = Arc::new(MemoryStore::new());
    store.put_object("dev.0", json!({"type": "device"})).await;
    store.put_state("dev.0.temp", json!({"value": 20})).await;
    let mut t = start_bridge(store, false).await;

    let mut viewer = connect_viewer(t.addr).await;
    send(&mut viewer, ClientMessage::GetObjects { request_id: 1 }).await;
    let objects = result_of(recv(&mut viewer).await, 1).unwrap();
    assert_eq!(objects, json!({"dev.0": {"type": "device"}}));

    send(&mut viewer, ClientMessage::GetStates { request_id: 2 }).await;
    let states = result_of(recv(&mut viewer).await, 2).unwrap();
    assert_eq!(states["dev.0.temp"]["value"], 20);

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_response_goes_only_to_requester() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, false).await;

    let mut a = connect_viewer(t.addr).await;
    let mut b = connect_viewer(t.addr).await;

    send(&mut a, ClientMessage::GetObjects { request_id: 7 }).await;
    assert_eq!(result_of(recv(&mut a).await, 7), Ok(json!({})));
    assert_eq!(recv_within(&mut b, Duration::from_millis(200)).await, None);

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_write_is_acknowledged_to_writer_and_broadcast_to_all() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, false).await;

    let mut a = connect_viewer(t.addr).await;
    let mut b = connect_viewer(t.addr).await;

    send(
        &mut a,
        ClientMessage::SetState {
            request_id: Some(1),
            id: "dev.0.temp".to_string(),
            value: json!(21),
        },
    )
    .await;

    // The acknowledgement and the push may arrive in either order.
    let mut acked = false;
    let mut pushed = false;
    for _ in 0..2 {
        match recv(&mut a).await {
            ServerMessage::Response {
                request_id, error, ..
            } => {
                assert_eq!(request_id, 1);
                assert_eq!(error, None);
                acked = true;
            }
            ServerMessage::StateChange { id, value } => {
                assert_eq!(id, "dev.0.temp");
                assert_eq!(value["value"], 21);
                pushed = true;
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
    assert!(acked && pushed);

    match recv(&mut b).await {
        ServerMessage::StateChange { id, value } => {
            assert_eq!(id, "dev.0.temp");
            assert_eq!(value["value"], 21);
            assert_eq!(value["ack"], false);
        }
        other => panic!("unexpected message: {:?}", other),
    }
    // B never sees A's acknowledgement.
    assert_eq!(recv_within(&mut b, Duration::from_millis(200)).await, None);

    t.bridge.unload().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_write_from_one_viewer_wins() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store.clone(), false).await;
    let mut viewer = connect_viewer(t.addr).await;

    const WRITES: u64 = 200;
    for n in 0..WRITES {
        let last = n == WRITES - 1;
        send(
            &mut viewer,
            ClientMessage::SetState {
                request_id: last.then_some(n),
                id: "x".to_string(),
                value: json!(n),
            },
        )
        .await;
    }

    // Pushes (or a lag notice) may come first; wait for the final ack.
    loop {
        match recv(&mut viewer).await {
            ServerMessage::Response {
                request_id, error, ..
            } => {
                assert_eq!(request_id, WRITES - 1);
                assert_eq!(error, None);
                break;
            }
            _ => continue,
        }
    }

    let states = store.load_all_states().await.unwrap();
    assert_eq!(states["x"]["value"], WRITES - 1);

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_late_viewer_misses_earlier_pushes() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store.clone(), false).await;

    let mut early = connect_viewer(t.addr).await;
    store.put_state("a", json!({"value": 1})).await;
    assert!(matches!(
        recv(&mut early).await,
        ServerMessage::StateChange { ref id, .. } if id == "a"
    ));

    let mut late = connect_viewer(t.addr).await;
    store.put_state("b", json!({"value": 2})).await;

    match recv(&mut late).await {
        ServerMessage::StateChange { id, .. } => assert_eq!(id, "b"),
        other => panic!("unexpected message: {:?}", other),
    }

    // The snapshot still contains the earlier change.
    send(&mut late, ClientMessage::GetStates { request_id: 9 }).await;
    let states = result_of(recv(&mut late).await, 9).unwrap();
    assert_eq!(states["a"], json!({"value": 1}));

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_extend_object_merges_and_pushes_document() {
    let store = Arc::new(MemoryStore::new());
    store
        .put_object("dev.0", json!({"common": {"name": "Lamp", "role": "light"}}))
        .await;
    let mut t = start_bridge(store, false).await;

    let mut viewer = connect_viewer(t.addr).await;
    send(
        &mut viewer,
        ClientMessage::ExtendObject {
            request_id: None,
            id: "dev.0".to_string(),
            patch: json!({"common": {"name": "Kitchen"}}),
        },
    )
    .await;

    match recv(&mut viewer).await {
        ServerMessage::ObjectChange { id, doc } => {
            assert_eq!(id, "dev.0");
            assert_eq!(doc["common"]["name"], "Kitchen");
            assert_eq!(doc["common"]["role"], "light");
            assert_eq!(doc["_id"], "dev.0");
        }
        other => panic!("unexpected message: {:?}", other),
    }

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_store_rejection_reaches_only_requester() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, false).await;

    let mut a = connect_viewer(t.addr).await;
    let mut b = connect_viewer(t.addr).await;

    send(
        &mut a,
        ClientMessage::ExtendObject {
            request_id: Some(3),
            id: "dev.0".to_string(),
            patch: json!(5),
        },
    )
    .await;
    assert!(result_of(recv(&mut a).await, 3).is_err());
    assert_eq!(recv_within(&mut b, Duration::from_millis(200)).await, None);

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_unreadable_frame_gets_error_message() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, false).await;

    let mut viewer = connect_viewer(t.addr).await;
    viewer
        .send(Message::Text(r#"{"type":"drop_tables"}"#.into()))
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut viewer).await,
        ServerMessage::Error { .. }
    ));

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_viewer_count_follows_connections() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, false).await;

    let a = connect_viewer(t.addr).await;
    let _b = connect_viewer(t.addr).await;
    assert_eq!(t.bridge.hub().viewer_count(), 2);

    drop(a);
    let mut remaining = t.bridge.hub().viewer_count();
    for _ in 0..50 {
        if remaining == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        remaining = t.bridge.hub().viewer_count();
    }
    assert_eq!(remaining, 1);

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_socket_requires_session_when_auth_enabled() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, true).await;
    let url = format!("ws://{}/socket", t.addr);

    assert!(connect_async(url.as_str()).await.is_err());

    let token = t.bridge.gate().sessions().create("admin");
    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "Cookie",
        format!("statemirror.sid={}", token).parse().unwrap(),
    );
    let (mut viewer, _) = connect_async(request).await.expect("authorized connect");
    send(&mut viewer, ClientMessage::GetStates { request_id: 1 }).await;
    assert_eq!(result_of(recv(&mut viewer).await, 1), Ok(json!({})));

    t.bridge.unload().await;
}

#[tokio::test]
async fn test_unload_closes_open_viewers() {
    let store = Arc::new(MemoryStore::new());
    let mut t = start_bridge(store, false).await;

    let mut viewer = connect_viewer(t.addr).await;
    t.bridge.unload().await;

    assert_eq!(recv_within(&mut viewer, Duration::from_secs(2)).await, None);
}
