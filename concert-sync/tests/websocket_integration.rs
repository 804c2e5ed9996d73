//! Integration tests over real WebSocket connections.
//!
//! These tests bind a server on a free local port and connect real clients,
//! exercising the binary framing end to end.

use std::sync::Arc;

use concert_sync::client::{ClientEvent, ClientState, LocalChange, SessionClient};
use concert_sync::config::{ClientConfig, ServerConfig};
use concert_sync::protocol::{JoinRequest, MessageType, SessionMessage};
use concert_sync::server::SessionServer;
use concert_sync::storage::FileSharing;
use concert_sync::transport::{Connector, WsConnector};
use futures_util::{SinkExt, StreamExt};
use tempfile::{tempdir, TempDir};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

/// Start a server on a free port, return its URL.
async fn start_test_server() -> (TempDir, Arc<SessionServer>, String) {
    let dir = tempdir().unwrap();
    let server = SessionServer::open(ServerConfig::for_testing(dir.path())).unwrap();
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(server.clone().serve(listener));
    (dir, server, url)
}

async fn connect_client(url: &str, config: ClientConfig, files: Option<Arc<dyn FileSharing>>) -> SessionClient {
    let client = SessionClient::connect(config, Arc::new(WsConnector::new(url)), files).unwrap();
    timeout(WAIT, client.wait_for_state(ClientState::Synchronized))
        .await
        .expect("client did not synchronize")
        .unwrap();
    client
}

#[tokio::test]
async fn test_raw_join_gets_binary_reply() {
    let (_dir, server, url) = start_test_server().await;
    let session = server.create_session("Level", "MultiUser").await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let join = SessionMessage::join_request(
        Uuid::new_v4(),
        session.id(),
        0,
        &JoinRequest {
            display_name: "raw".into(),
            role: "MultiUser".into(),
        },
    )
    .unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();

    let reply = loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => break SessionMessage::decode(&data).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a binary frame, got {other:?}"),
        }
    };
    assert_eq!(reply.msg_type, MessageType::JoinAccepted);
    assert_eq!(reply.session_id, session.id());
}

#[tokio::test]
async fn test_connector_link_reports_unknown_session() {
    let (_dir, _server, url) = start_test_server().await;
    let mut conn = WsConnector::new(url).connect().await.unwrap();
    conn.send(SessionMessage::join_request(
        Uuid::new_v4(),
        Uuid::new_v4(),
        0,
        &JoinRequest {
            display_name: "raw".into(),
            role: String::new(),
        },
    )
    .unwrap())
    .unwrap();
    let reply = timeout(WAIT, conn.incoming.recv()).await.unwrap().unwrap();
    assert_eq!(reply.msg_type, MessageType::JoinRejected);
    assert_eq!(reply.reason(), "unknown session");
}

#[tokio::test]
async fn test_clients_share_events_over_websocket() {
    let (_dir, server, url) = start_test_server().await;
    let session = server.create_session("Level", "MultiUser").await.unwrap();
    let files: Arc<dyn FileSharing> = server.blob_store();

    let alice = connect_client(&url, ClientConfig::for_testing(session.id(), "Alice", "MultiUser"), Some(files.clone())).await;
    let mut bob = connect_client(&url, ClientConfig::for_testing(session.id(), "Bob", "MultiUser"), Some(files)).await;
    let mut bob_events = bob.take_event_rx().unwrap();

    let seq = alice
        .submit(LocalChange::transaction("spawn Cube1"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(seq, 1);

    let asset = vec![7u8; 4096];
    let seq = alice
        .submit(LocalChange::package("/Game/Props/Crate", asset.clone()))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(seq, 2);

    let mut applied = Vec::new();
    while applied.len() < 2 {
        match timeout(WAIT, bob_events.recv()).await.unwrap() {
            Some(ClientEvent::Applied { event, content }) => applied.push((event.sequence, content)),
            Some(_) => {}
            None => panic!("client closed"),
        }
    }
    assert_eq!(applied, vec![(1, b"spawn Cube1".to_vec()), (2, asset)]);
    assert_eq!(bob.last_applied(), 2);

    let stats = server.stats().await;
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.events_appended, 2);
    assert!(stats.total_connections >= 2);

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
}
