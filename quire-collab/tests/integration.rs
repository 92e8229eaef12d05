//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use quire_collab::client::{ConnectionState, SyncClient};
use quire_collab::config::ServerConfig;
use quire_collab::protocol::{ClientMessage, ServerMessage};
use quire_collab::server::SyncServer;
use quire_collab::session::CollabSession;
use quire_core::Document;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return it and the port.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    }));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run_on(listener).await.unwrap();
    });
    (server, port)
}

async fn seeded_server(doc_id: Uuid) -> (Arc<SyncServer>, String) {
    let (server, port) = start_test_server(ServerConfig::default()).await;
    server
        .open_document(doc_id, Document::from_paragraphs(&["Hello world"]), 0)
        .await;
    (server, format!("ws://127.0.0.1:{port}"))
}

/// Wait until the session satisfies `pred`.
async fn wait_until<F>(client: &SyncClient, what: &str, pred: F)
where
    F: Fn(&CollabSession) -> bool,
{
    let reached = timeout(Duration::from_secs(5), async {
        loop {
            if pred(&*client.session().lock().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn wait_for_text(client: &SyncClient, text: &str) {
    wait_until(client, text, |s| {
        s.doc().text_content() == text && !s.state().has_unconfirmed()
    })
    .await;
}

async fn connect_client(url: &str, doc_id: Uuid, name: &str) -> SyncClient {
    let mut client = SyncClient::new(doc_id, Uuid::new_v4(), name, url);
    client.connect().await.unwrap();
    client
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server did not answer")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::text(msg.encode().unwrap())).await.unwrap();
}

fn subscribe(doc_id: Uuid, name: &str) -> ClientMessage {
    ClientMessage::Subscribe {
        doc_id,
        id: Uuid::new_v4(),
        name: name.to_string(),
        connection: 0,
    }
}

#[tokio::test]
async fn test_server_welcomes_connections() {
    let (server, port) = start_test_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    assert!(matches!(recv(&mut ws).await, ServerMessage::Welcome { .. }));
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_subscribe_sends_document_and_participants() {
    let doc_id = Uuid::new_v4();
    let (_server, url) = seeded_server(doc_id).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let session_id = match recv(&mut ws).await {
        ServerMessage::Welcome { session_id } => session_id,
        other => panic!("Expected welcome, got {other:?}"),
    };

    send(&mut ws, &subscribe(doc_id, "Alice")).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Subscribed);
    match recv(&mut ws).await {
        ServerMessage::DocData(data) => {
            assert_eq!(data.doc.v, 0);
            assert!(data.m.is_none());
        }
        other => panic!("Expected doc_data, got {other:?}"),
    }
    match recv(&mut ws).await {
        ServerMessage::Connections { participant_list } => {
            assert_eq!(participant_list.len(), 1);
            assert_eq!(participant_list[0].session_id, session_id);
        }
        other => panic!("Expected connections, got {other:?}"),
    }
}

#[tokio::test]
async fn test_messages_before_subscribe_are_refused() {
    let (_server, port) = start_test_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let _welcome = recv(&mut ws).await;

    send(&mut ws, &ClientMessage::CheckVersion { v: 0 }).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));
}

#[tokio::test]
async fn test_full_room_refuses_subscription() {
    let (_server, port) = start_test_server(ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    })
    .await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _welcome = recv(&mut first).await;
    send(&mut first, &subscribe(doc_id, "Alice")).await;
    assert_eq!(recv(&mut first).await, ServerMessage::Subscribed);

    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _welcome = recv(&mut second).await;
    send(&mut second, &subscribe(doc_id, "Bob")).await;
    assert!(matches!(recv(&mut second).await, ServerMessage::Error { .. }));
}

#[tokio::test]
async fn test_client_connects_and_loads_document() {
    let doc_id = Uuid::new_v4();
    let (_server, url) = seeded_server(doc_id).await;

    let client = connect_client(&url, doc_id, "Alice").await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    wait_for_text(&client, "Hello world").await;
    assert_eq!(client.document().await.0, 0);
}

#[tokio::test]
async fn test_edit_reaches_other_client() {
    let doc_id = Uuid::new_v4();
    let (server, url) = seeded_server(doc_id).await;

    let alice = connect_client(&url, doc_id, "Alice").await;
    let bob = connect_client(&url, doc_id, "Bob").await;
    wait_for_text(&alice, "Hello world").await;
    wait_for_text(&bob, "Hello world").await;

    alice
        .edit(|tr| tr.insert_text(12, "!").map(|_| ()))
        .await
        .unwrap();

    wait_for_text(&alice, "Hello world!").await;
    wait_for_text(&bob, "Hello world!").await;
    let (version, doc) = server.document(doc_id).await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(doc.text_content(), "Hello world!");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let doc_id = Uuid::new_v4();
    let (server, url) = seeded_server(doc_id).await;

    let alice = connect_client(&url, doc_id, "Alice").await;
    let bob = connect_client(&url, doc_id, "Bob").await;
    wait_for_text(&alice, "Hello world").await;
    wait_for_text(&bob, "Hello world").await;

    let (a, b) = tokio::join!(
        alice.edit(|tr| tr.insert_text(1, "A").map(|_| ())),
        bob.edit(|tr| tr.insert_text(12, "Z").map(|_| ())),
    );
    a.unwrap();
    b.unwrap();

    wait_for_text(&alice, "AHello worldZ").await;
    wait_for_text(&bob, "AHello worldZ").await;
    let (version, doc) = server.document(doc_id).await.unwrap();
    assert_eq!(version, 2);
    assert_eq!(doc.text_content(), "AHello worldZ");
}

#[tokio::test]
async fn test_offline_edits_merge_on_reconnect() {
    let doc_id = Uuid::new_v4();
    let (server, url) = seeded_server(doc_id).await;

    let mut alice = connect_client(&url, doc_id, "Alice").await;
    let bob = connect_client(&url, doc_id, "Bob").await;
    wait_for_text(&alice, "Hello world").await;
    wait_for_text(&bob, "Hello world").await;

    alice.disconnect().await;
    timeout(Duration::from_secs(2), async {
        while alice.connection_state().await != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Both sides edit while Alice is away
    alice
        .edit(|tr| tr.insert_text(12, "!").map(|_| ()))
        .await
        .unwrap();
    bob.edit(|tr| tr.insert_text(1, ">> ").map(|_| ()))
        .await
        .unwrap();
    wait_for_text(&bob, ">> Hello world").await;

    alice.connect().await.unwrap();
    wait_for_text(&alice, ">> Hello world!").await;
    wait_for_text(&bob, ">> Hello world!").await;

    let (version, doc) = server.document(doc_id).await.unwrap();
    assert_eq!(version, 2);
    assert_eq!(doc.text_content(), ">> Hello world!");
    assert!(!alice.session().lock().await.is_halted());
}
