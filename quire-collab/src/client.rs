//! WebSocket sync client for connecting to the collaboration server.
//!
//! Wraps a [`CollabSession`] with a socket. The session outlives the
//! connection: edits made while disconnected stay unconfirmed and are
//! reconciled when [`SyncClient::connect`] is called again.
//!
//! One background task per connection reads frames, wakes on commands,
//! and ticks so resend and version-check deadlines fire. After each of
//! those it drains [`CollabSession::poll`] into the socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use quire_core::{Document, Schema, Transform, TransformError};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::CollabError;
use crate::failure::OfflineExport;
use crate::protocol::{ProtocolError, ServerMessage};
use crate::session::{CollabSession, SessionConfig, SessionEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Something happened in the session
    Session(SessionEvent),
    /// Offline edits could not be merged. The session is halted and the
    /// offline document is attached.
    MergeFailed {
        reason: String,
        export: Box<OfflineExport>,
    },
}

enum Command {
    /// Local state changed; try to send.
    Flush,
    Disconnect,
}

/// The sync client.
pub struct SyncClient {
    doc_id: Uuid,
    server_url: String,

    session: Arc<Mutex<CollabSession>>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Commands to the connection task
    command_tx: Option<mpsc::Sender<Command>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task). Events are dropped when
    /// the application does not keep up.
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client with the default schema and session settings.
    pub fn new(
        doc_id: Uuid,
        user_id: Uuid,
        user_name: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self::with_config(
            doc_id,
            user_id,
            user_name,
            server_url,
            Arc::new(Schema::default()),
            SessionConfig::default(),
        )
    }

    pub fn with_config(
        doc_id: Uuid,
        user_id: Uuid,
        user_name: impl Into<String>,
        server_url: impl Into<String>,
        schema: Arc<Schema>,
        config: SessionConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let session = CollabSession::new(doc_id, user_id, user_name, schema, config);
        Self {
            doc_id,
            server_url: server_url.into(),
            session: Arc::new(Mutex::new(session)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            command_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and subscribe to the document.
    ///
    /// Spawns the connection task. Calling this again after a disconnect
    /// resubscribes with the same session.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let reconnecting = self.session.lock().await.connection_count() > 0;
        *self.state.write().await = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let url = format!("{}/{}", self.server_url, self.doc_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let subscribe = {
            let mut session = self.session.lock().await;
            session.set_connected(true);
            session.subscribe_message(Instant::now())
        };
        let text = subscribe.encode()?;
        if ws_writer.send(Message::text(text)).await.is_err() {
            self.session.lock().await.set_connected(false);
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(ProtocolError::ConnectionClosed);
        }

        let (command_tx, mut command_rx) = mpsc::channel::<Command>(64);
        self.command_tx = Some(command_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);
        log::info!("Connected to {url}");

        let session = self.session.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    frame = ws_reader.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            _ => continue,
                        };
                        let msg = match ServerMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Ignoring undecodable server message: {e}");
                                continue;
                            }
                        };
                        let result = session.lock().await.handle_message(msg, Instant::now());
                        match result {
                            Ok(Some(event)) => {
                                let _ = event_tx.try_send(SyncEvent::Session(event));
                            }
                            Ok(None) => {}
                            Err(CollabError::MergeFailed { reason, export }) => {
                                let _ = event_tx.try_send(SyncEvent::MergeFailed { reason, export });
                                break;
                            }
                            Err(e) => log::warn!("Failed to handle server message: {e}"),
                        }
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(Command::Flush) => {}
                            Some(Command::Disconnect) | None => {
                                let _ = ws_writer.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    _ = tick.tick() => {}
                }

                if flush(&session, &mut ws_writer).await.is_err() {
                    break;
                }
            }

            // Connection lost
            session.lock().await.set_connected(false);
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.try_send(SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Close the connection. The session and its unconfirmed edits are kept.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Disconnect).await;
        }
    }

    /// Apply a local edit and schedule it for sending.
    pub async fn edit<F>(&self, f: F) -> Result<(), CollabError>
    where
        F: FnOnce(&mut Transform) -> Result<(), TransformError>,
    {
        self.session.lock().await.edit(f)?;
        self.notify().await;
        Ok(())
    }

    /// Move the local selection and share it with other sessions.
    pub async fn set_selection(&self, anchor: usize, head: usize) {
        self.session.lock().await.set_selection(anchor, head);
        self.notify().await;
    }

    /// Ask the server whether our version is current.
    pub async fn check_version(&self) {
        self.session.lock().await.check_version(Instant::now());
        self.notify().await;
    }

    async fn notify(&self) {
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(Command::Flush).await;
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current version and content of the local document.
    pub async fn document(&self) -> (u64, Document) {
        let session = self.session.lock().await;
        (session.version(), session.doc().clone())
    }

    pub fn session(&self) -> &Arc<Mutex<CollabSession>> {
        &self.session
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Send everything the session has queued.
async fn flush<S>(session: &Mutex<CollabSession>, ws_writer: &mut S) -> Result<(), ProtocolError>
where
    S: futures_util::Sink<Message> + Unpin,
{
    loop {
        let next = session.lock().await.poll(Instant::now());
        let Some(msg) = next else {
            return Ok(());
        };
        let text = msg.encode()?;
        ws_writer
            .send(Message::text(text))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "TestUser", "ws://localhost:9090")
    }

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(doc_id, Uuid::new_v4(), "TestUser", "ws://localhost:9090");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        let (version, doc) = client.document().await;
        assert_eq!(version, 0);
        assert_eq!(doc.text_content(), "");
    }

    #[tokio::test]
    async fn test_edit_before_document_fails() {
        let client = client();
        let result = client.edit(|tr| tr.insert_text(1, "x").map(|_| ())).await;
        assert!(matches!(result, Err(CollabError::NoDocument)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = SyncClient::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "TestUser",
            "ws://127.0.0.1:1",
        );
        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.session().lock().await.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
