//! WebSocket sync server with one authoritative room per document.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── DocumentRoom (doc, version, history)
//!            ├── subscribe (doc_id) ─┤
//! Client B ──┘                       └── BroadcastGroup
//!                                            │
//!                          ┌─────────────────┼─────────────────┐
//!                          ▼                 ▼                 ▼
//!                       Client A          Client B          Client C
//! ```
//!
//! A connection is greeted with `welcome`, joins a room with `subscribe`,
//! and from then on every client message is handed to the room. Replies
//! for the sender go straight to its socket; messages for others travel
//! through the room's broadcast group.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use quire_core::{Document, Schema};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::config::ServerConfig;
use crate::protocol::{salvage_rid, ClientMessage, Participant, ServerMessage};
use crate::room::{DocumentRoom, Outgoing, Recipient};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// A document room and its fan-out channel.
struct RoomHandle {
    room: DocumentRoom,
    broadcast: Arc<BroadcastGroup>,
}

type Rooms = Arc<RwLock<HashMap<Uuid, RoomHandle>>>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    schema: Arc<Schema>,
    /// Document rooms: doc_id → room
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            schema: Arc::new(Schema::default()),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Use a schema other than the default one.
    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = schema;
        self
    }

    /// Start a document room with existing content. Rooms are otherwise
    /// created empty on the first subscription.
    pub async fn open_document(&self, doc_id: Uuid, doc: Document, version: u64) {
        let room = DocumentRoom::with_document(
            doc_id,
            self.schema.clone(),
            doc,
            version,
            self.config.history_length,
            self.config.max_peers_per_room,
        );
        let handle = RoomHandle {
            room,
            broadcast: Arc::new(BroadcastGroup::new(self.config.broadcast_capacity)),
        };
        let mut rooms = self.rooms.write().await;
        rooms.insert(doc_id, handle);
        self.stats.write().await.active_rooms = rooms.len();
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let schema = self.schema.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config, schema).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        schema: Arc<Schema>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let session_id = Uuid::new_v4();
        log::info!("WebSocket connection established from {addr} as session {session_id}");
        send(&mut ws_sender, &ServerMessage::Welcome { session_id }).await?;

        let mut doc_id: Option<Uuid> = None;
        let mut broadcast_group: Option<Arc<BroadcastGroup>> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => continue,
                        };

                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }

                        let client_msg = match ClientMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                if let Some(rid) = salvage_rid(text.as_str()) {
                                    send(&mut ws_sender, &ServerMessage::RejectDiff { rid }).await?;
                                }
                                continue;
                            }
                        };

                        let outgoing = match (client_msg, doc_id) {
                            (ClientMessage::Subscribe { doc_id: did, id, name, connection }, None) => {
                                let participant = Participant { id, name, session_id };
                                let mut rooms_w = rooms.write().await;
                                let handle = rooms_w.entry(did).or_insert_with(|| {
                                    log::info!("Opening new document room {did}");
                                    RoomHandle {
                                        room: DocumentRoom::new(
                                            did,
                                            schema.clone(),
                                            config.history_length,
                                            config.max_peers_per_room,
                                        ),
                                        broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
                                    }
                                });
                                match handle.room.join(participant.clone(), connection) {
                                    Ok(out) => {
                                        broadcast_rx = Some(handle.broadcast.add_peer(participant).await);
                                        broadcast_group = Some(handle.broadcast.clone());
                                        doc_id = Some(did);
                                        let room_count = rooms_w.len();
                                        drop(rooms_w);
                                        stats.write().await.active_rooms = room_count;
                                        out
                                    }
                                    Err(e) => {
                                        log::warn!("Session {session_id} cannot join document {did}: {e}");
                                        vec![error_to_sender(e.to_string())]
                                    }
                                }
                            }
                            (_, None) => vec![error_to_sender("Not subscribed to a document".into())],
                            (msg, Some(did)) => {
                                let mut rooms_w = rooms.write().await;
                                match rooms_w.get_mut(&did) {
                                    Some(handle) => handle.room.handle_message(msg),
                                    None => vec![error_to_sender("Document is closed".into())],
                                }
                            }
                        };

                        dispatch(outgoing, session_id, &mut ws_sender, broadcast_group.as_deref()).await?;
                    }

                    // Outgoing broadcast message
                    envelope = async {
                        if let Some(ref mut rx) = broadcast_rx {
                            rx.recv().await
                        } else {
                            std::future::pending().await
                        }
                    } => {
                        match envelope {
                            Ok(envelope) => {
                                if envelope.is_for(session_id) {
                                    ws_sender.send(Message::text(envelope.text.clone())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Session {session_id} lagged by {n} messages");
                                if let Some(group) = &broadcast_group {
                                    group.record_lag(n);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: leave the room and tell the others
        if let Some(did) = doc_id {
            let mut rooms_w = rooms.write().await;
            if let Some(handle) = rooms_w.get_mut(&did) {
                handle.broadcast.remove_peer(&session_id).await;
                for out in handle.room.leave(session_id) {
                    if let Err(e) = handle.broadcast.broadcast(session_id, out.to, &out.message) {
                        log::warn!("Failed to announce departure of {session_id}: {e}");
                    }
                }
            }
        }
        stats.write().await.active_connections -= 1;

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Version and content of a document, if its room is open.
    pub async fn document(&self, doc_id: Uuid) -> Option<(u64, Document)> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&doc_id)
            .map(|handle| (handle.room.version(), handle.room.doc().clone()))
    }
}

fn error_to_sender(message: String) -> Outgoing {
    Outgoing {
        to: Recipient::Sender,
        message: ServerMessage::Error { message },
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let text = msg.encode()?;
    ws_sender.send(Message::text(text)).await?;
    Ok(())
}

/// Deliver a room's replies: to our socket directly, or through the group.
async fn dispatch(
    outgoing: Vec<Outgoing>,
    session_id: Uuid,
    ws_sender: &mut WsSink,
    group: Option<&BroadcastGroup>,
) -> Result<(), BoxError> {
    for out in outgoing {
        match (out.to, group) {
            (Recipient::Sender, _) | (_, None) => send(ws_sender, &out.message).await?,
            (to, Some(group)) => {
                group.broadcast(session_id, to, &out.message)?;
            }
        }
    }
    Ok(())
}
