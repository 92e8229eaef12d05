//! Fan-out of server messages to every session of a document.
//!
//! One tokio broadcast channel per document. Messages are encoded once and
//! shared behind an `Arc`; each connection filters by [`Envelope::is_for`].
//! A receiver that falls more than `capacity` messages behind lags and the
//! skipped messages are counted as dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Participant, ProtocolError, ServerMessage};
use crate::room::Recipient;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// An encoded message and who it is for.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session the message originates from.
    pub from: Uuid,
    pub recipient: Recipient,
    pub text: String,
}

impl Envelope {
    pub fn is_for(&self, session_id: Uuid) -> bool {
        match self.recipient {
            Recipient::All => true,
            Recipient::Others => self.from != session_id,
            Recipient::Sender => self.from == session_id,
        }
    }
}

/// Lock-free counters.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Sessions of one document and their shared channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    /// Connected sessions, by session id
    peers: Arc<RwLock<HashMap<Uuid, Participant>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Add a session. Returns the receiver it should read from.
    pub async fn add_peer(&self, participant: Participant) -> broadcast::Receiver<Arc<Envelope>> {
        let mut peers = self.peers.write().await;
        peers.insert(participant.session_id, participant);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<Participant> {
        let mut peers = self.peers.write().await;
        peers.remove(session_id)
    }

    /// Encode and send a message. Returns the number of receivers, which
    /// includes sessions the envelope is not meant for.
    pub fn broadcast(
        &self,
        from: Uuid,
        recipient: Recipient,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let envelope = Envelope {
            from,
            recipient,
            text: msg.encode()?,
        };
        Ok(self.broadcast_envelope(Arc::new(envelope)))
    }

    /// Send an already encoded envelope.
    pub fn broadcast_envelope(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A receiver skipped `n` messages.
    pub fn record_lag(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<Participant> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }
}
