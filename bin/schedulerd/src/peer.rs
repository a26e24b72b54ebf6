//! Registry of connected peers: maps a worker address or client id to the
//! `mspc` channel feeding that connection's writer task (spec §5 "per-peer
//! FIFO, batching window, outbound ordering").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use scheduler_channels::mspc::SendChannel;
use scheduler_trace::warn;

/// Keyed by the peer's wire identity (a worker address or client id,
/// both plain strings on this side of the boundary).
#[derive(Clone)]
pub struct PeerRegistry<T> {
    peers: Arc<Mutex<HashMap<String, SendChannel<T>>>>,
}

impl<T: Clone + 'static> PeerRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, id: String, sender: SendChannel<T>) {
        self.peers.lock().expect("peer registry lock poisoned").insert(id, sender);
    }

    pub fn remove(&self, id: &str) {
        self.peers.lock().expect("peer registry lock poisoned").remove(id);
    }

    /// Best-effort delivery: a peer that disconnected between dispatch and
    /// delivery simply drops the message, matching spec §6's framing of the
    /// transport as opaque and the `release` ask as "best-effort."
    pub fn send(&self, id: &str, message: T) {
        let mut peers = self.peers.lock().expect("peer registry lock poisoned");
        let Some(sender) = peers.get_mut(id) else {
            warn!("dropping message for unknown or disconnected peer {}", id);
            return;
        };
        if sender.try_send(message).is_err() {
            warn!("peer {} send queue closed; dropping message", id);
            peers.remove(id);
        }
    }
}
