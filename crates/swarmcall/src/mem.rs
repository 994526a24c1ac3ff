//! In-process discovery for tests and single-process wiring.
//!
//! [`MemorySwarm`] plays the role of the external swarm-membership
//! service: sessions that join the same rendezvous key get linked
//! pairwise with in-memory duplex streams. No signaling, no network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Discovery, DiscoveryEvent};
use swarmcall_types::error::SwarmError;

/// Buffer size of each in-memory duplex stream.
const STREAM_BUFFER: usize = 64 * 1024;

struct Member {
    id: String,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<Member>>,
}

/// An in-process swarm hub.
#[derive(Clone, Default)]
pub struct MemorySwarm {
    state: Arc<Mutex<HubState>>,
}

impl MemorySwarm {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the swarm under a rendezvous key. Every other member already
    /// joined under the same key is reported as a peer immediately, on
    /// both sides.
    pub fn join(&self, key: &str) -> MemoryMembership {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let room = state.rooms.entry(key.to_string()).or_default();
        for other in room.iter() {
            let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
            let _ = other.tx.send(DiscoveryEvent::Peer {
                id: id.clone(),
                stream: Box::new(theirs),
            });
            let _ = tx.send(DiscoveryEvent::Peer {
                id: other.id.clone(),
                stream: Box::new(ours),
            });
        }
        room.push(Member {
            id: id.clone(),
            tx: tx.clone(),
        });
        debug!(key, member = %id, members = room.len(), "joined memory swarm");

        MemoryMembership {
            id,
            key: key.to_string(),
            state: Arc::clone(&self.state),
            rx,
            tx,
            closed: false,
        }
    }

    /// Deliver a discovery-level error to every member joined under the
    /// key. Test affordance for exercising non-fatal `Error` events.
    pub fn inject_error(&self, key: &str, message: &str) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = state.rooms.get(key) {
            for member in room {
                let _ = member
                    .tx
                    .send(DiscoveryEvent::Error(SwarmError::Transport(
                        message.to_string(),
                    )));
            }
        }
    }

    /// Number of members currently joined under the key.
    pub fn member_count(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.rooms.get(key).map(|r| r.len()).unwrap_or(0)
    }
}

/// One session's membership in a [`MemorySwarm`].
pub struct MemoryMembership {
    id: String,
    key: String,
    state: Arc<Mutex<HubState>>,
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
    closed: bool,
}

impl MemoryMembership {
    /// The id under which other members see this one.
    pub fn member_id(&self) -> &str {
        &self.id
    }

    fn leave(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = state.rooms.get_mut(&self.key) {
            room.retain(|m| m.id != self.id);
            if room.is_empty() {
                state.rooms.remove(&self.key);
            }
        }
        debug!(key = %self.key, member = %self.id, "left memory swarm");
    }
}

#[async_trait]
impl Discovery for MemoryMembership {
    async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.leave();
        let _ = self.tx.send(DiscoveryEvent::Closed);
    }
}

impl Drop for MemoryMembership {
    fn drop(&mut self) {
        self.leave();
    }
}
