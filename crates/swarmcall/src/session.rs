//! Session orchestration: discovery driving, peer table, lifecycle events.
//!
//! A [`Session`] owns the local [`CommandRegistry`] and the peer table.
//! One driver task consumes discovery events; each discovered stream gets
//! a channel, the current command set, and a manifest negotiation task.
//! Lifecycle notifications go out on a broadcast bus as typed
//! [`SessionEvent`] values.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

use crate::channel::{
    CommandHandler, Discovery, DiscoveryEvent, PeerChannel, PeerStream, WireCodec,
};
use crate::proxy::PeerProxy;
use crate::registry::CommandRegistry;
use swarmcall_types::error::{SwarmError, SwarmResult};
use swarmcall_types::manifest::Manifest;

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity attached to this session. Informational; peer ids on the
    /// wire are assigned by discovery.
    pub session_id: String,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            event_capacity: 64,
        }
    }
}

/// Lifecycle notifications emitted by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A raw stream was established with a peer (pre-negotiation).
    Connection {
        /// Discovery-assigned peer id.
        peer_id: String,
    },
    /// A manifest arrived from a peer.
    Manifest {
        /// Discovery-assigned peer id.
        peer_id: String,
        /// The advertised command set.
        manifest: Manifest,
    },
    /// Negotiation completed; the proxy is ready for use. Emitted once per
    /// peer connection — later manifest refreshes extend the same proxy
    /// in place instead.
    Peer {
        /// Discovery-assigned peer id.
        peer_id: String,
        /// Callable handle bound to the peer.
        proxy: PeerProxy,
    },
    /// A non-fatal discovery error.
    Error {
        /// Rendered error message.
        message: String,
    },
    /// The session fully tore down. Emitted exactly once.
    Close,
}

/// Negotiation state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Stream established, waiting for the peer's manifest.
    Negotiating,
    /// Manifest received and proxy constructed.
    Ready,
}

/// Point-in-time snapshot of one peer connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Discovery-assigned peer id.
    pub id: String,
    /// Negotiation state.
    pub state: PeerState,
    /// Commands the peer has advertised so far.
    pub commands: Vec<String>,
    /// When the stream was established.
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Closing,
    Closed,
}

struct PeerConnection {
    id: String,
    /// Distinguishes this connection from earlier ones under a reused id.
    generation: u64,
    channel: PeerChannel,
    manifest: Option<Manifest>,
    proxy: Option<PeerProxy>,
    state: PeerState,
    connected_at: DateTime<Utc>,
}

/// A symmetric RPC session over a discovery service.
///
/// Cheap to clone; all clones share the same registry, peer table, and
/// event bus. Dropping every clone does not close the session — call
/// [`close`](Self::close) or [`destroy`](Self::destroy).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    codec: Arc<dyn WireCodec>,
    registry: Mutex<CommandRegistry>,
    peers: Mutex<HashMap<String, PeerConnection>>,
    peer_generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
    close_signal: Notify,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl Session {
    /// Start a session over a discovery service and wire codec.
    pub fn connect<D: Discovery>(
        discovery: D,
        codec: Arc<dyn WireCodec>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            config,
            codec,
            registry: Mutex::new(CommandRegistry::new()),
            peers: Mutex::new(HashMap::new()),
            peer_generation: AtomicU64::new(0),
            events,
            state: Mutex::new(SessionState::Active),
            close_signal: Notify::new(),
            closed_tx,
            closed_rx,
        });

        info!(session = %inner.config.session_id, "session started");
        tokio::spawn(drive(Arc::clone(&inner), discovery));
        Self { inner }
    }

    /// This session's configured identity.
    pub fn session_id(&self) -> &str {
        &self.inner.config.session_id
    }

    /// Register a local command and expose it to every connected peer.
    ///
    /// Peers connected later see it at handshake; peers connected now get
    /// the command installed on their channel and a manifest refresh so
    /// their live proxies grow the new method. Re-registering an existing
    /// name is a no-op (the first handler stays active) and triggers no
    /// refresh.
    pub fn command(&self, name: &str, handler: CommandHandler) -> SwarmResult<()> {
        self.commands(vec![(name.to_string(), handler)])
    }

    /// Register a batch of commands, refreshing peer manifests once.
    ///
    /// Fails with [`SwarmError::Closed`] once the session has torn down.
    pub fn commands<I>(&self, pairs: I) -> SwarmResult<()>
    where
        I: IntoIterator<Item = (String, CommandHandler)>,
    {
        if self.is_closed() {
            return Err(SwarmError::Closed);
        }
        let (added, manifest) = {
            let mut registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            let added = registry.register_all(pairs)?;
            (added, registry.manifest())
        };
        if added.is_empty() {
            return Ok(());
        }
        debug!(session = %self.inner.config.session_id, commands = ?added, "commands registered");

        let registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        for conn in peers.values() {
            for name in &added {
                if let Some(handler) = registry.get(name) {
                    conn.channel.install(name, handler);
                }
            }
            if let Err(e) = conn.channel.send_manifest(&manifest) {
                warn!(peer = %conn.id, error = %e, "manifest refresh failed");
            }
        }
        Ok(())
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the local manifest.
    pub fn manifest(&self) -> Manifest {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .manifest()
    }

    /// Proxy for a negotiated peer, if it reached `Ready`.
    pub fn peer(&self, id: &str) -> Option<PeerProxy> {
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(id).and_then(|c| c.proxy.clone())
    }

    /// Snapshot of all current peer connections.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .map(|c| PeerInfo {
                id: c.id.clone(),
                state: c.state,
                commands: c
                    .manifest
                    .as_ref()
                    .map(|m| m.commands.clone())
                    .unwrap_or_default(),
                connected_at: c.connected_at,
            })
            .collect()
    }

    /// Whether the session has fully closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_rx.borrow()
    }

    /// Shut the session down and wait until teardown completes: discovery
    /// stops, every live peer channel and stream is destroyed, the peer
    /// table empties, and `Close` is emitted exactly once. Safe to call
    /// repeatedly; later calls just wait.
    pub async fn close(&self) {
        self.request_close();
        let mut closed = self.inner.closed_rx.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    /// Fire-and-forget alias for [`close`](Self::close).
    pub fn destroy(&self) {
        self.request_close();
    }

    fn request_close(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Active {
            *state = SessionState::Closing;
            self.inner.close_signal.notify_one();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.config.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn on_peer(self: &Arc<Self>, id: String, stream: PeerStream) {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != SessionState::Active {
                debug!(peer = %id, "ignoring peer discovered during shutdown");
                return;
            }
        }

        let channel = PeerChannel::new(self.codec.channel(stream));
        let generation = self.peer_generation.fetch_add(1, Ordering::Relaxed);

        // Install every current command before announcing the manifest, so
        // inbound calls racing the handshake still resolve. Registry and
        // peer-table locks are held together (same order as `commands`):
        // a concurrent registration either lands in this snapshot or finds
        // the entry in the table and refreshes it itself.
        {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            for (name, handler) in registry.iter() {
                channel.install(name, handler.clone());
            }
            let conn = PeerConnection {
                id: id.clone(),
                generation,
                channel: channel.clone(),
                manifest: None,
                proxy: None,
                state: PeerState::Negotiating,
                connected_at: Utc::now(),
            };
            if let Some(stale) = peers.insert(id.clone(), conn) {
                // A reused id is a new logical peer; the old entry's stream
                // is torn down.
                warn!(peer = %id, "replacing stale connection for reused peer id");
                stale.channel.destroy();
            }
            if let Err(e) = channel.send_manifest(&registry.manifest()) {
                warn!(peer = %id, error = %e, "failed to send manifest");
            }
        }

        debug!(peer = %id, "peer stream established");
        self.emit(SessionEvent::Connection { peer_id: id.clone() });

        // One negotiation task per connection: manifests in, close out.
        let inner = Arc::clone(self);
        let mut manifests = channel.manifests();
        let mut closed = channel.closed();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    manifest = manifests.recv() => match manifest {
                        Some(manifest) => inner.on_manifest(&id, manifest),
                        None => break,
                    },
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                }
            }
            inner.on_peer_closed(&id, generation);
        });
    }

    fn on_manifest(&self, peer_id: &str, manifest: Manifest) {
        self.emit(SessionEvent::Manifest {
            peer_id: peer_id.to_string(),
            manifest: manifest.clone(),
        });

        let new_proxy = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            let Some(conn) = peers.get_mut(peer_id) else {
                return;
            };
            conn.manifest = Some(manifest.clone());
            match &conn.proxy {
                Some(proxy) => {
                    let added = proxy.extend(&manifest);
                    if !added.is_empty() {
                        debug!(peer = %peer_id, commands = ?added, "manifest refresh extended live proxy");
                    }
                    None
                }
                None => {
                    let proxy =
                        PeerProxy::bind(peer_id.to_string(), conn.channel.clone(), &manifest);
                    conn.proxy = Some(proxy.clone());
                    conn.state = PeerState::Ready;
                    Some(proxy)
                }
            }
        };

        if let Some(proxy) = new_proxy {
            info!(peer = %peer_id, commands = proxy.commands().len(), "peer negotiated");
            self.emit(SessionEvent::Peer {
                peer_id: peer_id.to_string(),
                proxy,
            });
        }
    }

    fn on_peer_closed(&self, peer_id: &str, generation: u64) {
        let removed = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            // The id may already belong to a replacement connection; only
            // the generation whose close was observed gets removed.
            match peers.get(peer_id) {
                Some(conn) if conn.generation == generation => peers.remove(peer_id),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            conn.channel.destroy();
            debug!(peer = %peer_id, generation, "peer connection removed");
        }
    }

    fn finish_close(&self) {
        let drained: Vec<PeerConnection> = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            conn.channel.destroy();
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = SessionState::Closed;
        }
        let _ = self.closed_tx.send(true);
        self.emit(SessionEvent::Close);
        info!(session = %self.config.session_id, peers = drained.len(), "session closed");
    }
}

async fn drive<D: Discovery>(inner: Arc<SessionInner>, mut discovery: D) {
    let mut close_requested = false;
    loop {
        tokio::select! {
            event = discovery.next_event() => match event {
                Some(DiscoveryEvent::Peer { id, stream }) => inner.on_peer(id, stream),
                Some(DiscoveryEvent::Error(e)) => {
                    warn!(session = %inner.config.session_id, error = %e, "discovery error");
                    inner.emit(SessionEvent::Error {
                        message: e.to_string(),
                    });
                }
                Some(DiscoveryEvent::Closed) | None => break,
            },
            _ = inner.close_signal.notified(), if !close_requested => {
                close_requested = true;
                discovery.close();
            }
        }
    }
    inner.finish_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::handler;
    use crate::codec::JsonCodec;
    use serde_json::Value;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert!(!config.session_id.is_empty());
        assert!(config.event_capacity > 0);
    }

    /// Discovery that never finds anyone and closes on request.
    struct Idle {
        closed: Option<tokio::sync::mpsc::UnboundedReceiver<()>>,
        close_tx: tokio::sync::mpsc::UnboundedSender<()>,
    }

    impl Idle {
        fn new() -> Self {
            let (close_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Self {
                closed: Some(rx),
                close_tx,
            }
        }
    }

    #[async_trait::async_trait]
    impl Discovery for Idle {
        async fn next_event(&mut self) -> Option<DiscoveryEvent> {
            match self.closed.as_mut() {
                Some(rx) => {
                    rx.recv().await;
                    self.closed = None;
                    Some(DiscoveryEvent::Closed)
                }
                None => None,
            }
        }

        fn close(&mut self) {
            let _ = self.close_tx.send(());
        }
    }

    #[tokio::test]
    async fn test_command_validation_is_synchronous() {
        let session = Session::connect(Idle::new(), Arc::new(JsonCodec), SessionConfig::default());
        let err = session
            .command("", handler(|_| async { Ok(Value::Null) }))
            .unwrap_err();
        assert!(matches!(
            err,
            swarmcall_types::error::SwarmError::InvalidArgument(_)
        ));
        assert!(session.manifest().is_empty());
        session.close().await;
    }

    /// Discovery that replays a fixed list of events, then closes on
    /// request.
    struct Replay {
        events: std::collections::VecDeque<DiscoveryEvent>,
        close_tx: tokio::sync::mpsc::UnboundedSender<()>,
        close_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
    }

    impl Replay {
        fn new(events: Vec<DiscoveryEvent>) -> Self {
            let (close_tx, close_rx) = tokio::sync::mpsc::unbounded_channel();
            Self {
                events: events.into(),
                close_tx,
                close_rx,
            }
        }
    }

    #[async_trait::async_trait]
    impl Discovery for Replay {
        async fn next_event(&mut self) -> Option<DiscoveryEvent> {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            self.close_rx.recv().await;
            Some(DiscoveryEvent::Closed)
        }

        fn close(&mut self) {
            let _ = self.close_tx.send(());
        }
    }

    #[tokio::test]
    async fn test_reused_peer_id_keeps_replacement_connection() {
        use std::time::Duration;

        // The same id twice, back to back: a disconnect followed by a fast
        // reconnect. The first entry's cleanup must not tear down the
        // second connection.
        let (first_ours, first_theirs) = tokio::io::duplex(64 * 1024);
        let (second_ours, second_theirs) = tokio::io::duplex(64 * 1024);
        let discovery = Replay::new(vec![
            DiscoveryEvent::Peer {
                id: "dup".to_string(),
                stream: Box::new(first_ours),
            },
            DiscoveryEvent::Peer {
                id: "dup".to_string(),
                stream: Box::new(second_ours),
            },
        ]);
        let session = Session::connect(discovery, Arc::new(JsonCodec), SessionConfig::default());

        let stale = PeerChannel::new(JsonCodec.channel(Box::new(first_theirs)));
        let fresh = PeerChannel::new(JsonCodec.channel(Box::new(second_theirs)));

        // The replaced connection's stream is destroyed...
        let mut stale_closed = stale.closed();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*stale_closed.borrow() {
                if stale_closed.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("stale connection never torn down");

        // ...and after its cleanup task has run, the replacement survives.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!fresh.is_closed());
        assert_eq!(session.peers().len(), 1);
        assert_eq!(session.peers()[0].id, "dup");

        session.close().await;
    }

    #[tokio::test]
    async fn test_registration_after_close_is_rejected() {
        let session = Session::connect(Idle::new(), Arc::new(JsonCodec), SessionConfig::default());
        session.close().await;

        let err = session
            .command("late", handler(|_| async { Ok(Value::Null) }))
            .unwrap_err();
        assert!(matches!(err, swarmcall_types::error::SwarmError::Closed));
        assert!(session.manifest().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_once() {
        let session = Session::connect(Idle::new(), Arc::new(JsonCodec), SessionConfig::default());
        let mut events = session.subscribe();

        session.close().await;
        session.close().await;
        assert!(session.is_closed());

        let mut close_count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Close) {
                close_count += 1;
            }
        }
        assert_eq!(close_count, 1);
    }
}
