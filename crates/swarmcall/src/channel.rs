//! Collaborator boundaries and the per-connection channel adapter.
//!
//! Two external services sit underneath a session: a discovery service
//! that finds peers sharing a rendezvous key and yields one raw
//! bidirectional stream per peer, and a wire codec that multiplexes such
//! a stream into request/reply calls plus a typed extension side channel.
//! Both are consumed through the traits defined here; [`PeerChannel`]
//! adapts a [`WireChannel`] to the session's dispatch conventions.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::warn;

use swarmcall_types::error::{SwarmError, SwarmResult};
use swarmcall_types::manifest::{Manifest, MANIFEST_EXTENSION};

/// A raw bidirectional byte stream produced by discovery.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawStream for T {}

/// Boxed stream handed from discovery to the wire codec.
pub type PeerStream = Box<dyn RawStream>;

/// Lifecycle events reported by the discovery service.
pub enum DiscoveryEvent {
    /// A new peer sharing the rendezvous key appeared, with its raw stream.
    /// The id is assumed unique while the peer stays connected; a reused id
    /// after disconnect is a new logical peer.
    Peer {
        /// Peer identity assigned by discovery.
        id: String,
        /// The raw stream connecting us to that peer.
        stream: PeerStream,
    },
    /// A non-fatal discovery fault.
    Error(SwarmError),
    /// Discovery shut down; no further events follow.
    Closed,
}

impl std::fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer { id, .. } => f.debug_struct("Peer").field("id", id).finish_non_exhaustive(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Swarm-membership service: yields one raw stream per discovered peer.
///
/// Implementations own their signaling and NAT traversal; the session only
/// consumes the event stream. [`crate::mem::MemorySwarm`] provides an
/// in-process implementation for tests and single-process wiring.
#[async_trait]
pub trait Discovery: Send + 'static {
    /// Wait for the next lifecycle event. Returns `None` once the event
    /// stream is exhausted (treated like `Closed`).
    async fn next_event(&mut self) -> Option<DiscoveryEvent>;

    /// Stop discovering. `Closed` is still delivered through the event
    /// stream afterwards.
    fn close(&mut self);
}

/// Raw inbound request record from the wire codec.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Correlation id assigned by the calling side's codec.
    pub id: u64,
    /// Command name being invoked.
    pub command: String,
    /// Positional arguments exactly as sent by the caller.
    pub arguments: Vec<Value>,
}

/// One-shot reply handle passed to command handlers.
///
/// Consuming it settles the caller's in-flight call; dropping it without
/// replying makes the codec report a handler fault to the caller.
pub struct ReplySink {
    tx: oneshot::Sender<Result<Value, String>>,
}

impl ReplySink {
    pub(crate) fn new(tx: oneshot::Sender<Result<Value, String>>) -> Self {
        Self { tx }
    }

    /// Resolve the caller's call with a result value.
    pub fn resolve(self, value: Value) {
        let _ = self.tx.send(Ok(value));
    }

    /// Fail the caller's call. The error crosses the wire as its display
    /// string and surfaces on the caller as [`SwarmError::Remote`].
    pub fn reject(self, error: SwarmError) {
        let _ = self.tx.send(Err(error.to_string()));
    }
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplySink")
    }
}

/// Handler installed for a named command.
///
/// Receives the caller's positional arguments, a reply sink, and the raw
/// request record. When the caller sent no arguments a `Value::Null`
/// placeholder still occupies the first slot, so handler arity stays
/// stable across callers. That convention is shared with peer
/// implementations and must not change.
pub type CommandHandler =
    Arc<dyn Fn(Vec<Value>, ReplySink, InboundRequest) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap a plain `async fn(Vec<Value>) -> SwarmResult<Value>` closure as a
/// [`CommandHandler`], replying with its return value.
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwarmResult<Value>> + Send + 'static,
{
    Arc::new(move |args, reply, _req| {
        let fut = f(args);
        Box::pin(async move {
            match fut.await {
                Ok(value) => reply.resolve(value),
                Err(e) => reply.reject(e),
            }
        })
    })
}

/// Codec-level inbound dispatch callback, installed per command name.
pub type RawHandler = Arc<dyn Fn(InboundRequest, ReplySink) + Send + Sync>;

/// A typed frame on the extension side channel.
#[derive(Debug, Clone)]
pub struct ExtensionFrame {
    /// Extension type id.
    pub ext: u32,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Per-connection multiplexed request/reply channel built by the wire
/// codec over one raw stream.
///
/// The codec owns correlation of replies to calls; `call` resolves when the
/// matching reply arrives, independent of other in-flight calls.
#[async_trait]
pub trait WireChannel: Send + Sync + 'static {
    /// Install inbound dispatch for a named command.
    fn install(&self, name: &str, handler: RawHandler);

    /// Issue an outbound call and await the matching reply.
    async fn call(&self, name: &str, args: Vec<Value>) -> SwarmResult<Value>;

    /// Send a typed extension frame.
    fn send_extension(&self, ext: u32, payload: Bytes) -> SwarmResult<()>;

    /// Subscribe to inbound extension frames.
    fn extensions(&self) -> broadcast::Receiver<ExtensionFrame>;

    /// Watch that flips to `true` when the channel and its stream die.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Whether the channel has already closed.
    fn is_closed(&self) -> bool;

    /// Tear the channel down, destroying the underlying stream. In-flight
    /// calls fail with [`SwarmError::PeerUnavailable`]. Idempotent.
    fn destroy(&self);
}

/// Factory turning a discovered raw stream into a live [`WireChannel`].
pub trait WireCodec: Send + Sync + 'static {
    /// Build a channel over the stream.
    fn channel(&self, stream: PeerStream) -> Arc<dyn WireChannel>;
}

/// Session-facing adapter over a [`WireChannel`].
///
/// Bridges the codec's raw request records into the command handler
/// calling convention and owns the manifest side of the connection.
#[derive(Clone)]
pub struct PeerChannel {
    raw: Arc<dyn WireChannel>,
}

impl PeerChannel {
    pub fn new(raw: Arc<dyn WireChannel>) -> Self {
        Self { raw }
    }

    /// Install a command, adapting the codec's raw record into the
    /// `(args, reply, request)` handler convention.
    pub fn install(&self, name: &str, handler: CommandHandler) {
        self.raw.install(
            name,
            Arc::new(move |req: InboundRequest, reply: ReplySink| {
                let mut args = req.arguments.clone();
                if args.is_empty() {
                    // Keep handler arity stable when the caller sent nothing.
                    args.push(Value::Null);
                }
                tokio::spawn(handler(args, reply, req));
            }),
        );
    }

    /// Call a remote command. Fails immediately with
    /// [`SwarmError::PeerUnavailable`] when the channel already closed,
    /// without touching the network.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> SwarmResult<Value> {
        if self.raw.is_closed() {
            return Err(SwarmError::PeerUnavailable(format!(
                "channel closed before calling '{name}'"
            )));
        }
        self.raw.call(name, args).await
    }

    /// Send the local manifest over the reserved extension channel.
    pub fn send_manifest(&self, manifest: &Manifest) -> SwarmResult<()> {
        let payload = manifest
            .encode()
            .map_err(|e| SwarmError::Codec(e.to_string()))?;
        self.raw.send_extension(MANIFEST_EXTENSION, payload)
    }

    /// Stream of decoded peer manifests arriving on the reserved extension
    /// type. Undecodable frames are dropped with a warning; frames of
    /// other extension types are ignored.
    pub fn manifests(&self) -> mpsc::UnboundedReceiver<Manifest> {
        let mut frames = self.raw.extensions();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) if frame.ext == MANIFEST_EXTENSION => {
                        match Manifest::decode(&frame.payload) {
                            Ok(manifest) => {
                                if tx.send(manifest).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping undecodable manifest frame");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "extension subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Watch that flips to `true` on channel teardown.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.raw.closed()
    }

    /// Whether the channel has already closed.
    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    /// Tear down the channel and its stream.
    pub fn destroy(&self) {
        self.raw.destroy();
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("closed", &self.raw.is_closed())
            .finish()
    }
}
