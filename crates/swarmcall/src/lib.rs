//! Symmetric peer-to-peer RPC over discovered streams.
//!
//! Every peer both exposes named commands and receives a proxy exposing
//! every command the remote peer advertises. Discovery of peers and the
//! multiplexed wire codec are external collaborators behind traits; this
//! crate owns the session/peer lifecycle and the manifest negotiation
//! sitting between them.
//!
//! ## Architecture
//!
//! - **Session**: orchestrator — drives discovery, owns the command
//!   registry and the peer table, emits lifecycle events
//! - **CommandRegistry**: the local node's exposed procedures
//! - **PeerChannel**: per-connection adapter over the wire codec
//! - **PeerProxy**: callable handle mirroring a peer's manifest
//! - **JsonCodec** / **MemorySwarm**: reference collaborator
//!   implementations (framed JSON codec, in-process discovery)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use swarmcall::{handler, JsonCodec, MemorySwarm, Session, SessionConfig, SessionEvent};
//!
//! # async fn run() -> swarmcall::SwarmResult<()> {
//! let hub = MemorySwarm::new();
//! let session = Session::connect(hub.join("demo"), Arc::new(JsonCodec), SessionConfig::default());
//!
//! session.command("double", handler(|args| async move {
//!     let n = args[0].as_i64().unwrap_or(0);
//!     Ok(json!(n * 2))
//! }))?;
//!
//! let mut events = session.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::Peer { proxy, .. } = event {
//!         let answer = proxy.invoke("double", vec![json!(21)]).await?;
//!         assert_eq!(answer, json!(42));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod mem;
pub mod proxy;
pub mod registry;
pub mod session;

pub use channel::{
    handler, CommandHandler, Discovery, DiscoveryEvent, ExtensionFrame, InboundRequest,
    PeerChannel, PeerStream, RawHandler, RawStream, ReplySink, WireChannel, WireCodec,
};
pub use codec::JsonCodec;
pub use mem::{MemoryMembership, MemorySwarm};
pub use proxy::PeerProxy;
pub use registry::CommandRegistry;
pub use session::{PeerInfo, PeerState, Session, SessionConfig, SessionEvent};
pub use swarmcall_types::error::{SwarmError, SwarmResult};
pub use swarmcall_types::manifest::{Manifest, MANIFEST_EXTENSION};
