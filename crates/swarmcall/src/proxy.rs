//! Peer proxies — the callable surface mirroring a remote manifest.
//!
//! A proxy owns a capability table of command names advertised by one
//! peer and dispatches invocations by name, avoiding any shared mutable
//! prototype. Clones share the same table, so extending it on a manifest
//! refresh is observed by every holder.

use serde_json::Value;
use std::sync::{Arc, RwLock};

use crate::channel::PeerChannel;
use swarmcall_types::error::{SwarmError, SwarmResult};
use swarmcall_types::manifest::Manifest;

/// Callable handle for one remote peer.
///
/// The method set is exactly the peer's advertised manifest. Names are
/// only ever added: a manifest refresh from the peer extends the table in
/// place and already-issued clones gain the new commands without a fresh
/// `Peer` event.
#[derive(Clone)]
pub struct PeerProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    peer_id: String,
    channel: PeerChannel,
    commands: RwLock<Vec<String>>,
}

impl PeerProxy {
    /// Bind a proxy to a channel from a received manifest.
    pub(crate) fn bind(peer_id: String, channel: PeerChannel, manifest: &Manifest) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                peer_id,
                channel,
                commands: RwLock::new(manifest.commands.clone()),
            }),
        }
    }

    /// Extend the capability table with newly advertised names, in place.
    /// Returns the names that were actually new.
    pub(crate) fn extend(&self, manifest: &Manifest) -> Vec<String> {
        let mut commands = self
            .inner
            .commands
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut added = Vec::new();
        for name in &manifest.commands {
            if !commands.contains(name) {
                commands.push(name.clone());
                added.push(name.clone());
            }
        }
        added
    }

    /// The discovery-assigned id of the peer behind this proxy.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Snapshot of the commands the peer currently advertises.
    pub fn commands(&self) -> Vec<String> {
        self.inner
            .commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the peer advertises a command under this name.
    pub fn has_command(&self, name: &str) -> bool {
        self.inner
            .commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|n| n == name)
    }

    /// Whether the underlying channel has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    /// Invoke a remote command.
    ///
    /// Fails immediately with [`SwarmError::PeerUnavailable`] when the
    /// channel already closed, and with [`SwarmError::UnknownCommand`]
    /// for names outside the advertised manifest; neither touches the
    /// network.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> SwarmResult<Value> {
        if self.inner.channel.is_closed() {
            return Err(SwarmError::PeerUnavailable(format!(
                "peer '{}' is gone",
                self.inner.peer_id
            )));
        }
        if !self.has_command(name) {
            return Err(SwarmError::UnknownCommand(name.to_string()));
        }
        self.inner.channel.call(name, args).await
    }

    /// Invoke with a completion callback, for callers that want both
    /// conventions at once.
    ///
    /// `on_done` observes the outcome before this future settles. If it
    /// returns an error, that error replaces the original outcome as the
    /// future's result.
    pub async fn invoke_with<F>(
        &self,
        name: &str,
        args: Vec<Value>,
        on_done: F,
    ) -> SwarmResult<Value>
    where
        F: FnOnce(&SwarmResult<Value>) -> SwarmResult<()> + Send,
    {
        let outcome = self.invoke(name, args).await;
        match on_done(&outcome) {
            Ok(()) => outcome,
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for PeerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProxy")
            .field("peer_id", &self.inner.peer_id)
            .field("commands", &self.commands())
            .finish()
    }
}
