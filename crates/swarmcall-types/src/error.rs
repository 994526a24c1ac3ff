//! Error types for the swarmcall stack.

use thiserror::Error;

/// Top-level error type for sessions, channels, and the reference codec.
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Malformed local command registration. Raised synchronously to the
    /// caller, never surfaced as an event.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A call attempted against a channel or peer that already closed.
    /// Surfaced as an immediate failure of that call, without a network
    /// round-trip.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// An error value returned by the remote handler.
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// A discovery-level fault. Surfaced as a non-fatal `Error` event on
    /// the session; never tears down existing peer connections.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A proxy invocation of a name the peer never advertised.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A framing or serialization fault in the wire codec.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The session has already been torn down.
    #[error("Session closed")]
    Closed,

    /// An I/O error on the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for results carrying [`SwarmError`].
pub type SwarmResult<T> = Result<T, SwarmError>;
