//! Manifest exchange types.
//!
//! During negotiation each side of a connection advertises the commands it
//! exposes by sending a [`Manifest`] over a reserved extension channel.
//! The payload is plain JSON (`{"commands": [...]}`), so any implementation
//! sharing the extension id and schema can interoperate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reserved extension type id carrying manifest frames.
///
/// Protocol compatibility constant: both ends of a connection must agree
/// on it.
pub const MANIFEST_EXTENSION: u32 = 0x1ee;

/// The ordered list of command names one side advertises to a peer.
///
/// A manifest is a snapshot of a registry at the moment it is serialized.
/// It is transmitted and never mutated after send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Advertised command names, in registration order.
    pub commands: Vec<String>,
}

impl Manifest {
    /// Build a manifest from a list of command names.
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    /// An empty manifest (a valid advertisement for a node with no
    /// commands).
    pub fn empty() -> Self {
        Self { commands: Vec::new() }
    }

    /// Serialize to the JSON wire payload.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a manifest from a received extension payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Number of advertised commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the manifest advertises nothing.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_schema_is_stable() {
        // Payloads from foreign implementations must keep parsing.
        let manifest = Manifest::decode(br#"{"commands":["echo","render"]}"#).unwrap();
        assert_eq!(manifest.commands, vec!["echo", "render"]);

        let encoded = Manifest::new(vec!["ping".to_string()]).encode().unwrap();
        assert_eq!(&encoded[..], br#"{"commands":["ping"]}"#);
    }

    #[test]
    fn test_empty_manifest_is_valid() {
        let manifest = Manifest::empty();
        assert!(manifest.is_empty());
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded.len(), 0);
    }
}
