//! Shared data types for the swarmcall peer RPC stack.
//!
//! This crate defines the manifest exchanged during capability negotiation
//! and the error taxonomy used across the session, channel, and codec
//! layers. It contains no business logic.

pub mod error;
pub mod manifest;

pub use error::{SwarmError, SwarmResult};
pub use manifest::{Manifest, MANIFEST_EXTENSION};
