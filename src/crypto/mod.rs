//! PeerSec crypto layer
//!
//! Building blocks used by security associations:
//! - Pluggable cipher and hash suites, including pass-through stubs
//! - Message encryption with a fresh IV per message
//! - Ephemeral X25519 key agreement
//! - Session key derivation and key-slot ordering
//! - Per-epoch session handlers with anti-replay protection
//! - Set-once cells for handshake state

mod algorithms;
mod cell;
mod encryption;
mod handler;
mod kdf;
mod keys;
mod null;

pub use algorithms::*;
pub use cell::*;
pub use encryption::*;
pub use handler::*;
pub use kdf::*;
pub use keys::*;
pub use null::*;
