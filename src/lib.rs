//! # PeerSec
//!
//! Secure sessions between overlay peers.
//!
//! PeerSec sets up an authenticated, encrypted channel (a *security
//! association*) per remote peer and SPI, and protects application frames
//! with the negotiated keys:
//!
//! - **Anti-spoofing**: a stateless cookie exchange precedes any per-peer work
//! - **Authentication**: CA-issued Ed25519 certificates bound to peer identity
//! - **Forward secrecy**: ephemeral X25519 key agreement per handshake round
//! - **Rekeying**: keys roll over without interrupting traffic
//! - **Pluggable suites**: AES-CBC with SHA or HMAC, or pass-through for
//!   pre-shared setups
//!
//! ## Modules
//!
//! - [`core`]: Core traits, constants, and error types
//! - [`crypto`]: Cipher suites, key agreement, key derivation, session handlers
//! - [`wire`]: Frame tags and message codecs
//! - [`security`]: Policies, certificates, associations and the overlord
//!
//! ## Example Usage
//!
//! ```ignore
//! use peersec::prelude::*;
//!
//! let store = Arc::new(CertificateStore::new());
//! store.add_ca(ca_key);
//! store.add_certificate(my_certificate);
//!
//! let overlord = OverlordBuilder::new()
//!     .signing_key(my_key)
//!     .certificates(store)
//!     .reqrep(reqrep)
//!     .build()?;
//!
//! // Route every inbound frame through the overlord
//! overlord.handle_data(&frame, &ReturnPath::Direct(peer.clone()));
//!
//! let sa = overlord.create_security_association(&peer, DEFAULT_SPI)?;
//! match sa.send(b"hello")? {
//!     SendStatus::Sent => {}
//!     SendStatus::NotReady => { /* handshake still running */ }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod crypto;
pub mod security;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::crypto::{Authenticator, Encryptor, KeyDerivation};
    pub use crate::security::*;
    pub use crate::wire::{CaId, Cookie, PType};
}

// Re-export commonly used items at crate root
pub use crate::core::{Peer, SecurityError, SecurityResult};
pub use security::{
    CertificateStore, OverlordBuilder, PeerSecAssociation, PeerSecOverlord, SaState,
    SecurityPolicies, SecurityPolicy, SendStatus,
};
