//! PeerSec secure sessions
//!
//! This module implements the session layer on top of the crypto
//! primitives:
//! - Security policies selected by SPI
//! - Certificates and the trust store
//! - Security associations (one per peer and SPI)
//! - The overlord, which runs the handshake and demultiplexes traffic

mod association;
mod certificate;
mod overlord;
mod policy;

#[cfg(test)]
pub(crate) mod mock;

pub use association::*;
pub use certificate::*;
pub use overlord::*;
pub use policy::*;
