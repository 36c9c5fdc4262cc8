//! Protocol constants for PeerSec.
//!
//! Values on the wire are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Control message version understood by this implementation.
pub const PROTOCOL_VERSION: u32 = 0;

/// Anti-spoofing cookie size (SHA1 output).
pub const COOKIE_SIZE: usize = 20;

/// Certificate authority identifier size (SHA1 of the CA public key).
pub const CA_ID_SIZE: usize = 20;

/// SPI registered by default in every policy registry.
pub const DEFAULT_SPI: u32 = 0;

/// Length of the overlord's cookie secret.
pub const COOKIE_SECRET_SIZE: usize = 20;

// =============================================================================
// FRAMING TAGS
// =============================================================================

/// Outer wrapper marking traffic owned by the overlord.
pub const PTYPE_SECURITY: u8 = 29;

/// Data-plane frame (encrypted application payload).
pub const PTYPE_SECURE_DATA: u8 = 30;

/// Control-plane frame (handshake message).
pub const PTYPE_SECURE_CONTROL: u8 = 31;

/// Request/reply reliability layer.
pub const PTYPE_REQREP: u8 = b'r';

// =============================================================================
// KEY MATERIAL
// =============================================================================

/// X25519 public value size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Epoch prefix taken from the expanded key material.
pub const EPOCH_SIZE: usize = 2;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

// =============================================================================
// SESSION HANDLER
// =============================================================================

/// Outgoing frames after which the session handler first asks for new keys.
#[cfg(not(test))]
pub const HALF_LIFE: u32 = 1000;

/// Outgoing frames after which the session handler first asks for new keys.
#[cfg(test)]
pub const HALF_LIFE: u32 = 20;

/// Interval, past `HALF_LIFE`, between subsequent update hints.
pub const UPDATE_PERIOD: u32 = 1000;

/// Anti-replay window size in sequence ids.
pub const REPLAY_WINDOW_SIZE: u32 = 64;

// =============================================================================
// TIMING
// =============================================================================

/// Interval between inactivity sweeps driven by `heartbeat`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Update requests are rate limited to this multiple of the reliability timeout.
pub const UPDATE_REQUEST_FACTOR: u32 = 2;
