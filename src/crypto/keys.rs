//! Ephemeral X25519 key management
//!
//! Every handshake round uses a fresh key pair. The private half is
//! consumed by the exchange so it cannot be reused for a second round.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::core::{CryptoError, PUBLIC_KEY_SIZE};

/// One-shot X25519 key pair for a single handshake round.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public exchange value sent to the peer.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Complete the exchange with the peer's public value.
    ///
    /// Consumes the private half. Fails if `remote` is not a 32-byte value or
    /// the result is all zero (low-order point).
    pub fn diffie_hellman(self, remote: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let remote: [u8; PUBLIC_KEY_SIZE] =
            remote.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}
