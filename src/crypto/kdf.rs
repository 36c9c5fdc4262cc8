//! Session key derivation.
//!
//! The DH shared secret is expanded into an epoch and two key slots per
//! direction. Which slot a side reads from and which it writes with is
//! decided by comparing the two ephemeral public values, so both ends reach
//! complementary assignments without further messages.
//!
//! Layout of the expanded material (after the legacy prefix, see
//! [`KeyDerivation::Legacy`]):
//! ```text
//! +-------+-------------+-------------+-------------+-------------+
//! | epoch | cipher key0 | cipher key1 | mac key0    | mac key1    |
//! | 2 (BE)| key size    | key size    | mac size    | mac size    |
//! +-------+-------------+-------------+-------------+-------------+
//! ```
//! MAC slots exist only for keyed hashes. The length budget also covers two
//! cipher blocks per direction, which are not consumed.

use std::cmp::Ordering;

use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::core::{CryptoError, EPOCH_SIZE};

/// HKDF info label for [`KeyDerivation::Hkdf`].
const HKDF_INFO: &[u8] = b"peersec v1 session keys";

/// How session material is expanded from the shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyDerivation {
    /// Append `SHA1(buffer)` to the shared secret until long enough, then read
    /// past the secret. Interoperates with existing deployments.
    #[default]
    Legacy,
    /// HKDF-SHA256 extract-and-expand over the shared secret.
    Hkdf,
}

/// Relative order of the two ephemeral values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    /// Values are identical (self association). Both directions use slot 0.
    Same,
    /// Local value sorts first. Read with slot 0, write with slot 1.
    First,
    /// Local value sorts second. Read with slot 1, write with slot 0.
    Second,
}

impl KeyOrder {
    /// Compare the raw values at the first differing byte.
    pub fn of(local: &[u8], remote: &[u8]) -> Self {
        match local.iter().zip(remote).find(|(l, r)| l != r) {
            None => Self::Same,
            Some((l, r)) => match l.cmp(r) {
                Ordering::Less => Self::First,
                _ => Self::Second,
            },
        }
    }
}

/// Sizes the expanded material must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySizes {
    /// Cipher key size.
    pub key: usize,
    /// Cipher block size.
    pub block: usize,
    /// MAC key size, zero for unkeyed hashes.
    pub mac: usize,
}

impl KeySizes {
    /// Bytes of material needed after the legacy prefix.
    pub fn material_len(&self) -> usize {
        EPOCH_SIZE + 2 * (self.key + self.block) + 2 * self.mac
    }
}

/// Directional keys for one session epoch.
pub struct SessionKeys {
    /// Epoch identifier.
    pub epoch: u16,
    /// Key for decrypting inbound frames.
    pub in_key: Zeroizing<Vec<u8>>,
    /// Key for encrypting outbound frames.
    pub out_key: Zeroizing<Vec<u8>>,
    /// Key for verifying inbound frames (empty for unkeyed hashes).
    pub in_mac: Zeroizing<Vec<u8>>,
    /// Key for signing outbound frames (empty for unkeyed hashes).
    pub out_mac: Zeroizing<Vec<u8>>,
}

/// Expand `shared` and assign key slots according to `order`.
pub fn derive_session_keys(
    method: KeyDerivation,
    shared: &[u8],
    order: KeyOrder,
    sizes: KeySizes,
) -> Result<SessionKeys, CryptoError> {
    let material = match method {
        KeyDerivation::Legacy => legacy_expand(shared, sizes.material_len()),
        KeyDerivation::Hkdf => hkdf_expand(shared, sizes.material_len())?,
    };

    let mut offset = 0;
    let mut take = |len: usize| {
        let slot = Zeroizing::new(material[offset..offset + len].to_vec());
        offset += len;
        slot
    };

    let epoch_bytes = take(EPOCH_SIZE);
    let epoch = u16::from_be_bytes([epoch_bytes[0], epoch_bytes[1]]);
    let key0 = take(sizes.key);
    let key1 = take(sizes.key);
    let mac0 = take(sizes.mac);
    let mac1 = take(sizes.mac);

    let keys = match order {
        KeyOrder::Same => SessionKeys {
            epoch,
            in_key: key0.clone(),
            out_key: key0,
            in_mac: mac0.clone(),
            out_mac: mac0,
        },
        KeyOrder::First => SessionKeys {
            epoch,
            in_key: key0,
            out_key: key1,
            in_mac: mac0,
            out_mac: mac1,
        },
        KeyOrder::Second => SessionKeys {
            epoch,
            in_key: key1,
            out_key: key0,
            in_mac: mac1,
            out_mac: mac0,
        },
    };
    Ok(keys)
}

/// Legacy iterated-SHA1 expansion. Returns `len` bytes following the secret.
fn legacy_expand(shared: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let target = shared.len() + len;
    let mut buffer = Zeroizing::new(Vec::with_capacity(target + 20));
    buffer.extend_from_slice(shared);
    while buffer.len() < target {
        let digest = Sha1::digest(buffer.as_slice());
        buffer.extend_from_slice(&digest);
    }
    Zeroizing::new(buffer[shared.len()..target].to_vec())
}

fn hkdf_expand(shared: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(okm)
}
