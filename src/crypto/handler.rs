//! Per-epoch session handler with anti-replay protection
//!
//! A `SecurityHandler` owns the keys of one session epoch and turns
//! application payloads into sealed data messages and back:
//! - MAC over header and payload, then encryption of the body
//! - Sequence id management for outgoing frames
//! - Anti-replay protection via a sliding window
//! - A hint that new keys should be negotiated once enough frames went out

use super::algorithms::HashAlgorithm;
use super::encryption::SymmetricEncryption;
use crate::core::{CryptoError, HALF_LIFE, REPLAY_WINDOW_SIZE, UPDATE_PERIOD};
use crate::wire::{DataHeader, SecurityDataMessage, decode_body, encode_body, signed_bytes};
use subtle::ConstantTimeEq;

/// Anti-replay sliding window over 32-bit sequence ids.
///
/// - Below window: reject
/// - Seen id: reject
/// - Above highest: advance the window
#[derive(Debug, Default)]
pub struct ReplayWindow {
    /// Bit `n` set means `highest - n` was seen
    bitmap: u64,
    /// Highest id seen so far
    highest: u32,
    /// Whether we've seen any frames yet
    initialized: bool,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `seqid` is a replay (without updating).
    pub fn is_replay(&self, seqid: u32) -> bool {
        if !self.initialized || seqid > self.highest {
            return false;
        }
        let diff = self.highest - seqid;
        if diff >= REPLAY_WINDOW_SIZE {
            return true;
        }
        self.bitmap & (1 << diff) != 0
    }

    /// Record `seqid`, failing if it is a replay.
    pub fn check_and_update(&mut self, seqid: u32) -> Result<(), CryptoError> {
        if self.is_replay(seqid) {
            return Err(CryptoError::ReplayDetected(seqid));
        }
        if !self.initialized {
            self.initialized = true;
            self.highest = seqid;
            self.bitmap = 1;
        } else if seqid > self.highest {
            let shift = seqid - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.highest = seqid;
        } else {
            self.bitmap |= 1 << (self.highest - seqid);
        }
        Ok(())
    }
}

/// Cipher and MAC state for one session epoch.
pub struct SecurityHandler {
    epoch: u16,
    encryptor: SymmetricEncryption,
    decryptor: SymmetricEncryption,
    out_auth: Box<dyn HashAlgorithm>,
    in_auth: Box<dyn HashAlgorithm>,
    last_outgoing_seqid: u32,
    window: ReplayWindow,
    update_pending: bool,
    closed: bool,
}

impl SecurityHandler {
    /// Bind encryptors and authenticators for both directions to `epoch`.
    pub fn new(
        epoch: u16,
        encryptor: SymmetricEncryption,
        decryptor: SymmetricEncryption,
        out_auth: Box<dyn HashAlgorithm>,
        in_auth: Box<dyn HashAlgorithm>,
    ) -> Self {
        Self {
            epoch,
            encryptor,
            decryptor,
            out_auth,
            in_auth,
            last_outgoing_seqid: 0,
            window: ReplayWindow::new(),
            update_pending: false,
            closed: false,
        }
    }

    /// Epoch this handler serves.
    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    /// Sign and encrypt `payload` into a data message.
    pub fn seal(&mut self, spi: u32, payload: &[u8]) -> Result<SecurityDataMessage, CryptoError> {
        if self.closed {
            return Err(CryptoError::HandlerClosed);
        }
        let seqid = self
            .last_outgoing_seqid
            .checked_add(1)
            .ok_or(CryptoError::SeqidExhausted)?;
        self.last_outgoing_seqid = seqid;

        let header = DataHeader {
            spi,
            epoch: self.epoch,
            seqid,
        };
        let mac = self.out_auth.compute_hash(&signed_bytes(&header, payload));
        let body = self.encryptor.encrypt_data(&encode_body(payload, &mac))?;

        if seqid == HALF_LIFE || (seqid > HALF_LIFE && seqid % UPDATE_PERIOD == 0) {
            self.update_pending = true;
        }
        Ok(SecurityDataMessage { header, body })
    }

    /// Decrypt and verify `msg`, returning the payload.
    pub fn open(&mut self, msg: &SecurityDataMessage) -> Result<Vec<u8>, CryptoError> {
        if self.closed {
            return Err(CryptoError::HandlerClosed);
        }
        if msg.header.epoch != self.epoch {
            return Err(CryptoError::EpochMismatch {
                expected: self.epoch,
                actual: msg.header.epoch,
            });
        }
        // Cheap reject before decrypting
        if self.window.is_replay(msg.header.seqid) {
            return Err(CryptoError::ReplayDetected(msg.header.seqid));
        }

        let plain = self.decryptor.decrypt_data(&msg.body)?;
        let (payload, mac) = decode_body(&plain).map_err(|_| CryptoError::InvalidSignature)?;
        let expected = self.in_auth.compute_hash(&signed_bytes(&msg.header, payload));
        if expected.ct_eq(mac).unwrap_u8() != 1 {
            return Err(CryptoError::InvalidSignature);
        }

        self.window.check_and_update(msg.header.seqid)?;
        Ok(payload.to_vec())
    }

    /// Returns true once per crossed update threshold.
    pub fn take_update_request(&mut self) -> bool {
        std::mem::take(&mut self.update_pending)
    }

    /// Stop accepting traffic.
    pub fn close(&mut self) {
        self.closed = true;
        self.update_pending = false;
    }

    /// Whether the handler was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Authenticator, Encryptor};

    fn pair(auth: Authenticator) -> (SecurityHandler, SecurityHandler) {
        let k0 = [1u8; 32];
        let k1 = [2u8; 32];
        let m0 = vec![3u8; auth.key_size()];
        let m1 = vec![4u8; auth.key_size()];
        let make = |out_key: &[u8], in_key: &[u8], out_mac: &[u8], in_mac: &[u8]| {
            SecurityHandler::new(
                77,
                SymmetricEncryption::new(Encryptor::Aes256Cbc.create(out_key).unwrap()),
                SymmetricEncryption::new(Encryptor::Aes256Cbc.create(in_key).unwrap()),
                auth.create(out_mac).unwrap(),
                auth.create(in_mac).unwrap(),
            )
        };
        (make(&k1, &k0, &m1, &m0), make(&k0, &k1, &m0, &m1))
    }

    #[test]
    fn test_replay_window_basic() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(1).is_ok());
        assert!(window.check_and_update(2).is_ok());
        assert_eq!(window.check_and_update(1), Err(CryptoError::ReplayDetected(1)));
        assert!(window.check_and_update(5).is_ok());
        assert!(window.check_and_update(3).is_ok());
        assert!(window.check_and_update(3).is_err());
    }

    #[test]
    fn test_replay_window_edge() {
        let mut window = ReplayWindow::new();
        window.check_and_update(100).unwrap();
        assert!(!window.is_replay(100 - 63));
        assert!(window.is_replay(100 - 64));
        window.check_and_update(100 + 64).unwrap();
        assert!(window.is_replay(100));
        assert!(!window.is_replay(101));
    }

    #[test]
    fn test_seal_open() {
        let (mut a, mut b) = pair(Authenticator::HmacSha1);
        let msg = a.seal(9, b"hello world").unwrap();
        assert_eq!(msg.header.spi, 9);
        assert_eq!(msg.header.epoch, 77);
        assert_eq!(msg.header.seqid, 1);
        assert_eq!(b.open(&msg).unwrap(), b"hello world");

        let reply = b.seal(9, b"hi").unwrap();
        assert_eq!(a.open(&reply).unwrap(), b"hi");
    }

    #[test]
    fn test_replayed_frame_rejected() {
        let (mut a, mut b) = pair(Authenticator::Sha1);
        let msg = a.seal(0, b"once").unwrap();
        b.open(&msg).unwrap();
        assert_eq!(b.open(&msg), Err(CryptoError::ReplayDetected(1)));
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut a, mut b) = pair(Authenticator::HmacSha256);
        let mut msg = a.seal(0, b"payload").unwrap();
        msg.header.seqid = 40;
        assert_eq!(b.open(&msg), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn test_epoch_mismatch() {
        let (mut a, mut b) = pair(Authenticator::Sha1);
        let mut msg = a.seal(0, b"payload").unwrap();
        msg.header.epoch = 78;
        assert_eq!(
            b.open(&msg),
            Err(CryptoError::EpochMismatch { expected: 77, actual: 78 })
        );
    }

    #[test]
    fn test_update_hint_at_half_life() {
        let (mut a, _) = pair(Authenticator::Sha1);
        for _ in 1..HALF_LIFE {
            a.seal(0, b"x").unwrap();
            assert!(!a.take_update_request());
        }
        a.seal(0, b"x").unwrap();
        assert!(a.take_update_request());
        assert!(!a.take_update_request());
    }

    #[test]
    fn test_closed_handler() {
        let (mut a, mut b) = pair(Authenticator::Sha1);
        let msg = a.seal(0, b"x").unwrap();
        b.close();
        assert!(b.is_closed());
        assert_eq!(b.open(&msg), Err(CryptoError::HandlerClosed));
        a.close();
        assert!(a.seal(0, b"x").is_err());
    }
}
