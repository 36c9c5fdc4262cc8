//! Handshake control message.
//!
//! ```text
//! +---------+--------+--------+---------------+---------------+
//! | Version | SPI    | Type   | Local cookie  | Remote cookie |
//! | 4 (BE)  | 4 (BE) | 4 (BE) | 20            | 20            |
//! +---------+--------+--------+---------------+---------------+
//! followed by, depending on Type:
//!   DHE          [len:4][bytes]            DHEWithCertificate[AndCAs]
//!   Certificate  [len:4][bytes]            DHEWithCertificate[AndCAs]
//!   CAs          [count:4][count * 20]     CookieResponse, DHEWithCertificateAndCAs
//!   Hash         [len:4][bytes]            Confirm
//! and for signed types the Ed25519 signature over everything before it.
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};

use super::{Reader, put_prefixed};
use crate::core::{CA_ID_SIZE, COOKIE_SIZE, CryptoError, DecodeError, PROTOCOL_VERSION};

/// Anti-spoofing cookie.
pub type Cookie = [u8; COOKIE_SIZE];

/// Certificate authority identifier.
pub type CaId = [u8; CA_ID_SIZE];

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlType {
    /// Initiator's cookie.
    Cookie = 0,
    /// Stateless cookie echo with the responder's CAs.
    CookieResponse = 1,
    /// Responder's DH value and certificate.
    DheWithCertificate = 2,
    /// Initiator's DH value, certificate, and CAs.
    DheWithCertificateAndCas = 3,
    /// Transcript hash confirmation.
    Confirm = 4,
    /// Data arrived for an association the sender does not have.
    NoSuchSa = 5,
}

impl ControlType {
    /// Parse a type value.
    pub fn from_u32(value: u32) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => Self::Cookie,
            1 => Self::CookieResponse,
            2 => Self::DheWithCertificate,
            3 => Self::DheWithCertificateAndCas,
            4 => Self::Confirm,
            5 => Self::NoSuchSa,
            other => return Err(DecodeError::UnknownMessageType(other)),
        })
    }

    /// Whether messages of this type carry a signature.
    pub fn is_signed(self) -> bool {
        !matches!(self, Self::Cookie | Self::CookieResponse | Self::NoSuchSa)
    }

    fn has_dhe_and_certificate(self) -> bool {
        matches!(self, Self::DheWithCertificate | Self::DheWithCertificateAndCas)
    }

    fn has_cas(self) -> bool {
        matches!(self, Self::CookieResponse | Self::DheWithCertificateAndCas)
    }
}

/// A handshake control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityControlMessage {
    /// Protocol version.
    pub version: u32,
    /// Security parameter index.
    pub spi: u32,
    /// Message type.
    pub kind: ControlType,
    /// Sender's cookie for the receiver.
    pub local_cookie: Cookie,
    /// Receiver's cookie, echoed back.
    pub remote_cookie: Cookie,
    /// Ephemeral DH public value.
    pub dhe: Vec<u8>,
    /// Encoded certificate.
    pub certificate: Vec<u8>,
    /// Accepted certificate authorities.
    pub cas: Vec<CaId>,
    /// Transcript hash.
    pub hash: Vec<u8>,
    /// Signature over the unsigned bytes.
    pub signature: Vec<u8>,
}

impl SecurityControlMessage {
    /// Empty message of `kind` for `spi`.
    pub fn new(kind: ControlType, spi: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            spi,
            kind,
            local_cookie: [0; COOKIE_SIZE],
            remote_cookie: [0; COOKIE_SIZE],
            dhe: Vec::new(),
            certificate: Vec::new(),
            cas: Vec::new(),
            hash: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Everything the signature covers.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + 2 * COOKIE_SIZE + self.dhe.len() + self.certificate.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.spi.to_be_bytes());
        out.extend_from_slice(&(self.kind as u32).to_be_bytes());
        out.extend_from_slice(&self.local_cookie);
        out.extend_from_slice(&self.remote_cookie);

        if self.kind.has_dhe_and_certificate() {
            put_prefixed(&mut out, &self.dhe);
            put_prefixed(&mut out, &self.certificate);
        }
        if self.kind.has_cas() {
            out.extend_from_slice(&(self.cas.len() as u32).to_be_bytes());
            for ca in &self.cas {
                out.extend_from_slice(ca);
            }
        }
        if self.kind == ControlType::Confirm {
            put_prefixed(&mut out, &self.hash);
        }
        out
    }

    /// Full wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.unsigned_bytes();
        if self.kind.is_signed() {
            out.extend_from_slice(&self.signature);
        }
        out
    }

    /// Parse a message.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let version = r.u32()?;
        let spi = r.u32()?;
        let kind = ControlType::from_u32(r.u32()?)?;
        let mut msg = Self::new(kind, spi);
        msg.version = version;
        msg.local_cookie = r.array()?;
        msg.remote_cookie = r.array()?;

        if kind.has_dhe_and_certificate() {
            msg.dhe = r.prefixed()?.to_vec();
            msg.certificate = r.prefixed()?.to_vec();
        }
        if kind.has_cas() {
            let count = r.u32()? as usize;
            if count.saturating_mul(CA_ID_SIZE) > r.remaining() {
                return Err(DecodeError::InvalidLength(count));
            }
            msg.cas = (0..count).map(|_| r.array()).collect::<Result<_, _>>()?;
        }
        if kind == ControlType::Confirm {
            msg.hash = r.prefixed()?.to_vec();
        }

        let rest = r.rest();
        if kind.is_signed() {
            msg.signature = rest.to_vec();
        } else if !rest.is_empty() {
            return Err(DecodeError::InvalidLength(rest.len()));
        }
        Ok(msg)
    }

    /// Sign with `key`.
    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = key.sign(&self.unsigned_bytes()).to_bytes().to_vec();
    }

    /// Check the signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| CryptoError::InvalidSignature)?;
        key.verify(&self.unsigned_bytes(), &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// SHA-1 of the full encoding, used as a transcript hash.
    pub fn digest(&self) -> Vec<u8> {
        Sha1::digest(self.encode()).to_vec()
    }
}
