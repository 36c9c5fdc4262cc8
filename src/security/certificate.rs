//! Node certificates and the trust store.
//!
//! A certificate binds a peer identity to an Ed25519 key and is signed by
//! a certificate authority. CAs are referred to on the wire by the SHA-1 of
//! their public key.
//!
//! ```text
//! +-----------------+------------+-----------+-----------+
//! | subject         | public key | issuer id | signature |
//! | [len:4][bytes]  | 32         | 20        | 64        |
//! +-----------------+------------+-----------+-----------+
//! ```

use std::collections::HashSet;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::core::{CertificateError, SIGNATURE_SIZE};
use crate::wire::{CaId, Reader, put_prefixed};

/// Identifier of the CA owning `key`.
pub fn ca_id(key: &VerifyingKey) -> CaId {
    Sha1::digest(key.as_bytes()).into()
}

/// A CA-signed binding of identity to public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    subject: Vec<u8>,
    public_key: [u8; 32],
    issuer: CaId,
    signature: [u8; SIGNATURE_SIZE],
}

impl Certificate {
    /// Issue a certificate for `subject` holding `public_key`, signed by `ca`.
    pub fn issue(subject: &[u8], public_key: &VerifyingKey, ca: &SigningKey) -> Self {
        let mut cert = Self {
            subject: subject.to_vec(),
            public_key: public_key.to_bytes(),
            issuer: ca_id(&ca.verifying_key()),
            signature: [0; SIGNATURE_SIZE],
        };
        cert.signature = ca.sign(&cert.tbs_bytes()).to_bytes();
        cert
    }

    fn tbs_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.subject.len() + 32 + 20);
        put_prefixed(&mut out, &self.subject);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.issuer);
        out
    }

    /// Wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.tbs_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse a certificate.
    pub fn decode(bytes: &[u8]) -> Result<Self, CertificateError> {
        let mut r = Reader::new(bytes);
        let malformed = |_| CertificateError::Malformed;
        let subject = r.prefixed().map_err(malformed)?.to_vec();
        let public_key = r.array().map_err(malformed)?;
        let issuer = r.array().map_err(malformed)?;
        let signature = r.array().map_err(malformed)?;
        if r.remaining() != 0 {
            return Err(CertificateError::Malformed);
        }
        Ok(Self {
            subject,
            public_key,
            issuer,
            signature,
        })
    }

    /// Identity the certificate was issued to.
    pub fn subject(&self) -> &[u8] {
        &self.subject
    }

    /// Issuing CA.
    pub fn issuer(&self) -> &CaId {
        &self.issuer
    }

    /// Key that signs the holder's handshake messages.
    pub fn public_key(&self) -> Result<VerifyingKey, CertificateError> {
        VerifyingKey::from_bytes(&self.public_key).map_err(|_| CertificateError::Malformed)
    }

    /// Serial number used for revocation.
    pub fn serial(&self) -> [u8; 20] {
        Sha1::digest(self.encode()).into()
    }

    fn check_signature(&self, ca: &VerifyingKey) -> Result<(), CertificateError> {
        ca.verify(&self.tbs_bytes(), &Signature::from_bytes(&self.signature))
            .map_err(|_| CertificateError::BadSignature)
    }
}

/// Certificate verification and selection.
pub trait CertificateHandler: Send + Sync {
    /// Check `cert` chains to a trusted CA, is not revoked, and names
    /// `peer_identity` as its subject.
    fn verify(&self, cert: &Certificate, peer_identity: &[u8]) -> Result<(), CertificateError>;

    /// A local certificate issued by one of `cas`.
    fn find_certificate(&self, cas: &[CaId]) -> Result<Certificate, CertificateError>;

    /// Local certificate used when CAs are not negotiated.
    fn default_certificate(&self) -> Result<Certificate, CertificateError>;

    /// CAs this node trusts.
    fn supported_cas(&self) -> Vec<CaId>;
}

#[derive(Default)]
struct StoreInner {
    cas: Vec<(CaId, VerifyingKey)>,
    local: Vec<Certificate>,
    revoked: HashSet<[u8; 20]>,
}

/// In-memory trust store with revocation.
#[derive(Default)]
pub struct CertificateStore {
    inner: RwLock<StoreInner>,
}

impl CertificateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust certificates issued by `key`.
    pub fn add_ca(&self, key: VerifyingKey) -> CaId {
        let id = ca_id(&key);
        let mut inner = self.inner.write();
        if !inner.cas.iter().any(|(known, _)| *known == id) {
            inner.cas.push((id, key));
        }
        id
    }

    /// Install a certificate for this node. The first one becomes the default.
    pub fn add_certificate(&self, cert: Certificate) {
        let mut inner = self.inner.write();
        if !inner.local.contains(&cert) {
            inner.local.push(cert);
        }
    }

    /// Revoke the certificate with `serial`.
    pub fn revoke(&self, serial: [u8; 20]) {
        self.inner.write().revoked.insert(serial);
    }
}

impl CertificateHandler for CertificateStore {
    fn verify(&self, cert: &Certificate, peer_identity: &[u8]) -> Result<(), CertificateError> {
        let inner = self.inner.read();
        let (_, ca) = inner
            .cas
            .iter()
            .find(|(id, _)| id == cert.issuer())
            .ok_or(CertificateError::UnknownIssuer)?;
        cert.check_signature(ca)?;
        if inner.revoked.contains(&cert.serial()) {
            return Err(CertificateError::Revoked);
        }
        if cert.subject() != peer_identity {
            return Err(CertificateError::SubjectMismatch);
        }
        Ok(())
    }

    fn find_certificate(&self, cas: &[CaId]) -> Result<Certificate, CertificateError> {
        self.inner
            .read()
            .local
            .iter()
            .find(|cert| cas.contains(cert.issuer()))
            .cloned()
            .ok_or(CertificateError::NoMatchingCertificate)
    }

    fn default_certificate(&self) -> Result<Certificate, CertificateError> {
        self.inner
            .read()
            .local
            .first()
            .cloned()
            .ok_or(CertificateError::NoCertificate)
    }

    fn supported_cas(&self) -> Vec<CaId> {
        self.inner.read().cas.iter().map(|(id, _)| *id).collect()
    }
}
