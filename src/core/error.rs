//! Error types for PeerSec.

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length for the algorithm.
    #[error("invalid key length")]
    InvalidKeyLength,

    /// Ciphertext is empty or not a multiple of the block size.
    #[error("invalid ciphertext length: {0}")]
    InvalidCiphertextLength(usize),

    /// PKCS#7 padding check failed after decryption.
    #[error("invalid padding")]
    InvalidPadding,

    /// MAC or signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// Sequence id already seen or below the replay window.
    #[error("replay detected: seqid {0}")]
    ReplayDetected(u32),

    /// Frame was produced under a different session epoch.
    #[error("epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch {
        /// Epoch of the session handler.
        expected: u16,
        /// Epoch carried by the frame.
        actual: u16,
    },

    /// Outgoing sequence ids exhausted - keys must be renegotiated.
    #[error("sequence ids exhausted")]
    SeqidExhausted,

    /// Remote Diffie-Hellman value is malformed.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Diffie-Hellman produced a low-order (all zero) result.
    #[error("non-contributory key exchange")]
    NonContributory,

    /// Key material could not be expanded.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Buffer range lies outside the input.
    #[error("buffer range out of bounds")]
    OutOfRange,

    /// Session handler has been closed.
    #[error("session handler closed")]
    HandlerClosed,
}

/// Errors decoding wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of data.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Length field is inconsistent with the message.
    #[error("invalid length: {0}")]
    InvalidLength(usize),

    /// Unknown control message type.
    #[error("unknown control message type: {0}")]
    UnknownMessageType(u32),

    /// Empty frame or unknown framing tag.
    #[error("unknown framing tag: {0}")]
    UnknownPType(u8),
}

/// Errors from certificate handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertificateError {
    /// Certificate could not be parsed.
    #[error("malformed certificate")]
    Malformed,

    /// Issuer is not a trusted CA.
    #[error("unknown issuer")]
    UnknownIssuer,

    /// CA signature over the certificate is invalid.
    #[error("bad certificate signature")]
    BadSignature,

    /// Certificate has been revoked.
    #[error("certificate revoked")]
    Revoked,

    /// Certificate subject does not match the peer presenting it.
    #[error("certificate subject does not match peer")]
    SubjectMismatch,

    /// No local certificate is signed by any of the offered CAs.
    #[error("no certificate matches the offered CAs")]
    NoMatchingCertificate,

    /// No local certificate is installed.
    #[error("no local certificate")]
    NoCertificate,
}

/// Errors from the security policy registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// No policy registered for the SPI.
    #[error("unsupported SPI: {0}")]
    UnsupportedSpi(u32),

    /// A different policy is already registered for the SPI.
    #[error("SPI {0} already registered with a different policy")]
    Conflict(u32),

    /// Algorithm name not recognized.
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Top-level PeerSec errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Certificate error.
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Policy error.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// A set-once cell already holds a different value.
    #[error("{0} already set to a different value")]
    AlreadySet(&'static str),

    /// Transcript hash was never stored for this round.
    #[error("hash not set")]
    HashNotSet,

    /// Transcript hash differs from the stored one.
    #[error("hash mismatch")]
    HashMismatch,

    /// A handshake round is already in flight.
    #[error("handshake already in progress")]
    HandshakeInProgress,

    /// Association is closed.
    #[error("security association closed")]
    Closed,

    /// Internal state machine misuse.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    /// Frame SPI differs from the association SPI.
    #[error("SPI mismatch: expected {expected}, got {actual}")]
    SpiMismatch {
        /// SPI of the association.
        expected: u32,
        /// SPI carried by the frame.
        actual: u32,
    },

    /// Remote cookie does not match the recomputed one.
    #[error("invalid cookie")]
    InvalidCookie,

    /// Control message carries an unsupported version.
    #[error("unsupported version: {0}")]
    InvalidVersion(u32),

    /// No association exists for the message.
    #[error("no security association")]
    NoAssociation,

    /// Traffic arrived over an insecure edge.
    #[error("insecure edge")]
    InsecureEdge,

    /// Underlying transport refused the message.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result alias for PeerSec operations.
pub type SecurityResult<T> = Result<T, SecurityError>;
