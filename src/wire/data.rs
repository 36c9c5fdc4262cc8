//! Data-plane message.
//!
//! ```text
//! +--------+--------+--------+------------------------------------------+
//! | SPI    | Epoch  | SeqId  | Encrypted body                           |
//! | 4 (BE) | 2 (BE) | 4 (BE) | enc([len:4][payload][mac])               |
//! +--------+--------+--------+------------------------------------------+
//! ```
//!
//! The MAC covers `SPI || Epoch || SeqId || payload`.

use super::Reader;
use crate::core::DecodeError;

/// Size of the cleartext header.
pub const DATA_HEADER_SIZE: usize = 10;

/// Cleartext header of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Security parameter index.
    pub spi: u32,
    /// Session epoch the body was sealed under.
    pub epoch: u16,
    /// Per-direction sequence id.
    pub seqid: u32,
}

impl DataHeader {
    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.spi.to_be_bytes());
        buf[4..6].copy_from_slice(&self.epoch.to_be_bytes());
        buf[6..10].copy_from_slice(&self.seqid.to_be_bytes());
        buf
    }

    /// Parse the header from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            spi: r.u32()?,
            epoch: r.u16()?,
            seqid: r.u32()?,
        })
    }
}

/// A sealed data-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDataMessage {
    /// Cleartext header.
    pub header: DataHeader,
    /// Encrypted body.
    pub body: Vec<u8>,
}

impl SecurityDataMessage {
    /// Serialize header and body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DATA_HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a message. The body may be empty here; decryption rejects it.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = DataHeader::from_bytes(bytes)?;
        Ok(Self {
            header,
            body: bytes[DATA_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Plaintext framing inside the encrypted body.
pub fn encode_body(payload: &[u8], mac: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len() + mac.len());
    super::put_prefixed(&mut out, payload);
    out.extend_from_slice(mac);
    out
}

/// Split a decrypted body into payload and MAC.
pub fn decode_body(body: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    let mut r = Reader::new(body);
    let payload = r.prefixed()?;
    Ok((payload, r.rest()))
}

/// Bytes covered by the MAC.
pub fn signed_bytes(header: &DataHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATA_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}
