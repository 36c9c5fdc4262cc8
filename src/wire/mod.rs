//! PeerSec wire formats.
//!
//! Every frame handled by the overlord starts with a one-byte type tag:
//!
//! ```text
//! +-----+----------------------------------------------+
//! | tag | body                                         |
//! +-----+----------------------------------------------+
//!   29    Security: body is another tagged frame
//!   30    SecureData: body is a SecurityDataMessage
//!   31    SecureControl: body is a SecurityControlMessage
//!  'r'    ReqRep: body belongs to the reliability layer
//! ```
//!
//! Integers are big-endian throughout.

mod control;
mod data;

pub use control::*;
pub use data::*;

use crate::core::{
    DecodeError, PTYPE_REQREP, PTYPE_SECURE_CONTROL, PTYPE_SECURE_DATA, PTYPE_SECURITY,
};

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PType {
    /// Overlord wrapper.
    Security,
    /// Encrypted application data.
    SecureData,
    /// Handshake control message.
    SecureControl,
    /// Reliability layer traffic.
    ReqRep,
    /// Traffic owned by someone else.
    Other(u8),
}

impl PType {
    /// Parse a tag byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            PTYPE_SECURITY => Self::Security,
            PTYPE_SECURE_DATA => Self::SecureData,
            PTYPE_SECURE_CONTROL => Self::SecureControl,
            PTYPE_REQREP => Self::ReqRep,
            other => Self::Other(other),
        }
    }

    /// Tag byte for this type.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Security => PTYPE_SECURITY,
            Self::SecureData => PTYPE_SECURE_DATA,
            Self::SecureControl => PTYPE_SECURE_CONTROL,
            Self::ReqRep => PTYPE_REQREP,
            Self::Other(byte) => byte,
        }
    }

    /// Split the leading tag from `frame`.
    pub fn split(frame: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        match frame.split_first() {
            Some((&tag, body)) => Ok((Self::from_byte(tag), body)),
            None => Err(DecodeError::UnexpectedEof),
        }
    }
}

/// Prefix `body` with `tags`, outermost first.
pub fn frame(tags: &[PType], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tags.len() + body.len());
    out.extend(tags.iter().map(|t| t.as_byte()));
    out.extend_from_slice(body);
    out
}

/// Cursor over a received buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::InvalidLength(len))?;
        let out = self.buf.get(self.pos..end).ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// A `[len:4][bytes]` field.
    pub(crate) fn prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(DecodeError::InvalidLength(len));
        }
        self.bytes(len)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

pub(crate) fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptype_bytes() {
        assert_eq!(PType::from_byte(29), PType::Security);
        assert_eq!(PType::from_byte(30), PType::SecureData);
        assert_eq!(PType::from_byte(31), PType::SecureControl);
        assert_eq!(PType::from_byte(b'r'), PType::ReqRep);
        assert_eq!(PType::from_byte(7), PType::Other(7));
        assert_eq!(PType::Other(7).as_byte(), 7);
    }

    #[test]
    fn test_frame_and_split() {
        let framed = frame(&[PType::Security, PType::SecureData], b"body");
        assert_eq!(framed, [29, 30, b'b', b'o', b'd', b'y']);

        let (outer, rest) = PType::split(&framed).unwrap();
        assert_eq!(outer, PType::Security);
        let (inner, body) = PType::split(rest).unwrap();
        assert_eq!(inner, PType::SecureData);
        assert_eq!(body, b"body");

        assert_eq!(PType::split(&[]), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_reader_prefixed_bounds() {
        let mut buf = Vec::new();
        put_prefixed(&mut buf, b"abc");
        let mut r = Reader::new(&buf);
        assert_eq!(r.prefixed().unwrap(), b"abc");
        assert_eq!(r.remaining(), 0);

        let bogus = [0u8, 0, 0, 9, 1, 2];
        assert_eq!(Reader::new(&bogus).prefixed(), Err(DecodeError::InvalidLength(9)));
    }
}
