//! Cipher and hash suites selectable by a security policy.
//!
//! A policy names an [`Encryptor`] and an [`Authenticator`]; once session
//! keys are derived these produce the boxed [`SymmetricAlgorithm`] and
//! [`HashAlgorithm`] instances the session handler works with.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::null::{NullEncryption, NullHash};
use crate::core::{CryptoError, PolicyError};

/// A block cipher transform in a fixed direction.
pub trait CryptoTransform: Send {
    /// Size of an input block in bytes.
    fn input_block_size(&self) -> usize;

    /// Size of an output block in bytes.
    fn output_block_size(&self) -> usize;

    /// Whether `transform_block` accepts several blocks at once.
    fn can_transform_multiple_blocks(&self) -> bool;

    /// Whether the transform may be used again after the final block.
    fn can_reuse_transform(&self) -> bool;

    /// Transform whole blocks of `input` into `output`. Returns bytes written.
    fn transform_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CryptoError>;

    /// Transform `count` bytes of `input` starting at `offset`.
    fn transform_final_block<'a>(
        &mut self,
        input: &'a [u8],
        offset: usize,
        count: usize,
    ) -> Result<Cow<'a, [u8]>, CryptoError>;
}

/// A keyed symmetric cipher producing per-message transforms.
pub trait SymmetricAlgorithm: Send + Sync {
    /// Key size in bytes.
    fn key_size(&self) -> usize;

    /// Block (and IV) size in bytes.
    fn block_size(&self) -> usize;

    /// Encrypting transform starting from `iv`.
    fn create_encryptor(&self, iv: &[u8]) -> Result<Box<dyn CryptoTransform>, CryptoError>;

    /// Decrypting transform starting from `iv`.
    fn create_decryptor(&self, iv: &[u8]) -> Result<Box<dyn CryptoTransform>, CryptoError>;
}

/// A (possibly keyed) message digest.
pub trait HashAlgorithm: Send + Sync {
    /// Output size in bytes.
    fn hash_size(&self) -> usize;

    /// Digest of `data`.
    fn compute_hash(&self, data: &[u8]) -> Vec<u8>;
}

/// Cipher suite names accepted in policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encryptor {
    /// AES-128 in CBC mode.
    Aes128Cbc,
    /// AES-256 in CBC mode ("Rijndael").
    Aes256Cbc,
    /// Pass-through.
    Null,
}

impl Encryptor {
    /// Key size in bytes.
    pub fn key_size(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes256Cbc => 32,
            Self::Null => 0,
        }
    }

    /// Block size in bytes.
    pub fn block_size(self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes256Cbc => 16,
            Self::Null => 1,
        }
    }

    /// Instantiate the cipher with `key`.
    pub fn create(self, key: &[u8]) -> Result<Box<dyn SymmetricAlgorithm>, CryptoError> {
        if key.len() != self.key_size() {
            return Err(CryptoError::InvalidKeyLength);
        }
        let algorithm: Box<dyn SymmetricAlgorithm> = match self {
            Self::Aes128Cbc | Self::Aes256Cbc => Box::new(AesCbc::new(key)?),
            Self::Null => Box::new(NullEncryption),
        };
        Ok(algorithm)
    }
}

impl FromStr for Encryptor {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RIJNDAEL" | "AES" | "AES256" => Ok(Self::Aes256Cbc),
            "AES128" => Ok(Self::Aes128Cbc),
            "NULLENCRYPTION" | "NULL" => Ok(Self::Null),
            _ => Err(PolicyError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aes128Cbc => "AES128",
            Self::Aes256Cbc => "Rijndael",
            Self::Null => "NullEncryption",
        })
    }
}

/// Message authentication suite names accepted in policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Authenticator {
    /// Plain SHA-1 digest.
    Sha1,
    /// Plain SHA-256 digest.
    Sha256,
    /// HMAC-SHA1, keyed from the session material.
    HmacSha1,
    /// HMAC-SHA256, keyed from the session material.
    HmacSha256,
    /// Zero-length digest.
    Null,
}

impl Authenticator {
    /// Output size in bytes.
    pub fn hash_size(self) -> usize {
        match self {
            Self::Sha1 | Self::HmacSha1 => 20,
            Self::Sha256 | Self::HmacSha256 => 32,
            Self::Null => 0,
        }
    }

    /// Whether the algorithm consumes key material.
    pub fn is_keyed(self) -> bool {
        matches!(self, Self::HmacSha1 | Self::HmacSha256)
    }

    /// Key size in bytes (zero for unkeyed digests).
    pub fn key_size(self) -> usize {
        if self.is_keyed() { self.hash_size() } else { 0 }
    }

    /// Instantiate the digest. `key` is ignored for unkeyed algorithms.
    pub fn create(self, key: &[u8]) -> Result<Box<dyn HashAlgorithm>, CryptoError> {
        if self.is_keyed() && key.len() != self.key_size() {
            return Err(CryptoError::InvalidKeyLength);
        }
        let hash: Box<dyn HashAlgorithm> = match self {
            Self::Sha1 => Box::new(Sha1Hash),
            Self::Sha256 => Box::new(Sha256Hash),
            Self::HmacSha1 => Box::new(HmacSha1::new(key)?),
            Self::HmacSha256 => Box::new(HmacSha256::new(key)?),
            Self::Null => Box::new(NullHash),
        };
        Ok(hash)
    }
}

impl FromStr for Authenticator {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "HMACSHA1" => Ok(Self::HmacSha1),
            "HMACSHA256" => Ok(Self::HmacSha256),
            "NULLHASH" | "NULL" => Ok(Self::Null),
            _ => Err(PolicyError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::HmacSha1 => "HMACSHA1",
            Self::HmacSha256 => "HMACSHA256",
            Self::Null => "NullHash",
        })
    }
}

// =============================================================================
// AES-CBC
// =============================================================================

const AES_BLOCK_SIZE: usize = 16;

/// AES in CBC mode without padding; callers pad.
pub struct AesCbc {
    key: Zeroizing<Vec<u8>>,
}

impl AesCbc {
    /// Create from a 16 or 32 byte key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 | 32 => Ok(Self {
                key: Zeroizing::new(key.to_vec()),
            }),
            _ => Err(CryptoError::InvalidKeyLength),
        }
    }
}

impl SymmetricAlgorithm for AesCbc {
    fn key_size(&self) -> usize {
        self.key.len()
    }

    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn create_encryptor(&self, iv: &[u8]) -> Result<Box<dyn CryptoTransform>, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength;
        let transform: Box<dyn CryptoTransform> = match self.key.len() {
            16 => Box::new(CbcEncrypt(
                cbc::Encryptor::<Aes128>::new_from_slices(&self.key, iv).map_err(invalid)?,
            )),
            _ => Box::new(CbcEncrypt(
                cbc::Encryptor::<Aes256>::new_from_slices(&self.key, iv).map_err(invalid)?,
            )),
        };
        Ok(transform)
    }

    fn create_decryptor(&self, iv: &[u8]) -> Result<Box<dyn CryptoTransform>, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength;
        let transform: Box<dyn CryptoTransform> = match self.key.len() {
            16 => Box::new(CbcDecrypt(
                cbc::Decryptor::<Aes128>::new_from_slices(&self.key, iv).map_err(invalid)?,
            )),
            _ => Box::new(CbcDecrypt(
                cbc::Decryptor::<Aes256>::new_from_slices(&self.key, iv).map_err(invalid)?,
            )),
        };
        Ok(transform)
    }
}

fn block_range<'a>(input: &'a [u8], offset: usize, count: usize) -> Result<&'a [u8], CryptoError> {
    let end = offset.checked_add(count).ok_or(CryptoError::OutOfRange)?;
    input.get(offset..end).ok_or(CryptoError::OutOfRange)
}

fn stage<'a>(input: &[u8], output: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
    if input.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidCiphertextLength(input.len()));
    }
    let out = output.get_mut(..input.len()).ok_or(CryptoError::OutOfRange)?;
    out.copy_from_slice(input);
    Ok(out)
}

struct CbcEncrypt<C>(C);

impl<C: BlockEncryptMut + Send> CryptoTransform for CbcEncrypt<C> {
    fn input_block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn output_block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn can_transform_multiple_blocks(&self) -> bool {
        true
    }

    fn can_reuse_transform(&self) -> bool {
        false
    }

    fn transform_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        let out = stage(input, output)?;
        for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(input.len())
    }

    fn transform_final_block<'a>(
        &mut self,
        input: &'a [u8],
        offset: usize,
        count: usize,
    ) -> Result<Cow<'a, [u8]>, CryptoError> {
        let slice = block_range(input, offset, count)?;
        let mut out = vec![0u8; slice.len()];
        self.transform_block(slice, &mut out)?;
        Ok(Cow::Owned(out))
    }
}

struct CbcDecrypt<C>(C);

impl<C: BlockDecryptMut + Send> CryptoTransform for CbcDecrypt<C> {
    fn input_block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn output_block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn can_transform_multiple_blocks(&self) -> bool {
        true
    }

    fn can_reuse_transform(&self) -> bool {
        false
    }

    fn transform_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        let out = stage(input, output)?;
        for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(input.len())
    }

    fn transform_final_block<'a>(
        &mut self,
        input: &'a [u8],
        offset: usize,
        count: usize,
    ) -> Result<Cow<'a, [u8]>, CryptoError> {
        let slice = block_range(input, offset, count)?;
        let mut out = vec![0u8; slice.len()];
        self.transform_block(slice, &mut out)?;
        Ok(Cow::Owned(out))
    }
}

// =============================================================================
// DIGESTS
// =============================================================================

/// SHA-1 digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Hash;

impl HashAlgorithm for Sha1Hash {
    fn hash_size(&self) -> usize {
        20
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        Sha1::digest(data).to_vec()
    }
}

/// SHA-256 digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hash;

impl HashAlgorithm for Sha256Hash {
    fn hash_size(&self) -> usize {
        32
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

/// HMAC-SHA1.
#[derive(Clone)]
pub struct HmacSha1 {
    mac: Hmac<Sha1>,
}

impl HmacSha1 {
    /// Create with an arbitrary-length key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let mac = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { mac })
    }
}

impl HashAlgorithm for HmacSha1 {
    fn hash_size(&self) -> usize {
        20
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        Mac::update(&mut mac, data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// HMAC-SHA256.
#[derive(Clone)]
pub struct HmacSha256 {
    mac: Hmac<Sha256>,
}

impl HmacSha256 {
    /// Create with an arbitrary-length key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let mac =
            <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { mac })
    }
}

impl HashAlgorithm for HmacSha256 {
    fn hash_size(&self) -> usize {
        32
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        Mac::update(&mut mac, data);
        mac.finalize().into_bytes().to_vec()
    }
}
