//! Message-level symmetric encryption.
//!
//! Each message gets a fresh random IV which is sent in front of the
//! ciphertext:
//!
//! ```text
//! +--------------+----------------------------------+
//! | IV           | CBC(plaintext || PKCS#7 padding) |
//! | block bytes  | n * block bytes                  |
//! +--------------+----------------------------------+
//! ```

use rand::{RngCore, rngs::OsRng};

use super::algorithms::SymmetricAlgorithm;
use crate::core::CryptoError;

/// Encrypts and decrypts whole messages with one symmetric algorithm.
pub struct SymmetricEncryption {
    algorithm: Box<dyn SymmetricAlgorithm>,
    block_size: usize,
}

impl SymmetricEncryption {
    /// Wrap a keyed algorithm.
    pub fn new(algorithm: Box<dyn SymmetricAlgorithm>) -> Self {
        let block_size = algorithm.block_size().max(1);
        Self {
            algorithm,
            block_size,
        }
    }

    /// Cipher block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Encrypt `data`, returning `IV || ciphertext`.
    pub fn encrypt_data(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bs = self.block_size;
        let mut iv = vec![0u8; bs];
        OsRng.fill_bytes(&mut iv);

        let pad = bs - (data.len() % bs);
        let mut plain = Vec::with_capacity(data.len() + pad);
        plain.extend_from_slice(data);
        plain.resize(data.len() + pad, pad as u8);

        let mut encryptor = self.algorithm.create_encryptor(&iv)?;
        let mut out = iv;
        let start = out.len();
        out.resize(start + plain.len(), 0);
        encryptor.transform_block(&plain, &mut out[start..])?;
        Ok(out)
    }

    /// Decrypt `IV || ciphertext` and strip the padding.
    pub fn decrypt_data(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bs = self.block_size;
        if data.len() <= bs || (data.len() - bs) % bs != 0 {
            return Err(CryptoError::InvalidCiphertextLength(data.len()));
        }
        let (iv, cipher) = data.split_at(bs);

        let mut decryptor = self.algorithm.create_decryptor(iv)?;
        let mut plain = vec![0u8; cipher.len()];
        decryptor.transform_block(cipher, &mut plain)?;

        let pad = plain.last().copied().unwrap_or(0) as usize;
        if pad == 0 || pad > bs || plain[plain.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(CryptoError::InvalidPadding);
        }
        plain.truncate(plain.len() - pad);
        Ok(plain)
    }
}
