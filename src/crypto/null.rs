//! Pass-through cipher and zero-length hash.
//!
//! Selected by policies whose peers have already agreed on keys out of band,
//! or where the edge below already provides confidentiality. They still
//! honour the full transform contract so the session handler treats them
//! exactly like a real suite.

use std::borrow::Cow;

use super::algorithms::{CryptoTransform, HashAlgorithm, SymmetricAlgorithm};
use crate::core::CryptoError;

/// Cipher that leaves data untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEncryption;

impl SymmetricAlgorithm for NullEncryption {
    fn key_size(&self) -> usize {
        0
    }

    fn block_size(&self) -> usize {
        1
    }

    fn create_encryptor(&self, _iv: &[u8]) -> Result<Box<dyn CryptoTransform>, CryptoError> {
        Ok(Box::new(NullTransform))
    }

    fn create_decryptor(&self, _iv: &[u8]) -> Result<Box<dyn CryptoTransform>, CryptoError> {
        Ok(Box::new(NullTransform))
    }
}

/// Identity transform with a one-byte block.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransform;

impl CryptoTransform for NullTransform {
    fn input_block_size(&self) -> usize {
        1
    }

    fn output_block_size(&self) -> usize {
        1
    }

    fn can_transform_multiple_blocks(&self) -> bool {
        true
    }

    fn can_reuse_transform(&self) -> bool {
        true
    }

    fn transform_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CryptoError> {
        let out = output.get_mut(..input.len()).ok_or(CryptoError::OutOfRange)?;
        out.copy_from_slice(input);
        Ok(input.len())
    }

    fn transform_final_block<'a>(
        &mut self,
        input: &'a [u8],
        offset: usize,
        count: usize,
    ) -> Result<Cow<'a, [u8]>, CryptoError> {
        if offset == 0 && count == input.len() {
            return Ok(Cow::Borrowed(input));
        }
        let end = offset.checked_add(count).ok_or(CryptoError::OutOfRange)?;
        let slice = input.get(offset..end).ok_or(CryptoError::OutOfRange)?;
        Ok(Cow::Owned(slice.to_vec()))
    }
}

/// Hash producing no output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHash;

impl HashAlgorithm for NullHash {
    fn hash_size(&self) -> usize {
        0
    }

    fn compute_hash(&self, _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}
