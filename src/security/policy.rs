//! Security policies keyed by SPI.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::core::{CryptoError, DEFAULT_SPI, PolicyError};
use crate::crypto::{
    Authenticator, Encryptor, HashAlgorithm, KeyDerivation, KeySizes, SymmetricAlgorithm,
};

/// Cipher suite and key-exchange mode selected by an SPI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// SPI this policy is registered under.
    pub index: u32,
    /// Bulk cipher.
    pub encryptor: Encryptor,
    /// Frame authenticator.
    pub authenticator: Authenticator,
    /// Peers share certificates out of band; no CA negotiation.
    pub pre_exchanged_keys: bool,
    /// Session key expansion.
    pub key_derivation: KeyDerivation,
}

impl SecurityPolicy {
    /// Policy with certificate negotiation and the legacy key expansion.
    pub fn new(index: u32, encryptor: Encryptor, authenticator: Authenticator) -> Self {
        Self {
            index,
            encryptor,
            authenticator,
            pre_exchanged_keys: false,
            key_derivation: KeyDerivation::Legacy,
        }
    }

    /// Policy from suite names such as `"Rijndael"` and `"SHA1"`.
    pub fn from_names(index: u32, encryptor: &str, authenticator: &str) -> Result<Self, PolicyError> {
        Ok(Self::new(index, encryptor.parse()?, authenticator.parse()?))
    }

    /// Set whether certificates are exchanged out of band.
    pub fn with_pre_exchanged_keys(mut self, pre_exchanged_keys: bool) -> Self {
        self.pre_exchanged_keys = pre_exchanged_keys;
        self
    }

    /// Set the session key expansion.
    pub fn with_key_derivation(mut self, key_derivation: KeyDerivation) -> Self {
        self.key_derivation = key_derivation;
        self
    }

    /// Sizes of the key material this suite consumes.
    pub fn key_sizes(&self) -> KeySizes {
        KeySizes {
            key: self.encryptor.key_size(),
            block: self.encryptor.block_size(),
            mac: self.authenticator.key_size(),
        }
    }

    /// Keyed cipher instance.
    pub fn create_symmetric_algorithm(
        &self,
        key: &[u8],
    ) -> Result<Box<dyn SymmetricAlgorithm>, CryptoError> {
        self.encryptor.create(key)
    }

    /// Authenticator instance (`key` ignored for unkeyed digests).
    pub fn create_hash_algorithm(&self, key: &[u8]) -> Result<Box<dyn HashAlgorithm>, CryptoError> {
        self.authenticator.create(key)
    }
}

/// Registry of policies.
///
/// A fresh registry always supports [`DEFAULT_SPI`] with AES-256-CBC and
/// SHA-1 and negotiated certificates.
#[derive(Debug)]
pub struct SecurityPolicies {
    policies: RwLock<HashMap<u32, Arc<SecurityPolicy>>>,
}

impl SecurityPolicies {
    /// Registry containing only the default policy.
    pub fn new() -> Self {
        let default = SecurityPolicy::new(DEFAULT_SPI, Encryptor::Aes256Cbc, Authenticator::Sha1);
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_SPI, Arc::new(default));
        Self {
            policies: RwLock::new(policies),
        }
    }

    /// Register `policy` under its index.
    ///
    /// Registering an identical policy again is a no-op; a different policy
    /// for a used SPI is rejected.
    pub fn register(&self, policy: SecurityPolicy) -> Result<Arc<SecurityPolicy>, PolicyError> {
        let mut policies = self.policies.write();
        if let Some(existing) = policies.get(&policy.index) {
            return if **existing == policy {
                Ok(Arc::clone(existing))
            } else {
                Err(PolicyError::Conflict(policy.index))
            };
        }
        debug!(
            spi = policy.index,
            encryptor = %policy.encryptor,
            authenticator = %policy.authenticator,
            pre_exchanged_keys = policy.pre_exchanged_keys,
            "registered security policy"
        );
        let policy = Arc::new(policy);
        policies.insert(policy.index, Arc::clone(&policy));
        Ok(policy)
    }

    /// Replace the default policy's suite.
    pub fn set_default(&self, encryptor: Encryptor, authenticator: Authenticator, pre_exchanged_keys: bool) {
        let policy = SecurityPolicy::new(DEFAULT_SPI, encryptor, authenticator)
            .with_pre_exchanged_keys(pre_exchanged_keys);
        self.policies.write().insert(DEFAULT_SPI, Arc::new(policy));
    }

    /// Policy registered for `spi`.
    pub fn get(&self, spi: u32) -> Result<Arc<SecurityPolicy>, PolicyError> {
        self.policies
            .read()
            .get(&spi)
            .cloned()
            .ok_or(PolicyError::UnsupportedSpi(spi))
    }

    /// Whether `spi` has a policy.
    pub fn supports(&self, spi: u32) -> bool {
        self.policies.read().contains_key(&spi)
    }
}

impl Default for SecurityPolicies {
    fn default() -> Self {
        Self::new()
    }
}
