//! Set-once cells used for handshake state.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::{SecurityError, SecurityResult};

/// A cell that accepts one value for its lifetime.
///
/// Setting the value already stored succeeds; setting a different value
/// fails. Duplicate handshake messages therefore become no-ops while
/// conflicting ones surface as errors.
#[derive(Debug)]
pub struct WriteOnceIdempotent<T> {
    name: &'static str,
    value: OnceLock<T>,
}

impl<T: PartialEq> WriteOnceIdempotent<T> {
    /// Create an empty cell. `name` appears in conflict errors.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: OnceLock::new(),
        }
    }

    /// Store `value`, or confirm it equals the stored one.
    pub fn set(&self, value: T) -> SecurityResult<()> {
        match self.value.set(value) {
            Ok(()) => Ok(()),
            Err(rejected) => match self.value.get() {
                Some(current) if *current == rejected => Ok(()),
                _ => Err(SecurityError::AlreadySet(self.name)),
            },
        }
    }

    /// The stored value, if any.
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Whether a value has been stored.
    pub fn is_set(&self) -> bool {
        self.value.get().is_some()
    }
}

/// A flag that can be raised exactly once.
#[derive(Debug, Default)]
pub struct FireOnce(AtomicBool);

impl FireOnce {
    /// Create an unfired flag.
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Raise the flag. Returns true only for the call that raised it.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the flag has been raised.
    pub fn has_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
