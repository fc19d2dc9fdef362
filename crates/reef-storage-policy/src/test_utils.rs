//! Deterministic test doubles and fixture helpers.
//!
//! Shipped in the crate (not behind `cfg(test)`) so downstream crates and
//! the simulator can drive the policy layer with a controlled clock.

use crate::domain::entities::KeyBlockDirective;
use crate::ports::outbound::TimeSource;
use parking_lot::Mutex;
use shared_crypto::KeyPair;
use shared_types::{ContactId, Key, Timestamp};

/// Manually advanced time source.
pub struct ManualClock {
    now: Mutex<u64>,
}

impl ManualClock {
    /// Create a clock frozen at `secs`.
    pub fn new(secs: u64) -> Self {
        Self {
            now: Mutex::new(secs),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        *self.now.lock() += secs;
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, secs: u64) {
        *self.now.lock() = secs;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(*self.now.lock())
    }
}

/// A key with every byte set to `seed`.
pub fn test_key(seed: u8) -> Key {
    Key::new([seed; 20])
}

/// A contact id with every byte set to `seed`.
pub fn test_contact(seed: u8) -> ContactId {
    ContactId::new([seed; 20])
}

/// Build a signed block/unblock request for `key`.
///
/// Returns `(request_bytes, certificate_bytes)` signed by `signer`.
pub fn signed_block_request(
    signer: &KeyPair,
    is_add: bool,
    created_at: Timestamp,
    key: Key,
) -> (Vec<u8>, Vec<u8>) {
    let request = KeyBlockDirective {
        is_add,
        created_at,
        key,
    }
    .to_request_bytes();
    let certificate = signer.sign(&request).as_bytes().to_vec();
    (request, certificate)
}
