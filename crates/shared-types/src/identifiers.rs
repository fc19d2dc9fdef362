//! Core identifier types for the Reef DHT.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 160-bit DHT key.
///
/// Keys identify stored values in the overlay. They live in the same
/// keyspace as [`ContactId`] so that XOR-metric routing and key-derived
/// sub-keys remain interchangeable with node identifiers.
///
/// # Security
///
/// Comparison is constant-time. A short-circuiting `PartialEq` over the
/// byte array would let a remote peer recover key material through timing
/// measurements when keys are compared on the request path.
// SAFETY: derived_hash_with_manual_eq is intentionally allowed here.
// The manual PartialEq provides constant-time comparison, while Hash over
// the raw bytes stays semantically correct: equal keys hash equally.
#[allow(clippy::derived_hash_with_manual_eq)]
#[derive(Clone, Copy, Hash, Serialize, Deserialize)]
pub struct Key([u8; Key::LEN]);

impl Key {
    /// Key width in bytes (160 bits).
    pub const LEN: usize = 20;

    /// Create a key from a raw 20-byte array.
    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a byte slice.
    ///
    /// Returns `None` unless the slice is exactly [`Key::LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Hex of the first four bytes, for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl PartialEq for Key {
    /// Constant-time comparison.
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Eq for Key {}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}..)", self.short_hex())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 160-bit peer identifier.
///
/// Identifies a contact in the overlay. Doubles as the reader fingerprint
/// fed into the read-rate sampler, so no richer identity is retained there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId([u8; ContactId::LEN]);

impl ContactId {
    /// Identifier width in bytes.
    pub const LEN: usize = 20;

    /// All-zero sentinel, used where no originating contact is known.
    pub const ANONYMOUS: ContactId = ContactId([0u8; Self::LEN]);

    /// Create a contact id from a raw 20-byte array.
    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Create a contact id from a byte slice.
    ///
    /// Returns `None` unless the slice is exactly [`ContactId::LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for ContactId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContactId({}..)", hex::encode(&self.0[..4]))
    }
}

/// Unix timestamp in seconds, clamped to a sane maximum.
///
/// # Security
///
/// Remote-supplied timestamps are clamped so `u64::MAX` cannot corrupt
/// expiry comparisons and eviction ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Maximum accepted timestamp (year 9999).
    pub const MAX_REASONABLE: u64 = 253_402_300_799;

    /// Create a timestamp, clamping to [`Timestamp::MAX_REASONABLE`].
    pub fn new(secs: u64) -> Self {
        Self(secs.min(Self::MAX_REASONABLE))
    }

    /// Create a timestamp, rejecting out-of-range values.
    #[inline]
    pub fn try_new(secs: u64) -> Option<Self> {
        (secs <= Self::MAX_REASONABLE).then_some(Self(secs))
    }

    /// Seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Add seconds, saturating at the maximum.
    pub fn add_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs).min(Self::MAX_REASONABLE))
    }

    /// Subtract seconds, saturating at zero.
    pub fn sub_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }

    /// Seconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn elapsed_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}
