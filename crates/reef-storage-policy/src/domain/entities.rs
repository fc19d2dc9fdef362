//! Core domain entities for the storage-policy layer.
//!
//! INVARIANTS:
//! - INVARIANT-1: a key's diversification type only escalates NONE -> SIZE
//!   or NONE -> FREQUENCY, never SIZE <-> FREQUENCY; it reverts to NONE
//!   only through expiry.
//! - INVARIANT-2: at most one key-block record exists per key.
//! - INVARIANT-3: a SIZE record's put offsets are fixed at creation and
//!   never change for the record's lifetime.

use serde::{Deserialize, Serialize};
use shared_types::{Key, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};

/// How a key is currently diversified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiversificationType {
    /// Not diversified; operations use the key itself.
    None,
    /// Remapped because the stored data outgrew the per-key size limits.
    Size,
    /// Remapped because too many distinct readers hit the key.
    Frequency,
}

impl DiversificationType {
    /// Persistent wire code.
    pub fn code(&self) -> u8 {
        match self {
            DiversificationType::None => 0,
            DiversificationType::Size => 1,
            DiversificationType::Frequency => 2,
        }
    }

    /// Decode a persistent wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DiversificationType::None),
            1 => Some(DiversificationType::Size),
            2 => Some(DiversificationType::Frequency),
            _ => None,
        }
    }

    /// Whether the key is remapped at all.
    pub fn is_diversified(&self) -> bool {
        !matches!(self, DiversificationType::None)
    }
}

/// An authoritative declaration that `key` is diversified.
///
/// One record exists per original key. SIZE records carry the put offsets
/// drawn at creation (INVARIANT-3); FREQUENCY records fan out over the full
/// width, so they carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversificationRecord {
    /// The original key.
    pub key: Key,
    /// SIZE or FREQUENCY. Never NONE: an undiversified key has no record.
    pub div_type: DiversificationType,
    /// Wall-clock expiry. Past it the record is dropped on next read.
    pub expiry: Timestamp,
    /// Sub-key offsets used for SIZE puts. Empty for FREQUENCY.
    pub fixed_put_offsets: Vec<u8>,
}

impl DiversificationRecord {
    /// Whether this record has lapsed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }
}

/// Parsed header of a signed key-block directive.
///
/// Wire layout of `request_bytes`:
///
/// ```text
/// byte 0      action: 0 = unblock, 1 = block
/// bytes 1..4  reserved
/// bytes 4..8  creation time, seconds, big-endian u32
/// bytes 8..   target key
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBlockDirective {
    /// True for a block ("add"), false for an unblock ("remove").
    pub is_add: bool,
    /// Creation time embedded by the signer; replay guard.
    pub created_at: Timestamp,
    /// The key the directive targets.
    pub key: Key,
}

/// Fixed header width preceding the target key.
pub const KEY_BLOCK_HEADER_LEN: usize = 8;

/// Shortest well-formed directive: header plus at least one key byte.
pub const KEY_BLOCK_MIN_LEN: usize = KEY_BLOCK_HEADER_LEN + 1;

impl KeyBlockDirective {
    /// Parse a directive from raw request bytes.
    ///
    /// Returns `None` for anything malformed: short payloads, unknown
    /// action codes, or a key portion that is not exactly key-width.
    pub fn parse(request_bytes: &[u8]) -> Option<Self> {
        if request_bytes.len() < KEY_BLOCK_MIN_LEN {
            return None;
        }
        let is_add = match request_bytes[0] {
            0 => false,
            1 => true,
            _ => return None,
        };
        let secs = u32::from_be_bytes(request_bytes[4..8].try_into().ok()?);
        let key = Key::from_slice(&request_bytes[KEY_BLOCK_HEADER_LEN..])?;
        Some(Self {
            is_add,
            created_at: Timestamp::new(u64::from(secs)),
            key,
        })
    }

    /// Assemble request bytes for this directive.
    pub fn to_request_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(KEY_BLOCK_HEADER_LEN + Key::LEN);
        bytes.push(u8::from(self.is_add));
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&(self.created_at.as_secs() as u32).to_be_bytes());
        bytes.extend_from_slice(self.key.as_bytes());
        bytes
    }
}

/// A verified block/unblock directive retained for a key (INVARIANT-2).
#[derive(Debug)]
pub struct KeyBlockRecord {
    /// The signed payload exactly as received.
    pub request_bytes: Vec<u8>,
    /// Signature over `request_bytes`.
    pub certificate_bytes: Vec<u8>,
    /// Local receipt time.
    pub received_at: Timestamp,
    /// True when received first-hand from the acting contact.
    pub is_direct: bool,
    /// One-time "key is blocked" notice emitted; not persisted.
    logged: AtomicBool,
}

impl KeyBlockRecord {
    /// Create a record from an already-parsed directive's raw bytes.
    pub fn new(
        request_bytes: Vec<u8>,
        certificate_bytes: Vec<u8>,
        received_at: Timestamp,
        is_direct: bool,
    ) -> Self {
        Self {
            request_bytes,
            certificate_bytes,
            received_at,
            is_direct,
            logged: AtomicBool::new(false),
        }
    }

    /// Re-parse the embedded directive.
    ///
    /// Records are only constructed from payloads that parsed once, so
    /// this fails only if the payload was corrupted after the fact.
    pub fn directive(&self) -> Option<KeyBlockDirective> {
        KeyBlockDirective::parse(&self.request_bytes)
    }

    /// Whether this record blocks (rather than unblocks) its key.
    pub fn is_add(&self) -> bool {
        self.request_bytes.first() == Some(&1)
    }

    /// Mark the one-time notice as emitted.
    ///
    /// Returns true exactly once per record.
    pub fn mark_logged(&self) -> bool {
        !self.logged.swap(true, Ordering::Relaxed)
    }
}

impl Clone for KeyBlockRecord {
    fn clone(&self) -> Self {
        Self {
            request_bytes: self.request_bytes.clone(),
            certificate_bytes: self.certificate_bytes.clone(),
            received_at: self.received_at,
            is_direct: self.is_direct,
            logged: AtomicBool::new(self.logged.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for KeyBlockRecord {
    fn eq(&self, other: &Self) -> bool {
        self.request_bytes == other.request_bytes
            && self.certificate_bytes == other.certificate_bytes
            && self.received_at == other.received_at
            && self.is_direct == other.is_direct
    }
}

impl Eq for KeyBlockRecord {}
