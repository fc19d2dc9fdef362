//! SHA-1 key derivation.
//!
//! The overlay derives 160-bit keys from content hashes, so derived
//! sub-keys use the same digest and stay inside that keyspace. Derivation
//! must be pure: every node, on every restart, maps the same (key, offset)
//! pair to the same sub-key, otherwise writers and readers disagree on
//! where a remapped key lives.

use sha1::{Digest, Sha1};
use shared_types::Key;

/// Hash arbitrary bytes down to a 160-bit key.
pub fn digest_key(data: &[u8]) -> Key {
    let digest = Sha1::digest(data);
    let mut bytes = [0u8; Key::LEN];
    bytes.copy_from_slice(digest.as_slice());
    Key::new(bytes)
}

/// Derive the sub-key for `key` at `offset`.
///
/// Computed as `SHA-1(key || offset)`. Stable across calls, restarts and
/// nodes.
pub fn derive_sub_key(key: &Key, offset: u8) -> Key {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update([offset]);
    let digest = hasher.finalize();
    let mut bytes = [0u8; Key::LEN];
    bytes.copy_from_slice(digest.as_slice());
    Key::new(bytes)
}
