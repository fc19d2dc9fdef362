//! Inbound port: the contract the host DHT engine calls.
//!
//! Every operation is synchronous and CPU-bound. The engine invokes these
//! from its request-handling threads, so implementations must return
//! quickly, never perform network I/O, and never panic or propagate
//! errors: malformed input and trust failures degrade to safe defaults.

use crate::domain::entities::{DiversificationType, KeyBlockRecord};
use shared_types::{ContactId, Key, Timestamp};
use std::collections::HashMap;

/// Storage-policy and trust API consulted by the DHT engine.
pub trait StoragePolicyApi: Send + Sync {
    /// A key has appeared in the local value store.
    fn key_created(&self, key: Key, is_local: bool);

    /// A key has left the local value store.
    fn key_deleted(&self, key: &Key);

    /// A value was stored under `key`.
    fn value_added(&self, key: &Key, value_size: u64);

    /// A value stored under `key` was replaced in place.
    fn value_updated(&self, key: &Key, old_size: u64, new_size: u64);

    /// A value stored under `key` was removed.
    fn value_deleted(&self, key: &Key, value_size: u64);

    /// A value under `key` was served to `reader`.
    fn key_read(&self, key: &Key, reader: &ContactId);

    /// Whether `key` currently carries any diversification, applying
    /// expiry first.
    fn is_diversified(&self, key: &Key) -> bool;

    /// The concrete keys to use on the wire for an operation on `key`,
    /// honoring existing diversification records only.
    fn get_existing_diversification(
        &self,
        key: &Key,
        is_put: bool,
        is_exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Key>;

    /// Declare `key` diversified (the engine decided independently that it
    /// is hot or abused) and resolve the keys to use.
    ///
    /// `cause` is the contact whose traffic triggered the decision, used
    /// for logging only. While diversification is suspended no record is
    /// created and puts resolve to the original key.
    fn create_new_diversification(
        &self,
        cause: Option<&ContactId>,
        key: &Key,
        div_type: DiversificationType,
        is_put: bool,
        is_exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Key>;

    /// Process a signed block/unblock directive.
    ///
    /// `originator` is the contact performing the operation when the
    /// directive arrived first-hand, `None` when it was learned
    /// indirectly. Returns the installed (or already-standing) block
    /// record, or `None`; the caller cannot distinguish rejection from
    /// absence.
    fn key_block_request(
        &self,
        originator: Option<&ContactId>,
        request_bytes: &[u8],
        certificate_bytes: &[u8],
    ) -> Option<KeyBlockRecord>;

    /// The standing block record for `key`, if any. Unblock records are
    /// never returned.
    fn key_block_details(&self, key: &Key) -> Option<KeyBlockRecord>;

    /// All records received first-hand; safe to propagate further.
    fn direct_key_blocks(&self) -> Vec<KeyBlockRecord>;

    /// Drop all direct records. Called when the node's own identity
    /// changes, since direct trust was scoped to the old identity.
    fn purge_direct_key_blocks(&self);

    /// Remember an external address observation.
    fn record_recent_address(&self, address: &str);

    /// Recently observed external addresses with last-seen times.
    fn recent_addresses(&self) -> HashMap<String, Timestamp>;

    /// Next value from the monotonic version counter. Never repeats
    /// across restarts.
    fn next_version(&self) -> u64;

    /// Stash an opaque blob under `name` in the generic store.
    fn store_blob(&self, name: &str, bytes: Vec<u8>);

    /// Fetch an opaque blob from the generic store.
    fn load_blob(&self, name: &str) -> Option<Vec<u8>>;

    /// Rewrite every dirty store to durable storage.
    fn flush(&self);
}
