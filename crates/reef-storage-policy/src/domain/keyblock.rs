//! Key-block trust decisions and the immutable live-record snapshot.
//!
//! A key block is a signed, network-wide instruction to suppress (block)
//! or restore (unblock) a key. The decision logic here is pure; signature
//! verification and snapshot swapping live behind ports in the service
//! layer.
//!
//! Precedence rules:
//! - direct knowledge always outranks gossip: an existing direct record is
//!   never displaced by an indirect directive;
//! - the directive's embedded creation time is a replay guard: older
//!   directives never displace fresher state;
//! - unblocks are only honored first-hand, and the unblock record is
//!   retained so that a replayed older block cannot resurrect itself.

use crate::domain::bloom::BloomFilter;
use crate::domain::entities::{KeyBlockDirective, KeyBlockRecord};
use serde::{Deserialize, Serialize};
use shared_types::{ContactId, Key, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of the pre-verification admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Verify the signature, then install the block record.
    InstallBlock,
    /// Verify the signature, then replace any record with the unblock.
    InstallUnblock,
    /// Drop the directive; the store stays unchanged.
    Reject,
}

/// Decide whether a parsed directive may displace the existing record.
///
/// Runs before the (expensive) signature check so obviously-losing
/// directives never reach the verifier.
pub fn admit(
    existing: Option<&KeyBlockRecord>,
    directive: &KeyBlockDirective,
    is_direct: bool,
) -> Admission {
    if let Some(existing) = existing {
        if existing.is_direct && !is_direct {
            return Admission::Reject;
        }
        if let Some(prior) = existing.directive() {
            if prior.created_at > directive.created_at {
                return Admission::Reject;
            }
        }
    }

    if directive.is_add {
        match existing {
            Some(existing) if existing.is_add() => Admission::Reject,
            _ => Admission::InstallBlock,
        }
    } else {
        let removable = existing.map(KeyBlockRecord::is_add).unwrap_or(true);
        if is_direct && removable {
            Admission::InstallUnblock
        } else {
            Admission::Reject
        }
    }
}

/// Persisted form of one key-block entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedKeyBlock {
    pub request_bytes: Vec<u8>,
    pub certificate_bytes: Vec<u8>,
    pub received_at: Timestamp,
    pub is_direct: bool,
}

/// Immutable set of live key-block records.
///
/// Shared behind an `Arc` so the hot read path clones a pointer instead of
/// taking a lock. Writers derive a new snapshot and swap it in whole.
#[derive(Debug, Clone, Default)]
pub struct KeyBlockSnapshot {
    records: HashMap<Key, Arc<KeyBlockRecord>>,
}

impl KeyBlockSnapshot {
    /// The empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The record for `key`, if it is still live at `now`.
    ///
    /// Indirect records lapse `indirect_timeout_secs` after receipt; a
    /// lapsed record is treated as absent (it is physically dropped at the
    /// next snapshot derivation).
    pub fn live_record(
        &self,
        key: &Key,
        now: Timestamp,
        indirect_timeout_secs: u64,
    ) -> Option<&Arc<KeyBlockRecord>> {
        self.records.get(key).filter(|record| {
            record.is_direct
                || now.elapsed_since(record.received_at) < indirect_timeout_secs
        })
    }

    /// All currently direct records.
    pub fn direct_records(&self) -> Vec<KeyBlockRecord> {
        self.records
            .values()
            .filter(|record| record.is_direct)
            .map(|record| (**record).clone())
            .collect()
    }

    /// Derive a snapshot with `record` installed for its target key.
    ///
    /// Also drops lapsed indirect records while the set is being copied.
    pub fn with_installed(
        &self,
        record: KeyBlockRecord,
        now: Timestamp,
        indirect_timeout_secs: u64,
    ) -> Self {
        let key = match record.directive() {
            Some(directive) => directive.key,
            None => return self.clone(),
        };
        let mut records = self.pruned_records(now, indirect_timeout_secs);
        records.insert(key, Arc::new(record));
        Self { records }
    }

    /// Derive a snapshot without any direct records.
    pub fn without_direct(&self) -> Self {
        Self {
            records: self
                .records
                .iter()
                .filter(|(_, record)| !record.is_direct)
                .map(|(key, record)| (*key, Arc::clone(record)))
                .collect(),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializable entry list for persistence.
    pub fn persisted(&self) -> Vec<PersistedKeyBlock> {
        self.records
            .values()
            .map(|record| PersistedKeyBlock {
                request_bytes: record.request_bytes.clone(),
                certificate_bytes: record.certificate_bytes.clone(),
                received_at: record.received_at,
                is_direct: record.is_direct,
            })
            .collect()
    }

    /// Rebuild a snapshot from persisted entries.
    ///
    /// Malformed entries and lapsed indirect records are skipped; a
    /// corrupt blob degrades to a smaller (or empty) set, never an error.
    pub fn from_persisted(
        entries: Vec<PersistedKeyBlock>,
        now: Timestamp,
        indirect_timeout_secs: u64,
    ) -> Self {
        let mut records = HashMap::new();
        for entry in entries {
            let directive = match KeyBlockDirective::parse(&entry.request_bytes) {
                Some(directive) => directive,
                None => continue,
            };
            if !entry.is_direct
                && now.elapsed_since(entry.received_at) >= indirect_timeout_secs
            {
                continue;
            }
            records.insert(
                directive.key,
                Arc::new(KeyBlockRecord::new(
                    entry.request_bytes,
                    entry.certificate_bytes,
                    entry.received_at,
                    entry.is_direct,
                )),
            );
        }
        Self { records }
    }

    fn pruned_records(
        &self,
        now: Timestamp,
        indirect_timeout_secs: u64,
    ) -> HashMap<Key, Arc<KeyBlockRecord>> {
        self.records
            .iter()
            .filter(|(_, record)| {
                record.is_direct
                    || now.elapsed_since(record.received_at) < indirect_timeout_secs
            })
            .map(|(key, record)| (*key, Arc::clone(record)))
            .collect()
    }
}

/// Rolling anti-spam filter over identities that failed verification.
///
/// Once an identity is noted, later directives from it are rejected
/// without re-running the signature check. The filter is rebuilt on a
/// fixed interval so false positives (and reformed peers) age out.
pub struct SpamGuard {
    filter: BloomFilter,
    built_at: Timestamp,
    window_secs: u64,
}

impl SpamGuard {
    /// Create a guard sized for roughly `capacity` identities.
    pub fn new(capacity: usize, window_secs: u64, now: Timestamp) -> Self {
        Self {
            filter: BloomFilter::with_capacity(capacity, 0.01),
            built_at: now,
            window_secs,
        }
    }

    /// Whether `id` has recently failed verification.
    pub fn is_flagged(&mut self, id: &ContactId, now: Timestamp) -> bool {
        self.refresh(now);
        self.filter.contains(id.as_bytes())
    }

    /// Note a failed verification by `id`.
    pub fn flag(&mut self, id: &ContactId, now: Timestamp) {
        self.refresh(now);
        self.filter.insert(id.as_bytes());
    }

    fn refresh(&mut self, now: Timestamp) {
        if now.elapsed_since(self.built_at) >= self.window_secs {
            self.filter.rotate();
            self.built_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> Key {
        Key::new([seed; 20])
    }

    fn directive(is_add: bool, created_secs: u64, key_seed: u8) -> KeyBlockDirective {
        KeyBlockDirective {
            is_add,
            created_at: Timestamp::new(created_secs),
            key: key(key_seed),
        }
    }

    fn record(is_add: bool, created_secs: u64, key_seed: u8, is_direct: bool) -> KeyBlockRecord {
        KeyBlockRecord::new(
            directive(is_add, created_secs, key_seed).to_request_bytes(),
            vec![0u8; 64],
            Timestamp::new(created_secs),
            is_direct,
        )
    }

    #[test]
    fn test_fresh_block_installs() {
        assert_eq!(
            admit(None, &directive(true, 100, 1), false),
            Admission::InstallBlock
        );
    }

    #[test]
    fn test_direct_record_outranks_indirect_directive() {
        let existing = record(true, 100, 1, true);
        assert_eq!(
            admit(Some(&existing), &directive(true, 200, 1), false),
            Admission::Reject
        );
        assert_eq!(
            admit(Some(&existing), &directive(false, 200, 1), false),
            Admission::Reject
        );
    }

    #[test]
    fn test_stale_directive_rejected() {
        let existing = record(true, 500, 1, false);
        assert_eq!(
            admit(Some(&existing), &directive(true, 400, 1), true),
            Admission::Reject
        );
        assert_eq!(
            admit(Some(&existing), &directive(false, 400, 1), true),
            Admission::Reject
        );
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let existing = record(true, 100, 1, false);
        assert_eq!(
            admit(Some(&existing), &directive(true, 200, 1), false),
            Admission::Reject
        );
    }

    #[test]
    fn test_block_displaces_retained_unblock() {
        let existing = record(false, 100, 1, true);
        assert_eq!(
            admit(Some(&existing), &directive(true, 200, 1), true),
            Admission::InstallBlock
        );
    }

    #[test]
    fn test_unblock_requires_direct() {
        let existing = record(true, 100, 1, false);
        assert_eq!(
            admit(Some(&existing), &directive(false, 200, 1), false),
            Admission::Reject
        );
        assert_eq!(
            admit(Some(&existing), &directive(false, 200, 1), true),
            Admission::InstallUnblock
        );
        assert_eq!(
            admit(None, &directive(false, 200, 1), true),
            Admission::InstallUnblock
        );
    }

    #[test]
    fn test_unblock_over_unblock_rejected() {
        let existing = record(false, 100, 1, true);
        assert_eq!(
            admit(Some(&existing), &directive(false, 200, 1), true),
            Admission::Reject
        );
    }

    #[test]
    fn test_snapshot_install_and_lookup() {
        let now = Timestamp::new(1000);
        let snapshot = KeyBlockSnapshot::empty()
            .with_installed(record(true, 100, 1, true), now, 86_400);

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.live_record(&key(1), now, 86_400).is_some());
        assert!(snapshot.live_record(&key(2), now, 86_400).is_none());
    }

    #[test]
    fn test_indirect_records_lapse() {
        let received = Timestamp::new(1000);
        let snapshot = KeyBlockSnapshot::empty().with_installed(
            KeyBlockRecord::new(
                directive(true, 100, 1).to_request_bytes(),
                vec![0u8; 64],
                received,
                false,
            ),
            received,
            86_400,
        );

        let before = received.add_secs(86_399);
        assert!(snapshot.live_record(&key(1), before, 86_400).is_some());

        let after = received.add_secs(86_400);
        assert!(snapshot.live_record(&key(1), after, 86_400).is_none());

        // Deriving a new snapshot physically drops the lapsed record.
        let derived = snapshot.with_installed(record(true, 100, 2, true), after, 86_400);
        assert_eq!(derived.len(), 1);
    }

    #[test]
    fn test_direct_records_and_purge() {
        let now = Timestamp::new(1000);
        let snapshot = KeyBlockSnapshot::empty()
            .with_installed(record(true, 100, 1, true), now, 86_400)
            .with_installed(record(true, 100, 2, false), now, 86_400);

        assert_eq!(snapshot.direct_records().len(), 1);

        let purged = snapshot.without_direct();
        assert_eq!(purged.len(), 1);
        assert!(purged.direct_records().is_empty());
        assert!(purged.live_record(&key(2), now, 86_400).is_some());
    }

    #[test]
    fn test_persistence_roundtrip_skips_malformed() {
        let now = Timestamp::new(1000);
        let snapshot = KeyBlockSnapshot::empty()
            .with_installed(record(true, 100, 1, true), now, 86_400);

        let mut entries = snapshot.persisted();
        entries.push(PersistedKeyBlock {
            request_bytes: vec![1, 2, 3],
            certificate_bytes: vec![],
            received_at: now,
            is_direct: true,
        });

        let restored = KeyBlockSnapshot::from_persisted(entries, now, 86_400);
        assert_eq!(restored.len(), 1);
        assert!(restored.live_record(&key(1), now, 86_400).is_some());
    }

    #[test]
    fn test_spam_guard_flags_and_rotates() {
        let now = Timestamp::new(1000);
        let mut guard = SpamGuard::new(4000, 1800, now);
        let id = ContactId::new([9; 20]);

        assert!(!guard.is_flagged(&id, now));
        guard.flag(&id, now);
        assert!(guard.is_flagged(&id, now.add_secs(60)));

        // Past the rebuild interval the filter starts fresh.
        assert!(!guard.is_flagged(&id, now.add_secs(1800)));
    }
}
