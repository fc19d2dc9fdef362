//! Service Layer
//!
//! [`StoragePolicyService`] implements the inbound API over the domain
//! stores and the outbound ports. One service instance exists per DHT
//! network instance and is passed by reference into every engine callback;
//! there is no process-wide state.
//!
//! Locking: each logical store has its own lock so a burst of key-block
//! verifications cannot stall diversification bookkeeping. The key-block
//! live set is an `Arc` snapshot behind a `RwLock`: readers clone the
//! pointer, writers rebuild the set off-lock and swap it in a narrow
//! critical section. No operation holds two store locks at once, and all
//! file I/O happens outside the locks.

use crate::domain::config::PolicyConfig;
use crate::domain::diversify::{
    DiversificationOrigin, DiversificationSnapshot, DiversificationStore,
};
use crate::domain::entities::{DiversificationType, KeyBlockDirective, KeyBlockRecord};
use crate::domain::keyblock::{admit, Admission, KeyBlockSnapshot, PersistedKeyBlock, SpamGuard};
use crate::domain::tracker::{Escalation, StorageKeyTracker};
use crate::error::PolicyError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::ports::inbound::StoragePolicyApi;
use crate::ports::outbound::{BlobMap, BlobStore, DirectiveVerifier, TimeSource};
use parking_lot::{Mutex, RwLock};
use shared_types::{ContactId, Key, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Durable store names.
pub const STORE_ADDRESSES: &str = "addresses";
pub const STORE_DIVERSIFICATIONS: &str = "diversifications";
pub const STORE_VERSION: &str = "version";
pub const STORE_KEY_BLOCKS: &str = "keyblocks";
pub const STORE_GENERAL: &str = "general";

const DIV_RECORDS_ENTRY: &[u8] = b"records";
const KB_ENTRIES_ENTRY: &[u8] = b"entries";
const VERSION_ENTRY: &[u8] = b"next";

/// Versions handed out between durable counter writes. The persisted
/// ceiling always exceeds every value handed out, so a restart never
/// repeats one.
const VERSION_SLACK: u64 = 64;

/// Oldest-out cap on the recent-address history.
const MAX_RECENT_ADDRESSES: usize = 16;

struct VersionCounter {
    next: u64,
    persisted_ceiling: u64,
}

/// The storage-policy and trust layer of one DHT node.
pub struct StoragePolicyService<S, V, T>
where
    S: BlobStore,
    V: DirectiveVerifier,
    T: TimeSource,
{
    config: PolicyConfig,
    blob_store: S,
    verifier: V,
    clock: T,
    metrics: Metrics,
    tracker: Mutex<StorageKeyTracker>,
    diversifications: Mutex<DiversificationStore>,
    key_blocks: RwLock<Arc<KeyBlockSnapshot>>,
    key_block_writer: Mutex<()>,
    spam: Mutex<SpamGuard>,
    addresses: Mutex<HashMap<String, Timestamp>>,
    version: Mutex<VersionCounter>,
    general: Mutex<BlobMap>,
}

impl<S, V, T> StoragePolicyService<S, V, T>
where
    S: BlobStore,
    V: DirectiveVerifier,
    T: TimeSource,
{
    /// Build the service, loading every persisted store.
    ///
    /// Corrupt or missing snapshots degrade to empty state; only an
    /// invalid configuration fails construction.
    pub fn new(
        config: PolicyConfig,
        blob_store: S,
        verifier: V,
        clock: T,
    ) -> Result<Self, PolicyError> {
        config.validate()?;
        let now = clock.now();

        let mut diversifications = DiversificationStore::new(config.clone());
        let div_map = blob_store.load(STORE_DIVERSIFICATIONS);
        if let Some(bytes) = div_map.get(DIV_RECORDS_ENTRY) {
            match bincode::deserialize::<DiversificationSnapshot>(bytes) {
                Ok(snapshot) => diversifications.restore(snapshot, now),
                Err(e) => warn!(error = %e, "corrupt diversification snapshot, starting empty"),
            }
        }

        let kb_map = blob_store.load(STORE_KEY_BLOCKS);
        let kb_entries = kb_map
            .get(KB_ENTRIES_ENTRY)
            .and_then(|bytes| {
                bincode::deserialize::<Vec<PersistedKeyBlock>>(bytes)
                    .map_err(|e| warn!(error = %e, "corrupt key-block snapshot, starting empty"))
                    .ok()
            })
            .unwrap_or_default();
        let key_blocks =
            KeyBlockSnapshot::from_persisted(kb_entries, now, config.indirect_block_timeout_secs);

        let mut addresses = HashMap::new();
        for (key, value) in blob_store.load(STORE_ADDRESSES) {
            match (String::from_utf8(key), bincode::deserialize::<u64>(&value)) {
                (Ok(address), Ok(secs)) => {
                    addresses.insert(address, Timestamp::new(secs));
                }
                _ => warn!("skipping corrupt recent-address entry"),
            }
        }

        let stored_version: u64 = blob_store
            .load(STORE_VERSION)
            .get(VERSION_ENTRY)
            .and_then(|bytes| bincode::deserialize(bytes).ok())
            .unwrap_or(0);
        let version = VersionCounter {
            next: stored_version,
            persisted_ceiling: stored_version + VERSION_SLACK,
        };

        let general = blob_store.load(STORE_GENERAL);

        let service = Self {
            spam: Mutex::new(SpamGuard::new(
                config.spam_capacity,
                config.spam_window_secs,
                now,
            )),
            tracker: Mutex::new(StorageKeyTracker::new(config.clone())),
            diversifications: Mutex::new(diversifications),
            key_blocks: RwLock::new(Arc::new(key_blocks)),
            key_block_writer: Mutex::new(()),
            addresses: Mutex::new(addresses),
            version: Mutex::new(version),
            general: Mutex::new(general),
            metrics: Metrics::new(),
            config,
            blob_store,
            verifier,
            clock,
        };
        service.persist_version(service.version.lock().persisted_ceiling);
        Ok(service)
    }

    /// The active configuration.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Current operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn save_store(&self, store: &str, map: &BlobMap) {
        if let Err(e) = self.blob_store.save(store, map) {
            Metrics::incr(&self.metrics.persistence_failures);
            warn!(store, error = %e, "durable write failed, in-memory state stays authoritative");
        }
    }

    fn persist_diversifications(&self, snapshot: DiversificationSnapshot) {
        let mut map = BlobMap::new();
        if !(snapshot.local.is_empty() && snapshot.remote.is_empty()) {
            match bincode::serialize(&snapshot) {
                Ok(bytes) => {
                    map.insert(DIV_RECORDS_ENTRY.to_vec(), bytes);
                }
                Err(e) => {
                    warn!(error = %e, "failed to serialize diversification snapshot");
                    return;
                }
            }
        }
        self.save_store(STORE_DIVERSIFICATIONS, &map);
    }

    fn persist_key_blocks(&self, snapshot: &KeyBlockSnapshot) {
        let mut map = BlobMap::new();
        if !snapshot.is_empty() {
            match bincode::serialize(&snapshot.persisted()) {
                Ok(bytes) => {
                    map.insert(KB_ENTRIES_ENTRY.to_vec(), bytes);
                }
                Err(e) => {
                    warn!(error = %e, "failed to serialize key-block snapshot");
                    return;
                }
            }
        }
        self.save_store(STORE_KEY_BLOCKS, &map);
    }

    fn persist_addresses(&self, addresses: &HashMap<String, Timestamp>) {
        let mut map = BlobMap::new();
        for (address, seen) in addresses {
            if let Ok(bytes) = bincode::serialize(&seen.as_secs()) {
                map.insert(address.clone().into_bytes(), bytes);
            }
        }
        self.save_store(STORE_ADDRESSES, &map);
    }

    fn persist_version(&self, ceiling: u64) {
        let mut map = BlobMap::new();
        match bincode::serialize(&ceiling) {
            Ok(bytes) => {
                map.insert(VERSION_ENTRY.to_vec(), bytes);
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize version counter");
                return;
            }
        }
        self.save_store(STORE_VERSION, &map);
    }

    /// Drop the engine record for a key whose tracker state lapsed, and
    /// rewrite the diversification stores at most once for the event.
    fn revert_expired(&self, key: &Key, now: Timestamp) {
        let snapshot = {
            let mut engine = self.diversifications.lock();
            engine.lookup(key, now);
            engine.remove(key);
            engine.take_dirty().then(|| engine.snapshot())
        };
        if let Some(snapshot) = snapshot {
            self.persist_diversifications(snapshot);
        }
    }

    /// Turn a tracker escalation signal into an engine record.
    fn maybe_escalate(&self, key: &Key, escalation: Escalation, cause: &str) {
        let div_type = match escalation {
            Escalation::None => return,
            Escalation::Size => DiversificationType::Size,
            Escalation::Frequency => DiversificationType::Frequency,
        };
        let now = self.clock.now();
        let (record, snapshot) = {
            let mut engine = self.diversifications.lock();
            let record = engine.create(
                key,
                div_type,
                DiversificationOrigin::Local,
                cause,
                now,
                &mut rand::thread_rng(),
            );
            let snapshot = engine.take_dirty().then(|| engine.snapshot());
            (record, snapshot)
        };
        if let Some(record) = record {
            match record.div_type {
                DiversificationType::Size => Metrics::incr(&self.metrics.size_diversifications),
                DiversificationType::Frequency => {
                    Metrics::incr(&self.metrics.frequency_diversifications)
                }
                DiversificationType::None => {}
            }
            self.tracker
                .lock()
                .set_diversified(key, record.div_type, record.expiry);
        }
        if let Some(snapshot) = snapshot {
            self.persist_diversifications(snapshot);
        }
    }

    fn resolve_keys(&self, key: &Key, is_put: bool, is_exhaustive: bool, max_depth: u8) -> Vec<Key> {
        let now = self.clock.now();
        let (keys, depth_limited, snapshot) = {
            let mut engine = self.diversifications.lock();
            let (keys, depth_limited) = engine.resolve(
                key,
                is_put,
                is_exhaustive,
                max_depth,
                now,
                &mut rand::thread_rng(),
            );
            let snapshot = engine.take_dirty().then(|| engine.snapshot());
            (keys, depth_limited, snapshot)
        };
        Metrics::incr(&self.metrics.resolves);
        if depth_limited {
            Metrics::incr(&self.metrics.depth_limit_hits);
        }
        if let Some(snapshot) = snapshot {
            self.persist_diversifications(snapshot);
        }
        keys
    }

    /// The record a rejected block request falls back to: the standing
    /// block for the key, if one exists. Unblock requests always fall
    /// back to `None`.
    fn standing_block(
        snapshot: &KeyBlockSnapshot,
        directive: &KeyBlockDirective,
        now: Timestamp,
        indirect_timeout_secs: u64,
    ) -> Option<KeyBlockRecord> {
        if !directive.is_add {
            return None;
        }
        snapshot
            .live_record(&directive.key, now, indirect_timeout_secs)
            .filter(|record| record.is_add())
            .map(|record| (**record).clone())
    }
}

impl<S, V, T> StoragePolicyApi for StoragePolicyService<S, V, T>
where
    S: BlobStore,
    V: DirectiveVerifier,
    T: TimeSource,
{
    fn key_created(&self, key: Key, is_local: bool) {
        let now = self.clock.now();
        debug!(key = %key.short_hex(), is_local, "key created");
        let escalation = self.tracker.lock().on_key_created(key, now);
        self.maybe_escalate(&key, escalation, "live-key overflow");
    }

    fn key_deleted(&self, key: &Key) {
        self.tracker.lock().on_key_deleted(key);
        let snapshot = {
            let mut engine = self.diversifications.lock();
            engine.remove(key);
            engine.take_dirty().then(|| engine.snapshot())
        };
        if let Some(snapshot) = snapshot {
            self.persist_diversifications(snapshot);
        }
    }

    fn value_added(&self, key: &Key, value_size: u64) {
        let now = self.clock.now();
        let escalation = self.tracker.lock().on_value_added(key, value_size, now);
        self.maybe_escalate(key, escalation, "size threshold crossed");
    }

    fn value_updated(&self, key: &Key, old_size: u64, new_size: u64) {
        let now = self.clock.now();
        let escalation = self
            .tracker
            .lock()
            .on_value_updated(key, old_size, new_size, now);
        self.maybe_escalate(key, escalation, "size threshold crossed");
    }

    fn value_deleted(&self, key: &Key, value_size: u64) {
        self.tracker.lock().on_value_deleted(key, value_size);
    }

    fn key_read(&self, key: &Key, reader: &ContactId) {
        let now = self.clock.now();
        let escalation = self.tracker.lock().on_value_read(key, reader, now);
        self.maybe_escalate(key, escalation, "read rate threshold crossed");
    }

    fn is_diversified(&self, key: &Key) -> bool {
        let now = self.clock.now();
        let (div_type, reverted) = self.tracker.lock().diversification_type(key, now);
        if reverted {
            self.revert_expired(key, now);
            return false;
        }
        if div_type.is_diversified() {
            return true;
        }
        // Keys this node does not track may still carry a remote record.
        let (found, snapshot) = {
            let mut engine = self.diversifications.lock();
            let found = engine.lookup(key, now).is_some();
            (found, engine.take_dirty().then(|| engine.snapshot()))
        };
        if let Some(snapshot) = snapshot {
            self.persist_diversifications(snapshot);
        }
        found
    }

    fn get_existing_diversification(
        &self,
        key: &Key,
        is_put: bool,
        is_exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Key> {
        self.resolve_keys(key, is_put, is_exhaustive, max_depth)
    }

    fn create_new_diversification(
        &self,
        cause: Option<&ContactId>,
        key: &Key,
        div_type: DiversificationType,
        is_put: bool,
        is_exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Key> {
        if div_type.is_diversified() {
            let now = self.clock.now();
            let cause_label = cause
                .map(|contact| format!("contact {}", hex::encode(&contact.as_bytes()[..4])))
                .unwrap_or_else(|| "engine decision".to_string());
            let origin = if cause.is_some() {
                DiversificationOrigin::Remote
            } else {
                DiversificationOrigin::Local
            };
            let (record, snapshot) = {
                let mut engine = self.diversifications.lock();
                let record = engine.create(
                    key,
                    div_type,
                    origin,
                    &cause_label,
                    now,
                    &mut rand::thread_rng(),
                );
                (record, engine.take_dirty().then(|| engine.snapshot()))
            };
            if let Some(record) = record {
                self.tracker
                    .lock()
                    .set_diversified(key, record.div_type, record.expiry);
            }
            if let Some(snapshot) = snapshot {
                self.persist_diversifications(snapshot);
            }
        }
        self.resolve_keys(key, is_put, is_exhaustive, max_depth)
    }

    fn key_block_request(
        &self,
        originator: Option<&ContactId>,
        request_bytes: &[u8],
        certificate_bytes: &[u8],
    ) -> Option<KeyBlockRecord> {
        let directive = KeyBlockDirective::parse(request_bytes)?;
        let now = self.clock.now();
        let is_direct = originator.is_some();
        let spam_id = originator.copied().unwrap_or(ContactId::ANONYMOUS);
        let timeout = self.config.indirect_block_timeout_secs;

        // Serialize writers; readers never touch this lock.
        let _writer = self.key_block_writer.lock();
        let current = self.key_blocks.read().clone();
        let existing = current.live_record(&directive.key, now, timeout);

        // Identities that already failed verification are dropped without
        // re-running the signature check.
        if self.spam.lock().is_flagged(&spam_id, now) {
            Metrics::incr(&self.metrics.spam_short_circuits);
            return Self::standing_block(&current, &directive, now, timeout);
        }

        match admit(existing.map(|record| record.as_ref()), &directive, is_direct) {
            Admission::Reject => {
                Metrics::incr(&self.metrics.key_blocks_rejected);
                Self::standing_block(&current, &directive, now, timeout)
            }
            admission @ (Admission::InstallBlock | Admission::InstallUnblock) => {
                if !self.verifier.verify(request_bytes, certificate_bytes) {
                    self.spam.lock().flag(&spam_id, now);
                    Metrics::incr(&self.metrics.key_blocks_rejected);
                    warn!(
                        key = %directive.key.short_hex(),
                        is_direct,
                        "key-block directive failed verification"
                    );
                    return Self::standing_block(&current, &directive, now, timeout);
                }

                let record = KeyBlockRecord::new(
                    request_bytes.to_vec(),
                    certificate_bytes.to_vec(),
                    now,
                    is_direct,
                );
                let next = current.with_installed(record.clone(), now, timeout);
                *self.key_blocks.write() = Arc::new(next.clone());
                self.persist_key_blocks(&next);
                Metrics::incr(&self.metrics.key_blocks_accepted);
                info!(
                    key = %directive.key.short_hex(),
                    is_add = directive.is_add,
                    is_direct,
                    "key-block directive installed"
                );
                match admission {
                    Admission::InstallBlock => Some(record),
                    _ => None,
                }
            }
        }
    }

    fn key_block_details(&self, key: &Key) -> Option<KeyBlockRecord> {
        let now = self.clock.now();
        let snapshot = self.key_blocks.read().clone();
        let record = snapshot.live_record(key, now, self.config.indirect_block_timeout_secs)?;
        if !record.is_add() {
            return None;
        }
        if record.mark_logged() {
            info!(key = %key.short_hex(), "serving blocked key for the first time");
        }
        Some((**record).clone())
    }

    fn direct_key_blocks(&self) -> Vec<KeyBlockRecord> {
        self.key_blocks.read().clone().direct_records()
    }

    fn purge_direct_key_blocks(&self) {
        let _writer = self.key_block_writer.lock();
        let current = self.key_blocks.read().clone();
        let next = current.without_direct();
        let dropped = current.len() - next.len();
        *self.key_blocks.write() = Arc::new(next.clone());
        self.persist_key_blocks(&next);
        info!(dropped, "purged direct key blocks after identity change");
    }

    fn record_recent_address(&self, address: &str) {
        let now = self.clock.now();
        let addresses = {
            let mut addresses = self.addresses.lock();
            addresses.insert(address.to_string(), now);
            while addresses.len() > MAX_RECENT_ADDRESSES {
                let oldest = addresses
                    .iter()
                    .min_by_key(|(_, seen)| **seen)
                    .map(|(address, _)| address.clone());
                match oldest {
                    Some(address) => addresses.remove(&address),
                    None => break,
                };
            }
            addresses.clone()
        };
        self.persist_addresses(&addresses);
    }

    fn recent_addresses(&self) -> HashMap<String, Timestamp> {
        self.addresses.lock().clone()
    }

    fn next_version(&self) -> u64 {
        let (value, persist) = {
            let mut counter = self.version.lock();
            let value = counter.next;
            counter.next += 1;
            let persist = (counter.next == counter.persisted_ceiling).then(|| {
                counter.persisted_ceiling = counter.next + VERSION_SLACK;
                counter.persisted_ceiling
            });
            (value, persist)
        };
        if let Some(ceiling) = persist {
            self.persist_version(ceiling);
        }
        value
    }

    fn store_blob(&self, name: &str, bytes: Vec<u8>) {
        let map = {
            let mut general = self.general.lock();
            general.insert(name.as_bytes().to_vec(), bytes);
            general.clone()
        };
        self.save_store(STORE_GENERAL, &map);
    }

    fn load_blob(&self, name: &str) -> Option<Vec<u8>> {
        self.general.lock().get(name.as_bytes()).cloned()
    }

    fn flush(&self) {
        let snapshot = self.diversifications.lock().snapshot();
        self.persist_diversifications(snapshot);

        let key_blocks = self.key_blocks.read().clone();
        self.persist_key_blocks(&key_blocks);

        let addresses = self.addresses.lock().clone();
        self.persist_addresses(&addresses);

        let ceiling = self.version.lock().persisted_ceiling;
        self.persist_version(ceiling);

        let general = self.general.lock().clone();
        self.save_store(STORE_GENERAL, &general);
    }
}
