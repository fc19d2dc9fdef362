//! Per-key local statistics and escalation triggers.
//!
//! The tracker owns one in-memory record per key the node currently
//! stores: running size/entry counters, the key's own diversification
//! state, and a windowed read sampler. It is pure bookkeeping; the service
//! layer turns the escalation signals returned here into engine calls and
//! persistence writes.

use crate::domain::bloom::BloomFilter;
use crate::domain::config::PolicyConfig;
use crate::domain::entities::DiversificationType;
use shared_types::{ContactId, Key, Timestamp};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Escalation requested by a threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// No threshold crossed.
    None,
    /// Size/entry limits exceeded.
    Size,
    /// Distinct-reader rate exceeded.
    Frequency,
}

/// Approximate distinct-reader counter over a fixed sampling window.
///
/// Fingerprints go into a bloom filter, so identities are not retained
/// exactly and false positives under-count distinct readers. That bias is
/// acceptable: the estimate gates a heuristic trigger, nothing more.
#[derive(Debug, Clone)]
struct ReadSampler {
    filter: BloomFilter,
    window_started: Timestamp,
}

impl ReadSampler {
    const FILTER_BITS: usize = 2048;
    const FILTER_HASHES: usize = 4;

    fn new(now: Timestamp) -> Self {
        Self {
            filter: BloomFilter::new(Self::FILTER_BITS, Self::FILTER_HASHES),
            window_started: now,
        }
    }

    /// Record one read. When the sampling window closes, returns the
    /// closed window's estimated distinct reads per minute.
    fn observe(&mut self, reader: &ContactId, now: Timestamp, window_secs: u64) -> Option<f64> {
        let mut closed_rate = None;
        if now.elapsed_since(self.window_started) >= window_secs {
            let minutes = window_secs as f64 / 60.0;
            closed_rate = Some(self.filter.distinct_estimate() as f64 / minutes);
            self.filter.rotate();
            self.window_started = now;
        }
        self.filter.insert(reader.as_bytes());
        closed_rate
    }
}

/// Local statistics for one stored key.
#[derive(Debug, Clone)]
pub struct StorageKeyRecord {
    /// The tracked key.
    pub key: Key,
    /// Current diversification state. Escalates monotonically from NONE
    /// and reverts only through expiry.
    pub div_type: DiversificationType,
    /// Stored entries under this key.
    pub entry_count: u64,
    /// Stored bytes under this key.
    pub byte_size: u64,
    /// Set while `div_type` is not NONE.
    pub expiry: Option<Timestamp>,
    /// Created past the live-key cap; immediately eligible for SIZE.
    pub degraded: bool,
    sampler: ReadSampler,
}

impl StorageKeyRecord {
    fn new(key: Key, now: Timestamp, degraded: bool) -> Self {
        Self {
            key,
            div_type: DiversificationType::None,
            entry_count: 0,
            byte_size: 0,
            expiry: None,
            degraded,
            sampler: ReadSampler::new(now),
        }
    }
}

/// Tracks every key the local node stores.
pub struct StorageKeyTracker {
    config: PolicyConfig,
    records: HashMap<Key, StorageKeyRecord>,
    overflow_count: u64,
}

impl StorageKeyTracker {
    /// Create an empty tracker.
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            overflow_count: 0,
        }
    }

    /// Register a key. Idempotent.
    ///
    /// Past the live-key cap the record still gets created, but degraded:
    /// refusing to track would break the never-block contract, so the key
    /// is instead made immediately eligible for SIZE diversification.
    pub fn on_key_created(&mut self, key: Key, now: Timestamp) -> Escalation {
        if self.records.contains_key(&key) {
            return Escalation::None;
        }
        let degraded = self.records.len() >= self.config.max_tracked_keys;
        if degraded {
            self.overflow_count += 1;
            warn!(
                key = %key.short_hex(),
                tracked = self.records.len(),
                cap = self.config.max_tracked_keys,
                "live-key cap reached, tracking key in degraded state"
            );
        }
        self.records.insert(key, StorageKeyRecord::new(key, now, degraded));
        if degraded {
            Escalation::Size
        } else {
            Escalation::None
        }
    }

    /// Unregister a key and drop its statistics.
    pub fn on_key_deleted(&mut self, key: &Key) {
        self.records.remove(key);
    }

    /// Account for a stored value.
    pub fn on_value_added(&mut self, key: &Key, value_size: u64, now: Timestamp) -> Escalation {
        self.on_key_created(*key, now);
        let record = match self.records.get_mut(key) {
            Some(record) => record,
            None => return Escalation::None,
        };
        record.entry_count += 1;
        record.byte_size += value_size;
        Self::check_size_escalation(&self.config, record)
    }

    /// Account for an in-place value update.
    pub fn on_value_updated(
        &mut self,
        key: &Key,
        old_size: u64,
        new_size: u64,
        now: Timestamp,
    ) -> Escalation {
        self.on_key_created(*key, now);
        let record = match self.records.get_mut(key) {
            Some(record) => record,
            None => return Escalation::None,
        };
        let grown = record.byte_size + new_size;
        if old_size > grown {
            // Inconsistent event stream from the host; floor at zero.
            warn!(
                key = %key.short_hex(),
                old_size,
                tracked_bytes = record.byte_size,
                "value update exceeds tracked bytes, clamping to zero"
            );
            record.byte_size = 0;
        } else {
            record.byte_size = grown - old_size;
        }
        Self::check_size_escalation(&self.config, record)
    }

    /// Account for a deleted value. Drops the record on the last entry.
    pub fn on_value_deleted(&mut self, key: &Key, value_size: u64) {
        let record = match self.records.get_mut(key) {
            Some(record) => record,
            None => return,
        };
        if record.entry_count == 0 || record.byte_size < value_size {
            warn!(
                key = %key.short_hex(),
                entries = record.entry_count,
                tracked_bytes = record.byte_size,
                value_size,
                "delete event below zero, clamping counters"
            );
        }
        record.entry_count = record.entry_count.saturating_sub(1);
        record.byte_size = record.byte_size.saturating_sub(value_size);
        if record.entry_count == 0 {
            self.records.remove(key);
        }
    }

    /// Record a read by `reader` and evaluate the frequency threshold at
    /// window close.
    pub fn on_value_read(&mut self, key: &Key, reader: &ContactId, now: Timestamp) -> Escalation {
        let window_secs = self.config.read_window_secs;
        let threshold = f64::from(self.config.max_reads_per_min);
        let record = match self.records.get_mut(key) {
            Some(record) => record,
            None => return Escalation::None,
        };
        let closed_rate = record.sampler.observe(reader, now, window_secs);
        if record.div_type.is_diversified() {
            return Escalation::None;
        }
        match closed_rate {
            Some(rate) if rate > threshold => {
                debug!(
                    key = %key.short_hex(),
                    rate,
                    threshold,
                    "read rate over threshold"
                );
                Escalation::Frequency
            }
            _ => Escalation::None,
        }
    }

    /// Current diversification type for a key, applying expiry first.
    ///
    /// The second element is true when this call reverted an escalated
    /// type to NONE; the caller must rewrite the diversification stores
    /// exactly once per such event.
    pub fn diversification_type(
        &mut self,
        key: &Key,
        now: Timestamp,
    ) -> (DiversificationType, bool) {
        let record = match self.records.get_mut(key) {
            Some(record) => record,
            None => return (DiversificationType::None, false),
        };
        if let Some(expiry) = record.expiry {
            if now >= expiry {
                debug!(key = %key.short_hex(), "diversification expired, reverting to NONE");
                record.div_type = DiversificationType::None;
                record.expiry = None;
                return (DiversificationType::None, true);
            }
        }
        (record.div_type, false)
    }

    /// Apply an escalation decided by the diversification engine.
    ///
    /// Escalation is monotonic: a key that already carries SIZE or
    /// FREQUENCY keeps it (INVARIANT-1).
    pub fn set_diversified(&mut self, key: &Key, div_type: DiversificationType, expiry: Timestamp) {
        if let Some(record) = self.records.get_mut(key) {
            if record.div_type.is_diversified() {
                return;
            }
            record.div_type = div_type;
            record.expiry = Some(expiry);
        }
    }

    /// Whether `key` is currently tracked.
    pub fn is_tracked(&self, key: &Key) -> bool {
        self.records.contains_key(key)
    }

    /// Number of live tracked keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys registered past the cap since startup.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Tracked statistics for a key, if any.
    pub fn record(&self, key: &Key) -> Option<&StorageKeyRecord> {
        self.records.get(key)
    }

    /// Whether the record now warrants a SIZE escalation.
    fn check_size_escalation(config: &PolicyConfig, record: &StorageKeyRecord) -> Escalation {
        if record.div_type.is_diversified() {
            return Escalation::None;
        }
        if record.degraded
            || record.entry_count > config.max_entries_per_key
            || record.byte_size > config.max_bytes_per_key
        {
            debug!(
                key = %record.key.short_hex(),
                entries = record.entry_count,
                bytes = record.byte_size,
                "size limits exceeded"
            );
            Escalation::Size
        } else {
            Escalation::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> Key {
        Key::new([seed; 20])
    }

    fn reader(seed: u8) -> ContactId {
        ContactId::new([seed; 20])
    }

    fn tracker() -> StorageKeyTracker {
        StorageKeyTracker::new(PolicyConfig::default())
    }

    #[test]
    fn test_key_lifecycle() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);

        assert_eq!(tracker.on_key_created(key(1), now), Escalation::None);
        assert!(tracker.is_tracked(&key(1)));

        tracker.on_key_deleted(&key(1));
        assert!(!tracker.is_tracked(&key(1)));
    }

    #[test]
    fn test_entry_threshold_escalates_size() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);
        tracker.on_key_created(key(1), now);

        let mut escalated = false;
        for i in 0..2049 {
            match tracker.on_value_added(&key(1), 1, now) {
                Escalation::Size => {
                    assert_eq!(i, 2048, "escalation should fire on the 2049th entry");
                    escalated = true;
                }
                Escalation::None => {}
                other => panic!("unexpected escalation {other:?}"),
            }
        }
        assert!(escalated);
    }

    #[test]
    fn test_byte_threshold_escalates_size() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);
        tracker.on_key_created(key(1), now);

        assert_eq!(tracker.on_value_added(&key(1), 1024, now), Escalation::None);
        assert_eq!(
            tracker.on_value_added(&key(1), 2 * 1024 * 1024, now),
            Escalation::Size
        );
    }

    #[test]
    fn test_delete_clamps_at_zero_and_drops_record() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);
        tracker.on_value_added(&key(1), 100, now);

        // Inconsistent: deleting more bytes than tracked.
        tracker.on_value_deleted(&key(1), 500);
        assert!(!tracker.is_tracked(&key(1)), "record drops with last entry");
    }

    #[test]
    fn test_update_adjusts_bytes_without_entries() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);
        tracker.on_value_added(&key(1), 100, now);

        tracker.on_value_updated(&key(1), 100, 300, now);
        let record = tracker.record(&key(1)).unwrap();
        assert_eq!(record.byte_size, 300);
        assert_eq!(record.entry_count, 1);
    }

    #[test]
    fn test_overflow_creates_degraded_records() {
        let config = PolicyConfig::default().with_max_tracked_keys(2);
        let mut tracker = StorageKeyTracker::new(config);
        let now = Timestamp::new(1000);

        assert_eq!(tracker.on_key_created(key(1), now), Escalation::None);
        assert_eq!(tracker.on_key_created(key(2), now), Escalation::None);
        assert_eq!(tracker.on_key_created(key(3), now), Escalation::Size);
        assert!(tracker.record(&key(3)).unwrap().degraded);
        assert_eq!(tracker.overflow_count(), 1);
    }

    #[test]
    fn test_read_rate_escalates_frequency() {
        let mut tracker = tracker();
        let start = Timestamp::new(1000);
        tracker.on_value_added(&key(1), 10, start);

        // 600 distinct readers inside the 10-minute window: 60 reads/min.
        for i in 0..600u16 {
            let fingerprint = ContactId::new([
                (i >> 8) as u8,
                i as u8,
                3,
                4,
                5,
                6,
                7,
                8,
                9,
                10,
                11,
                12,
                13,
                14,
                15,
                16,
                17,
                18,
                19,
                20,
            ]);
            assert_eq!(
                tracker.on_value_read(&key(1), &fingerprint, start),
                Escalation::None
            );
        }

        // First read past the window closes it and evaluates the rate.
        let later = start.add_secs(600);
        assert_eq!(
            tracker.on_value_read(&key(1), &reader(99), later),
            Escalation::Frequency
        );
    }

    #[test]
    fn test_quiet_key_never_escalates_frequency() {
        let mut tracker = tracker();
        let start = Timestamp::new(1000);
        tracker.on_value_added(&key(1), 10, start);

        for i in 0..50u8 {
            tracker.on_value_read(&key(1), &reader(i), start);
        }
        // 50 readers over 10 minutes: well under 30/min.
        assert_eq!(
            tracker.on_value_read(&key(1), &reader(200), start.add_secs(600)),
            Escalation::None
        );
    }

    #[test]
    fn test_expiry_reverts_to_none_once() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);
        tracker.on_value_added(&key(1), 10, now);
        tracker.set_diversified(&key(1), DiversificationType::Size, now.add_secs(100));

        assert_eq!(
            tracker.diversification_type(&key(1), now),
            (DiversificationType::Size, false)
        );

        let after = now.add_secs(100);
        assert_eq!(
            tracker.diversification_type(&key(1), after),
            (DiversificationType::None, true),
            "first post-expiry read reverts and reports it"
        );
        assert_eq!(
            tracker.diversification_type(&key(1), after),
            (DiversificationType::None, false),
            "reversion is reported at most once"
        );
    }

    #[test]
    fn test_escalation_is_monotonic() {
        let mut tracker = tracker();
        let now = Timestamp::new(1000);
        tracker.on_value_added(&key(1), 10, now);

        tracker.set_diversified(&key(1), DiversificationType::Frequency, now.add_secs(500));
        tracker.set_diversified(&key(1), DiversificationType::Size, now.add_secs(900));

        assert_eq!(
            tracker.diversification_type(&key(1), now),
            (DiversificationType::Frequency, false),
            "an escalated key never switches type"
        );
    }
}
