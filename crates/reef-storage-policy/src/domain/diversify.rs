//! Diversification records and the key-expansion algorithm.
//!
//! Diversification remaps a hot or oversized key onto synthetic sub-keys
//! derived as `SHA-1(key || offset)`. The mapping must agree network-wide
//! without coordination, so puts expand deterministically (all writers land
//! on the same sub-keys) while gets may sample randomly to spread read
//! load.
//!
//! INVARIANTS:
//! - INVARIANT-1: `resolve` terminates within `max_depth` expansion rounds
//!   and expands any given key at most once per call.
//! - INVARIANT-2: a live record's expansion for puts is identical across
//!   calls, restarts and nodes.

use crate::domain::config::PolicyConfig;
use crate::domain::entities::{DiversificationRecord, DiversificationType};
use rand::Rng;
use serde::{Deserialize, Serialize};
use shared_crypto::derive_sub_key;
use shared_types::{Key, Timestamp};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Who declared a diversification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiversificationOrigin {
    /// This node escalated the key from its own statistics.
    Local,
    /// Another node declared the key diversified during an operation.
    Remote,
}

/// Persisted form of the record set: `{local: [...], remote: [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiversificationSnapshot {
    pub local: Vec<DiversificationRecord>,
    pub remote: Vec<DiversificationRecord>,
}

/// Creates, looks up and expires diversification records, and resolves a
/// key to the concrete set of keys to use on the wire.
pub struct DiversificationStore {
    config: PolicyConfig,
    local: HashMap<Key, DiversificationRecord>,
    remote: HashMap<Key, DiversificationRecord>,
    dirty: bool,
}

impl DiversificationStore {
    /// Create an empty store.
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            local: HashMap::new(),
            remote: HashMap::new(),
            dirty: false,
        }
    }

    /// Look up the live record for a key, local records first.
    ///
    /// An expired record is removed on read and `None` is returned.
    pub fn lookup(&mut self, key: &Key, now: Timestamp) -> Option<DiversificationRecord> {
        for map_is_local in [true, false] {
            let map = if map_is_local { &mut self.local } else { &mut self.remote };
            if let Some(record) = map.get(key) {
                if record.is_expired(now) {
                    debug!(key = %key.short_hex(), "diversification record expired, dropping");
                    map.remove(key);
                    self.dirty = true;
                    continue;
                }
                return Some(record.clone());
            }
        }
        None
    }

    /// Create a diversification record for `key`, or return the live one.
    ///
    /// Idempotent: an existing live record is returned unchanged. While
    /// diversification is suspended no record is created and `None` is
    /// returned. SIZE records draw their fixed put offsets here, once.
    pub fn create<R: Rng>(
        &mut self,
        key: &Key,
        div_type: DiversificationType,
        origin: DiversificationOrigin,
        cause: &str,
        now: Timestamp,
        rng: &mut R,
    ) -> Option<DiversificationRecord> {
        if !div_type.is_diversified() {
            return None;
        }
        if let Some(existing) = self.lookup(key, now) {
            return Some(existing);
        }
        if self.config.is_suspended(now) {
            debug!(key = %key.short_hex(), "diversification suspended, skipping escalation");
            return None;
        }

        let jitter = if self.config.lifetime_jitter_secs > 0 {
            rng.gen_range(0..self.config.lifetime_jitter_secs)
        } else {
            0
        };
        let expiry = now.add_secs(self.config.min_lifetime_secs + jitter);
        let fixed_put_offsets = match div_type {
            DiversificationType::Size => self.draw_offsets(rng),
            _ => Vec::new(),
        };
        let record = DiversificationRecord {
            key: *key,
            div_type,
            expiry,
            fixed_put_offsets,
        };
        info!(
            key = %key.short_hex(),
            ?div_type,
            ?origin,
            cause,
            expiry = expiry.as_secs(),
            "created diversification"
        );
        let map = match origin {
            DiversificationOrigin::Local => &mut self.local,
            DiversificationOrigin::Remote => &mut self.remote,
        };
        map.insert(*key, record.clone());
        self.dirty = true;
        Some(record)
    }

    /// Drop any record for `key` (explicit key deletion).
    pub fn remove(&mut self, key: &Key) {
        let removed = self.local.remove(key).is_some() | self.remote.remove(key).is_some();
        if removed {
            self.dirty = true;
        }
    }

    /// Resolve `key` to the concrete keys to use on the wire.
    ///
    /// Walks the working set, replacing each key that has a live record
    /// with its expansion. A key is expanded at most once per call
    /// (re-encountering it keeps it literally, which breaks cycles), and
    /// expansion stops after `max_depth` rounds. Returns the deduplicated
    /// key list in first-seen order, plus whether the depth bound cut the
    /// walk short.
    pub fn resolve<R: Rng>(
        &mut self,
        key: &Key,
        is_put: bool,
        is_exhaustive: bool,
        max_depth: u8,
        now: Timestamp,
        rng: &mut R,
    ) -> (Vec<Key>, bool) {
        if is_put && self.config.is_suspended(now) {
            // Put traffic gains no new locations while suspended; reads
            // still honor records created before the suspension window.
            return (vec![*key], false);
        }

        let mut work: Vec<Key> = vec![*key];
        let mut expanded: HashSet<Key> = HashSet::new();
        let mut depth_limited = false;

        for round in 0.. {
            let expandable = work
                .iter()
                .any(|k| !expanded.contains(k) && self.lookup(k, now).is_some());
            if !expandable {
                break;
            }
            if round >= u32::from(max_depth) {
                warn!(
                    key = %key.short_hex(),
                    max_depth,
                    "diversification chain hit depth bound, keeping remaining keys literal"
                );
                depth_limited = true;
                break;
            }

            let mut next: Vec<Key> = Vec::with_capacity(work.len());
            for current in work {
                match self.lookup(&current, now) {
                    Some(record) if !expanded.contains(&current) => {
                        expanded.insert(current);
                        next.extend(self.expand(&record, is_put, is_exhaustive, rng));
                    }
                    _ => next.push(current),
                }
            }
            work = next;
        }

        let mut seen: HashSet<Key> = HashSet::with_capacity(work.len());
        let keys = work.into_iter().filter(|k| seen.insert(*k)).collect();
        (keys, depth_limited)
    }

    /// The replacement keys for one diversified key.
    fn expand<R: Rng>(
        &self,
        record: &DiversificationRecord,
        is_put: bool,
        is_exhaustive: bool,
        rng: &mut R,
    ) -> Vec<Key> {
        let key = &record.key;
        let width = self.config.div_width;
        let mut keys = match (record.div_type, is_put, is_exhaustive) {
            // Puts must land on every replica location so all writers agree.
            (DiversificationType::Frequency, true, _) => {
                (0..width).map(|o| derive_sub_key(key, o)).collect::<Vec<_>>()
            }
            // A single random replica balances read traffic.
            (DiversificationType::Frequency, false, _) => {
                vec![derive_sub_key(key, rng.gen_range(0..width))]
            }
            // The offsets drawn at creation, stable for the record's life.
            (DiversificationType::Size, true, _) => record
                .fixed_put_offsets
                .iter()
                .map(|o| derive_sub_key(key, *o))
                .collect(),
            (DiversificationType::Size, false, true) => {
                (0..width).map(|o| derive_sub_key(key, o)).collect()
            }
            // Random fragment-width sample, without repeats.
            (DiversificationType::Size, false, false) => {
                rand::seq::index::sample(rng, usize::from(width), usize::from(self.config.frag_width))
                    .iter()
                    .map(|o| derive_sub_key(key, o as u8))
                    .collect()
            }
            (DiversificationType::None, _, _) => vec![*key],
        };
        if is_put && is_exhaustive {
            keys.push(*key);
        }
        keys
    }

    /// Draw `frag_width` distinct offsets in `[0, div_width)`.
    fn draw_offsets<R: Rng>(&self, rng: &mut R) -> Vec<u8> {
        rand::seq::index::sample(
            rng,
            usize::from(self.config.div_width),
            usize::from(self.config.frag_width),
        )
        .iter()
        .map(|o| o as u8)
        .collect()
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> DiversificationSnapshot {
        DiversificationSnapshot {
            local: self.local.values().cloned().collect(),
            remote: self.remote.values().cloned().collect(),
        }
    }

    /// Restore from a persisted snapshot, dropping lapsed or invalid
    /// records.
    pub fn restore(&mut self, snapshot: DiversificationSnapshot, now: Timestamp) {
        self.local.clear();
        self.remote.clear();
        for (records, map) in [
            (snapshot.local, &mut self.local),
            (snapshot.remote, &mut self.remote),
        ] {
            for record in records {
                if !record.div_type.is_diversified() {
                    warn!(key = %record.key.short_hex(), "skipping persisted record without a type");
                    continue;
                }
                if record.is_expired(now) {
                    continue;
                }
                map.insert(record.key, record);
            }
        }
        self.dirty = false;
    }

    /// Whether state changed since the last snapshot, clearing the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Live record count across both origins.
    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    /// Whether no records exist.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}
