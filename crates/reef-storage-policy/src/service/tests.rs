//! Service-level tests driving the full policy layer through the inbound
//! API, with a controlled clock and in-memory persistence.

use super::*;
use crate::adapters::persistence::MemoryBlobStore;
use crate::adapters::verifier::FixedKeyVerifier;
use crate::test_utils::{signed_block_request, test_contact, test_key, ManualClock};
use shared_crypto::KeyPair;

const START_SECS: u64 = 1_700_000_000;

type TestService =
    StoragePolicyService<Arc<MemoryBlobStore>, FixedKeyVerifier, Arc<ManualClock>>;

struct Harness {
    service: TestService,
    store: Arc<MemoryBlobStore>,
    clock: Arc<ManualClock>,
    signer: KeyPair,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(PolicyConfig::default())
    }

    fn with_config(config: PolicyConfig) -> Self {
        let store = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(START_SECS));
        let signer = KeyPair::generate();
        let service = StoragePolicyService::new(
            config,
            Arc::clone(&store),
            FixedKeyVerifier::new(signer.public_key()),
            Arc::clone(&clock),
        )
        .expect("valid config");
        Self {
            service,
            store,
            clock,
            signer,
        }
    }

    /// Rebuild the service over the same persisted stores, as a process
    /// restart would.
    fn restart(&mut self) {
        let config = self.service.config().clone();
        self.service = StoragePolicyService::new(
            config,
            Arc::clone(&self.store),
            FixedKeyVerifier::new(self.signer.public_key()),
            Arc::clone(&self.clock),
        )
        .expect("valid config");
    }

    fn block_request(&self, is_add: bool, created_secs: u64, key: Key) -> (Vec<u8>, Vec<u8>) {
        signed_block_request(&self.signer, is_add, Timestamp::new(created_secs), key)
    }
}

fn scenario_key() -> Key {
    Key::from_slice(b"ABCDEFGHIJKLMNOPQRST").unwrap()
}

#[test]
fn test_end_to_end_entry_threshold_scenario() {
    let harness = Harness::new();
    let key = scenario_key();

    harness.service.key_created(key, true);
    assert!(!harness.service.is_diversified(&key));

    // 2049 one-byte entries push the key past the 2048-entry limit.
    for _ in 0..2049 {
        harness.service.value_added(&key, 1);
    }
    assert!(harness.service.is_diversified(&key));

    let first = harness
        .service
        .get_existing_diversification(&key, true, true, 8);
    assert_eq!(first.len(), 3, "two fixed put offsets plus the original");
    assert_eq!(*first.last().unwrap(), key);

    for _ in 0..5 {
        let again = harness
            .service
            .get_existing_diversification(&key, true, true, 8);
        assert_eq!(again, first, "put resolution is stable across calls");
    }
}

#[test]
fn test_resolution_without_record_returns_key() {
    let harness = Harness::new();
    let key = test_key(1);
    assert_eq!(
        harness.service.get_existing_diversification(&key, true, true, 8),
        vec![key]
    );
    assert_eq!(
        harness
            .service
            .get_existing_diversification(&key, false, false, 8),
        vec![key]
    );
}

#[test]
fn test_read_rate_drives_frequency_diversification() {
    let harness = Harness::new();
    let key = test_key(2);
    harness.service.key_created(key, true);
    harness.service.value_added(&key, 64);

    for i in 0..600u16 {
        let mut fingerprint = [0u8; 20];
        fingerprint[0] = (i >> 8) as u8;
        fingerprint[1] = i as u8;
        fingerprint[2] = 0xEE;
        harness
            .service
            .key_read(&key, &shared_types::ContactId::new(fingerprint));
    }
    assert!(!harness.service.is_diversified(&key));

    // Window closes on the first read past it; 60 distinct reads/min.
    harness.clock.advance(600);
    harness.service.key_read(&key, &test_contact(0xEF));
    assert!(harness.service.is_diversified(&key));

    let keys = harness
        .service
        .get_existing_diversification(&key, false, false, 8);
    assert_eq!(keys.len(), 1, "frequency gets sample one sub-key");
    assert_ne!(keys[0], key);
    assert_eq!(harness.service.metrics().frequency_diversifications, 1);
}

#[test]
fn test_create_new_diversification_resolves_and_persists() {
    let mut harness = Harness::new();
    let key = test_key(3);
    let cause = test_contact(9);

    let keys = harness.service.create_new_diversification(
        Some(&cause),
        &key,
        DiversificationType::Frequency,
        true,
        true,
        8,
    );
    assert_eq!(keys.len(), 11);

    harness.restart();
    assert!(harness.service.is_diversified(&key));
}

#[test]
fn test_diversification_expires_and_snapshot_shrinks() {
    let harness = Harness::new();
    let key = test_key(4);
    harness.service.key_created(key, true);
    for _ in 0..2049 {
        harness.service.value_added(&key, 1);
    }
    assert!(harness.service.is_diversified(&key));
    assert!(!harness.store.load(STORE_DIVERSIFICATIONS).is_empty());

    // Past the maximum lifetime (minimum window plus full jitter).
    let config = harness.service.config();
    harness
        .clock
        .advance(config.min_lifetime_secs + config.lifetime_jitter_secs + 1);

    assert!(!harness.service.is_diversified(&key));
    assert!(
        harness.store.load(STORE_DIVERSIFICATIONS).is_empty(),
        "reverted record is absent from the next persisted snapshot"
    );
    assert_eq!(
        harness.service.get_existing_diversification(&key, true, true, 8),
        vec![key]
    );
}

#[test]
fn test_key_deletion_drops_diversification() {
    let harness = Harness::new();
    let key = test_key(5);
    harness.service.create_new_diversification(
        None,
        &key,
        DiversificationType::Size,
        true,
        false,
        8,
    );
    assert!(harness.service.is_diversified(&key));

    harness.service.key_deleted(&key);
    assert!(!harness.service.is_diversified(&key));
    assert!(harness.store.load(STORE_DIVERSIFICATIONS).is_empty());
}

#[test]
fn test_suspension_blocks_escalation_and_put_fanout() {
    let now = Timestamp::new(START_SECS);
    let config = PolicyConfig::default().with_suspend_until(Some(now.add_secs(3600)));
    let harness = Harness::with_config(config);
    let key = test_key(6);

    harness.service.key_created(key, true);
    for _ in 0..3000 {
        harness.service.value_added(&key, 1);
    }
    assert!(
        !harness.service.is_diversified(&key),
        "no escalation while suspended"
    );
    assert_eq!(
        harness.service.get_existing_diversification(&key, true, true, 8),
        vec![key]
    );
}

#[test]
fn test_key_block_install_and_details() {
    let harness = Harness::new();
    let key = test_key(10);
    let (request, certificate) = harness.block_request(true, START_SECS - 50, key);

    let installed = harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate)
        .expect("valid direct block installs");
    assert!(installed.is_direct);
    assert!(installed.is_add());

    let details = harness.service.key_block_details(&key).unwrap();
    assert_eq!(details.request_bytes, request);
    assert_eq!(harness.service.direct_key_blocks().len(), 1);
    assert_eq!(harness.service.metrics().key_blocks_accepted, 1);
}

#[test]
fn test_trust_precedence_direct_outranks_indirect() {
    let harness = Harness::new();
    let key = test_key(11);
    let (request, certificate) = harness.block_request(true, START_SECS - 100, key);
    harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate)
        .expect("direct block installs");

    // A fresher indirect block is still rejected; the prior record stands.
    let (newer_request, newer_certificate) = harness.block_request(true, START_SECS - 10, key);
    let result = harness
        .service
        .key_block_request(None, &newer_request, &newer_certificate);
    let standing = result.expect("rejection falls back to the standing block");
    assert_eq!(standing.request_bytes, request);

    // An indirect unblock is rejected outright.
    let (unblock_request, unblock_certificate) = harness.block_request(false, START_SECS - 5, key);
    assert!(harness
        .service
        .key_block_request(None, &unblock_request, &unblock_certificate)
        .is_none());

    let details = harness.service.key_block_details(&key).unwrap();
    assert_eq!(details.request_bytes, request, "store unchanged");
}

#[test]
fn test_stale_directive_replay_rejected() {
    let harness = Harness::new();
    let key = test_key(12);
    let (request, certificate) = harness.block_request(true, START_SECS - 10, key);
    harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate);

    // A direct unblock carrying an older creation time is a replay.
    let (stale_request, stale_certificate) = harness.block_request(false, START_SECS - 500, key);
    assert!(harness
        .service
        .key_block_request(Some(&test_contact(1)), &stale_request, &stale_certificate)
        .is_none());
    assert!(harness.service.key_block_details(&key).is_some());
}

#[test]
fn test_direct_unblock_clears_block() {
    let harness = Harness::new();
    let key = test_key(13);
    let (request, certificate) = harness.block_request(true, START_SECS - 100, key);
    harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate);

    let (unblock_request, unblock_certificate) = harness.block_request(false, START_SECS - 10, key);
    assert!(
        harness
            .service
            .key_block_request(Some(&test_contact(1)), &unblock_request, &unblock_certificate)
            .is_none(),
        "an unblock never yields a block record"
    );

    assert!(harness.service.key_block_details(&key).is_none());
    // The unblock record is retained so older blocks cannot replay in.
    let direct = harness.service.direct_key_blocks();
    assert_eq!(direct.len(), 1);
    assert!(!direct[0].is_add());

    let (replay_request, replay_certificate) = harness.block_request(true, START_SECS - 100, key);
    assert!(harness
        .service
        .key_block_request(Some(&test_contact(1)), &replay_request, &replay_certificate)
        .is_none());
    assert!(harness.service.key_block_details(&key).is_none());
}

#[test]
fn test_signature_tamper_rejected() {
    let harness = Harness::new();
    let key = test_key(14);
    let (request, mut certificate) = harness.block_request(true, START_SECS - 10, key);
    certificate[17] ^= 0x40;

    assert!(harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate)
        .is_none());
    assert!(harness.service.key_block_details(&key).is_none());
    assert!(harness.store.load(STORE_KEY_BLOCKS).is_empty());
    assert_eq!(harness.service.metrics().key_blocks_rejected, 1);
}

#[test]
fn test_malformed_request_rejected() {
    let harness = Harness::new();
    assert!(harness
        .service
        .key_block_request(Some(&test_contact(1)), &[1, 0, 0, 0, 0, 0, 0, 0], &[0u8; 64])
        .is_none());
    assert!(harness
        .service
        .key_block_request(None, &[], &[])
        .is_none());
}

#[test]
fn test_spam_filter_short_circuits_repeat_offender() {
    let harness = Harness::new();
    let offender = test_contact(66);

    // First failure runs the signature check and flags the identity.
    let (request, mut certificate) = harness.block_request(true, START_SECS - 10, test_key(15));
    certificate[0] ^= 1;
    assert!(harness
        .service
        .key_block_request(Some(&offender), &request, &certificate)
        .is_none());

    // Even a correctly signed directive from the same identity is now
    // dropped without re-running verification.
    let (valid_request, valid_certificate) =
        harness.block_request(true, START_SECS - 5, test_key(16));
    assert!(harness
        .service
        .key_block_request(Some(&offender), &valid_request, &valid_certificate)
        .is_none());
    assert_eq!(harness.service.metrics().spam_short_circuits, 1);

    // An unrelated contact is unaffected.
    let (other_request, other_certificate) =
        harness.block_request(true, START_SECS - 5, test_key(17));
    assert!(harness
        .service
        .key_block_request(Some(&test_contact(67)), &other_request, &other_certificate)
        .is_some());
}

#[test]
fn test_purge_direct_keeps_indirect_records() {
    let harness = Harness::new();
    let (direct_request, direct_certificate) =
        harness.block_request(true, START_SECS - 10, test_key(20));
    harness
        .service
        .key_block_request(Some(&test_contact(1)), &direct_request, &direct_certificate);

    let (indirect_request, indirect_certificate) =
        harness.block_request(true, START_SECS - 10, test_key(21));
    harness
        .service
        .key_block_request(None, &indirect_request, &indirect_certificate);

    harness.service.purge_direct_key_blocks();

    assert!(harness.service.direct_key_blocks().is_empty());
    assert!(harness.service.key_block_details(&test_key(20)).is_none());
    assert!(
        harness.service.key_block_details(&test_key(21)).is_some(),
        "indirect knowledge survives an identity change"
    );
}

#[test]
fn test_indirect_block_lapses_after_timeout() {
    let harness = Harness::new();
    let key = test_key(22);
    let (request, certificate) = harness.block_request(true, START_SECS - 10, key);
    harness.service.key_block_request(None, &request, &certificate);
    assert!(harness.service.key_block_details(&key).is_some());

    harness
        .clock
        .advance(harness.service.config().indirect_block_timeout_secs);
    assert!(harness.service.key_block_details(&key).is_none());
}

#[test]
fn test_key_blocks_survive_restart() {
    let mut harness = Harness::new();
    let key = test_key(23);
    let (request, certificate) = harness.block_request(true, START_SECS - 10, key);
    harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate);

    harness.restart();

    let details = harness.service.key_block_details(&key).unwrap();
    assert_eq!(details.request_bytes, request);
    assert!(details.is_direct);
}

#[test]
fn test_version_counter_is_monotonic_across_restart() {
    let mut harness = Harness::new();
    let mut last = None;
    for _ in 0..100 {
        let version = harness.service.next_version();
        if let Some(last) = last {
            assert!(version > last);
        }
        last = Some(version);
    }

    harness.restart();
    assert!(
        harness.service.next_version() > last.unwrap(),
        "versions never repeat across restarts"
    );
}

#[test]
fn test_recent_addresses_capped_and_persisted() {
    let mut harness = Harness::new();
    for i in 0..20 {
        harness.clock.advance(1);
        harness.service.record_recent_address(&format!("10.0.0.{i}:6881"));
    }

    let addresses = harness.service.recent_addresses();
    assert_eq!(addresses.len(), 16, "history is capped oldest-out");
    assert!(!addresses.contains_key("10.0.0.0:6881"));
    assert!(addresses.contains_key("10.0.0.19:6881"));

    harness.restart();
    assert_eq!(harness.service.recent_addresses().len(), 16);
}

#[test]
fn test_generic_blob_store_roundtrip() {
    let mut harness = Harness::new();
    harness
        .service
        .store_blob("dht.flags", vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(
        harness.service.load_blob("dht.flags"),
        Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
    );
    assert_eq!(harness.service.load_blob("unset"), None);

    harness.restart();
    assert_eq!(
        harness.service.load_blob("dht.flags"),
        Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
    );
}

#[test]
fn test_flush_writes_every_store() {
    let harness = Harness::new();
    let key = test_key(30);
    harness.service.create_new_diversification(
        None,
        &key,
        DiversificationType::Size,
        true,
        false,
        8,
    );
    let (request, certificate) = harness.block_request(true, START_SECS - 10, key);
    harness
        .service
        .key_block_request(Some(&test_contact(1)), &request, &certificate);
    harness.service.record_recent_address("10.1.1.1:6881");
    harness.service.store_blob("flag", vec![1]);

    harness.service.flush();

    for store in [
        STORE_DIVERSIFICATIONS,
        STORE_KEY_BLOCKS,
        STORE_ADDRESSES,
        STORE_VERSION,
        STORE_GENERAL,
    ] {
        assert!(
            !harness.store.load(store).is_empty(),
            "store `{store}` should be durable after flush"
        );
    }
}
