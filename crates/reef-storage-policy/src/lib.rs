//! # Reef Storage Policy
//!
//! Storage-policy and trust layer consulted by the Reef DHT engine on
//! every local store/fetch and on every network-originated request to
//! suppress or relocate a key.
//!
//! ## Architecture
//!
//! This crate follows Hexagonal Architecture (Ports & Adapters):
//!
//! - **Domain Layer** (`domain/`): pure policy logic, no I/O
//!   - `StorageKeyTracker`: per-key statistics and escalation triggers
//!   - `DiversificationStore`: deterministic key remapping with bounded
//!     chain resolution
//!   - key-block trust decisions and the immutable live-record snapshot
//!   - `BloomFilter`: probabilistic set behind read sampling and anti-spam
//!
//! - **Ports Layer** (`ports/`): trait definitions
//!   - `StoragePolicyApi`: driving port, the host engine's callback
//!     contract
//!   - `BlobStore`, `DirectiveVerifier`, `TimeSource`: driven ports
//!
//! - **Service Layer** (`service/`): `StoragePolicyService` orchestrates
//!   the domain stores behind per-store locks and a copy-on-write
//!   key-block snapshot
//!
//! - **Adapters Layer** (`adapters/`): stage-then-rename file persistence,
//!   the embedded network root-of-trust verifier, the system clock
//!
//! ## Invariants
//!
//! - Every operation is synchronous, CPU-bound and quick: this layer runs
//!   on the engine's request-handling threads and never performs network
//!   I/O or unbounded work.
//! - Malformed input and trust failures degrade to safe defaults; nothing
//!   here is fatal to the host process.
//! - Put resolution is deterministic network-wide; only gets sample
//!   randomly.
//!
//! ## Usage Example
//!
//! ```ignore
//! use reef_storage_policy::{
//!     EmbeddedRootVerifier, FileBlobStore, PolicyConfig, StoragePolicyApi,
//!     StoragePolicyService, SystemClock,
//! };
//!
//! let policy = StoragePolicyService::new(
//!     PolicyConfig::default(),
//!     FileBlobStore::new("/var/lib/reef/dht"),
//!     EmbeddedRootVerifier::new(),
//!     SystemClock,
//! )?;
//!
//! // On the engine's store path:
//! policy.key_created(key, true);
//! policy.value_added(&key, value.len() as u64);
//! let wire_keys = policy.get_existing_diversification(&key, true, false, 8);
//! ```

pub mod adapters;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;
pub mod test_utils;

// Re-exports for convenience
pub use adapters::{
    EmbeddedRootVerifier, FileBlobStore, FixedKeyVerifier, MemoryBlobStore, SystemClock,
};
pub use domain::{
    DiversificationRecord, DiversificationType, KeyBlockDirective, KeyBlockRecord, PolicyConfig,
};
pub use error::PolicyError;
pub use metrics::{Metrics, MetricsSnapshot};
pub use ports::{BlobMap, BlobStore, DirectiveVerifier, StoragePolicyApi, TimeSource};
pub use service::{
    StoragePolicyService, STORE_ADDRESSES, STORE_DIVERSIFICATIONS, STORE_GENERAL, STORE_KEY_BLOCKS,
    STORE_VERSION,
};
