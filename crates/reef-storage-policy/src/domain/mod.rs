//! Domain Layer
//!
//! Pure policy logic: per-key statistics, the diversification algorithm,
//! key-block trust decisions and the probabilistic sets backing them. No
//! I/O happens here; persistence, verification and time come in through
//! the outbound ports.

pub mod bloom;
pub mod config;
pub mod diversify;
pub mod entities;
pub mod keyblock;
pub mod tracker;

pub use bloom::BloomFilter;
pub use config::PolicyConfig;
pub use diversify::{DiversificationOrigin, DiversificationSnapshot, DiversificationStore};
pub use entities::{
    DiversificationRecord, DiversificationType, KeyBlockDirective, KeyBlockRecord,
    KEY_BLOCK_HEADER_LEN, KEY_BLOCK_MIN_LEN,
};
pub use keyblock::{admit, Admission, KeyBlockSnapshot, PersistedKeyBlock, SpamGuard};
pub use tracker::{Escalation, StorageKeyRecord, StorageKeyTracker};
