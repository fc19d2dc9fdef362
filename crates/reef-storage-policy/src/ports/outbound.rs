//! Outbound ports: dependencies this subsystem needs.

use crate::error::PolicyError;
use shared_types::Timestamp;
use std::collections::BTreeMap;

/// A map-shaped durable blob, keyed by opaque bytes.
pub type BlobMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Durable storage for the named logical stores.
///
/// Implementations must be crash-safe: a reader sees either the previous
/// complete version of a store or the new complete version, never a
/// partial write.
pub trait BlobStore: Send + Sync {
    /// Load a store's map.
    ///
    /// Absent or unparseable state degrades to an empty map; this call
    /// never fails.
    fn load(&self, store: &str) -> BlobMap;

    /// Durably replace a store's map.
    ///
    /// An empty map removes the store's canonical file instead of writing
    /// an empty blob.
    fn save(&self, store: &str, map: &BlobMap) -> Result<(), PolicyError>;
}

/// Verifies a key-block directive signature.
///
/// Failure is a normal, expected result, never an error path.
pub trait DirectiveVerifier: Send + Sync {
    /// Whether `certificate_bytes` is a valid signature over
    /// `request_bytes` under the trusted key.
    fn verify(&self, request_bytes: &[u8], certificate_bytes: &[u8]) -> bool;
}

/// Wall-clock seconds.
pub trait TimeSource: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;
}

impl<B: BlobStore + ?Sized> BlobStore for std::sync::Arc<B> {
    fn load(&self, store: &str) -> BlobMap {
        (**self).load(store)
    }

    fn save(&self, store: &str, map: &BlobMap) -> Result<(), PolicyError> {
        (**self).save(store, map)
    }
}

impl<V: DirectiveVerifier + ?Sized> DirectiveVerifier for std::sync::Arc<V> {
    fn verify(&self, request_bytes: &[u8], certificate_bytes: &[u8]) -> bool {
        (**self).verify(request_bytes, certificate_bytes)
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}
