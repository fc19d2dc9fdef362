//! Adapters Layer
//!
//! Concrete implementations of the outbound ports: file-backed durable
//! storage, the embedded network root-of-trust verifier, and the system
//! clock.

pub mod clock;
pub mod persistence;
pub mod verifier;

pub use clock::SystemClock;
pub use persistence::{FileBlobStore, MemoryBlobStore};
pub use verifier::{EmbeddedRootVerifier, FixedKeyVerifier};
