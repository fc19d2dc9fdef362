//! Ports Layer
//!
//! Trait boundaries of the subsystem:
//! - Driving port (inbound): the callback contract the host DHT engine
//!   invokes on its request-handling path.
//! - Driven ports (outbound): durable storage, directive verification and
//!   wall-clock time.

pub mod inbound;
pub mod outbound;

pub use inbound::StoragePolicyApi;
pub use outbound::{BlobMap, BlobStore, DirectiveVerifier, TimeSource};
