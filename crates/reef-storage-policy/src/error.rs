//! Error types for the storage-policy subsystem.
//!
//! Trust failures are deliberately *not* errors: a rejected key-block
//! directive surfaces as `None` at the API so remote callers cannot tell
//! why a directive was dropped. `PolicyError` covers configuration and
//! persistence failures only, and even those never cross the inbound API
//! (the service logs them and keeps in-memory state authoritative).

use thiserror::Error;

/// Errors internal to the storage-policy subsystem.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Durable store read/write failure.
    #[error("persistence failure for store `{store}`: {message}")]
    Persistence { store: String, message: String },

    /// Snapshot (de)serialization failure.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
