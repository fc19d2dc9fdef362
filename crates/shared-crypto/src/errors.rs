//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from signature handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The byte string is not a valid curve point.
    #[error("invalid public key encoding")]
    InvalidPublicKey,

    /// The signature does not have the expected width.
    #[error("invalid signature length: {len}, expected 64")]
    InvalidSignatureLength { len: usize },

    /// The signature does not verify against the message and key.
    #[error("signature verification failed")]
    VerificationFailed,
}
