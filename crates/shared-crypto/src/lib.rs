//! # Shared Crypto
//!
//! Cryptographic primitives for the Reef DHT layers.
//!
//! - `derive`: SHA-1 based sub-key derivation. Keys are 160 bits, so
//!   derived sub-keys land in the same keyspace as the keys themselves and
//!   every node computes the identical derivation.
//! - `signing`: Ed25519 signatures with deterministic nonces, used to
//!   attest network-wide key-block directives.

pub mod derive;
pub mod errors;
pub mod signing;

pub use derive::{derive_sub_key, digest_key};
pub use errors::CryptoError;
pub use signing::{KeyPair, PublicKey, Signature};
