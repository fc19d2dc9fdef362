//! Key-block directive verification.
//!
//! The network ships one fixed Ed25519 root key for key blocking; it is
//! compiled in and not configurable at runtime. Test networks and the
//! test suite use [`FixedKeyVerifier`] with their own key instead.

use crate::ports::outbound::DirectiveVerifier;
use shared_crypto::{PublicKey, Signature};
use tracing::warn;

/// Hex encoding of the network-wide key-block root public key.
const ROOT_PUBLIC_KEY_HEX: &str =
    "72d9b48042f8d58a9b746d0e7b6bde79059373e3d4b779f7537a6e85f3d1674d";

/// Verifier bound to the embedded network root of trust.
pub struct EmbeddedRootVerifier {
    root: Option<PublicKey>,
}

impl EmbeddedRootVerifier {
    /// Create the verifier, decoding the embedded key.
    pub fn new() -> Self {
        let root = decode_root();
        if root.is_none() {
            warn!("embedded key-block root key failed to decode; all directives will be rejected");
        }
        Self { root }
    }
}

impl Default for EmbeddedRootVerifier {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_root() -> Option<PublicKey> {
    let bytes = hex::decode(ROOT_PUBLIC_KEY_HEX).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    PublicKey::from_bytes(&arr).ok()
}

impl DirectiveVerifier for EmbeddedRootVerifier {
    fn verify(&self, request_bytes: &[u8], certificate_bytes: &[u8]) -> bool {
        let root = match &self.root {
            Some(root) => root,
            None => return false,
        };
        let signature = match Signature::from_slice(certificate_bytes) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        root.verify(request_bytes, &signature).is_ok()
    }
}

/// Verifier bound to an explicitly supplied key.
pub struct FixedKeyVerifier {
    public_key: PublicKey,
}

impl FixedKeyVerifier {
    /// Create a verifier trusting `public_key`.
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }
}

impl DirectiveVerifier for FixedKeyVerifier {
    fn verify(&self, request_bytes: &[u8], certificate_bytes: &[u8]) -> bool {
        let signature = match Signature::from_slice(certificate_bytes) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        self.public_key.verify(request_bytes, &signature).is_ok()
    }
}
