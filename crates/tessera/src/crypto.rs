//! Signing and session-encryption collaborators.
//!
//! The mesh only depends on the [`SigningAlgorithm`] and [`SessionChannel`]
//! contracts. [`Ed25519Signing`] is the bundled signing implementation.

use crate::error::MeshError;
use crate::types::EntityId;
use dashmap::DashMap;
use std::fmt;

/// Key material for one signer.
#[derive(Clone)]
pub struct KeyPair {
    pub public: Vec<u8>,
    pub secret: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub trait SigningAlgorithm: Send + Sync {
    fn generate_key_pair(&self) -> KeyPair;

    fn sign(&self, bytes: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, MeshError>;

    /// Returns `false` for malformed keys or signatures as well as mismatches.
    fn verify(&self, bytes: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Ed25519 signatures via `ed25519-dalek`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Signing;

impl Ed25519Signing {
    fn signing_key(key_pair: &KeyPair) -> Result<ed25519_dalek::SigningKey, MeshError> {
        let secret: [u8; 32] =
            key_pair
                .secret
                .as_slice()
                .try_into()
                .map_err(|_| MeshError::InvalidConfig {
                    reason: format!(
                        "ed25519 secret key must be 32 bytes, got {}",
                        key_pair.secret.len()
                    ),
                })?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&secret))
    }
}

impl SigningAlgorithm for Ed25519Signing {
    fn generate_key_pair(&self) -> KeyPair {
        let secret: [u8; 32] = rand::random();
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
        KeyPair {
            public: signing_key.verifying_key().to_bytes().to_vec(),
            secret: secret.to_vec(),
        }
    }

    fn sign(&self, bytes: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, MeshError> {
        use ed25519_dalek::Signer;

        let signing_key = Self::signing_key(key_pair)?;
        Ok(signing_key.sign(bytes).to_bytes().to_vec())
    }

    fn verify(&self, bytes: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let key_bytes: [u8; 32] = match public_key.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        match Signature::from_slice(signature) {
            Ok(sig) => verifying_key.verify(bytes, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// Public signing keys of known entities and servers.
#[derive(Default)]
pub struct KeyStore {
    keys: DashMap<EntityId, Vec<u8>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: EntityId, public_key: Vec<u8>) {
        self.keys.insert(id, public_key);
    }

    pub fn remove(&self, id: &EntityId) {
        self.keys.remove(id);
    }

    pub fn get(&self, id: &EntityId) -> Option<Vec<u8>> {
        self.keys.get(id).map(|k| k.value().clone())
    }

    /// Key of `id`, falling back to the key of the server hosting it.
    pub fn resolve(&self, id: &EntityId) -> Option<Vec<u8>> {
        self.get(id).or_else(|| self.get(&id.full_server_id()))
    }
}

/// Symmetric per-peer encryption for command payloads.
///
/// `peer` is the server id on the other end of the channel. Both ends must
/// ratchet in lockstep.
pub trait SessionChannel: Send + Sync {
    fn encrypt(&self, peer: i64, plaintext: &[u8]) -> Result<Vec<u8>, MeshError>;

    fn decrypt(&self, peer: i64, ciphertext: &[u8]) -> Result<Vec<u8>, MeshError>;

    /// Advance the session key shared with `peer`.
    fn ratchet(&self, peer: i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_sign_and_verify() {
        let algo = Ed25519Signing;
        let keys = algo.generate_key_pair();
        assert_eq!(keys.public.len(), 32);

        let signature = algo.sign(b"payload", &keys).unwrap();
        assert!(algo.verify(b"payload", &signature, &keys.public));
        assert!(!algo.verify(b"tampered", &signature, &keys.public));

        let other = algo.generate_key_pair();
        assert!(!algo.verify(b"payload", &signature, &other.public));
    }

    #[test]
    fn malformed_inputs_do_not_verify() {
        let algo = Ed25519Signing;
        let keys = algo.generate_key_pair();
        let signature = algo.sign(b"x", &keys).unwrap();
        assert!(!algo.verify(b"x", &signature[..10], &keys.public));
        assert!(!algo.verify(b"x", &signature, &keys.public[..5]));

        let broken = KeyPair {
            public: keys.public.clone(),
            secret: vec![1, 2, 3],
        };
        assert!(algo.sign(b"x", &broken).is_err());
    }

    #[test]
    fn key_store_falls_back_to_server_key() {
        let store = KeyStore::new();
        let server = EntityId::server(0x10);
        store.insert(server, vec![7; 32]);
        let hosted = EntityId::from_parts(0x10, 99);
        assert_eq!(store.resolve(&hosted), Some(vec![7; 32]));
        assert_eq!(store.get(&hosted), None);
        assert_eq!(store.resolve(&EntityId::from_parts(0x11, 1)), None);
    }

    #[test]
    fn key_pair_debug_redacts_secret() {
        let keys = Ed25519Signing.generate_key_pair();
        let printed = format!("{keys:?}");
        assert!(printed.contains("redacted"));
    }
}
