//! Key material for the clearing handshake
//!
//! This module provides:
//! - Ed25519 key pairs for the long-lived wallet and per-batch session keys
//! - Hex encoding of public keys and signatures as carried on the wire
//! - The `KeyProvider` capability that mints one session key per batch

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a hex encoded 32-byte seed
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| Error::Signature(format!("Invalid seed hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Signature("Seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Public key as lowercase hex, used as the wire identity
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Sign a message, returning the hex encoded signature
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a hex encoded signature against this key
    pub fn verify_hex(&self, message: &[u8], signature_hex: &str) -> Result<()> {
        verify_signature(message, signature_hex, &self.public_key_hex())
    }
}

/// Verify a hex signature with a hex public key
pub fn verify_signature(message: &[u8], signature_hex: &str, public_key_hex: &str) -> Result<()> {
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| Error::Signature(format!("Invalid public key hex: {}", e)))?
        .try_into()
        .map_err(|_| Error::Signature("Public key must be 32 bytes".to_string()))?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| Error::Signature(format!("Invalid signature hex: {}", e)))?
        .try_into()
        .map_err(|_| Error::Signature("Signature must be 64 bytes".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::Signature(format!("Invalid public key: {}", e)))?;

    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| Error::Signature(format!("Verification failed: {}", e)))
}

/// Source of ephemeral session keys, one per batch
pub trait KeyProvider: Send + Sync {
    /// Produce the session key for batch `sequence`
    fn session_key(&self, sequence: u64) -> KeyPair;
}

/// Fresh random key per batch
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomKeyProvider;

impl KeyProvider for RandomKeyProvider {
    fn session_key(&self, _sequence: u64) -> KeyPair {
        KeyPair::generate()
    }
}

/// Deterministic keys derived from a seed and the batch sequence
#[derive(Clone)]
pub struct SeededKeyProvider {
    seed: [u8; 32],
}

impl std::fmt::Debug for SeededKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeededKeyProvider").finish_non_exhaustive()
    }
}

impl SeededKeyProvider {
    /// Create provider from a 32-byte seed
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }
}

impl KeyProvider for SeededKeyProvider {
    fn session_key(&self, sequence: u64) -> KeyPair {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(sequence.to_be_bytes());
        KeyPair::from_seed(&hasher.finalize().into())
    }
}
