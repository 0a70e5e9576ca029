//! At-rest encryption for stored OAuth tokens.
//!
//! AES-256-GCM with a random 12-byte nonce prepended to the ciphertext; the
//! result is base64-encoded for TEXT columns.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::LinkError;

/// Nonce size for AES-256-GCM (12 bytes).
const NONCE_SIZE: usize = 12;
/// GCM tag size (16 bytes).
const TAG_SIZE: usize = 16;

/// Token cipher keyed from a passphrase.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Derive a 32-byte key from `passphrase` with SHA-256.
    pub fn new(passphrase: &str) -> Result<Self, LinkError> {
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| LinkError::Encryption(format!("Key init failed: {e}")))?;
        Ok(Self { cipher })
    }

    /// Returns base64 `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, LinkError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| LinkError::Encryption(format!("Encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, LinkError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| LinkError::Encryption(format!("Base64 decode failed: {e}")))?;

        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(LinkError::Encryption("Ciphertext too short".into()));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| LinkError::Encryption(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| LinkError::Encryption(format!("UTF-8 decode failed: {e}")))
    }
}
