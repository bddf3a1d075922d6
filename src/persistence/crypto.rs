//! AES-256-GCM at-rest encryption for the blob store (§4.9).
//!
//! Every serialized blob (`wm_core`, `kws_<id>_core`, `kws_<id>_app_*`) is
//! wrapped in an `EncryptedData` envelope before it touches disk. The key
//! is derived once at startup from `RuntimeConfig::encryption_passphrase`
//! and held only in memory.
//!
//! # Wire format
//!
//! ```json
//! { "nonce": "<base64>", "ciphertext": "<base64>", "version": <u8> }
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::CoreError;

const NONCE_SIZE: usize = 12;

/// Current envelope version for blob-store payloads.
pub const BLOB_ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: String,
    pub ciphertext: String,
    pub version: u8,
}

pub fn encrypt(key: &[u8; 32], plaintext: &[u8], version: u8) -> Result<EncryptedData, CoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CoreError::internal(format!("encryption failed: {e}")))?;

    Ok(EncryptedData {
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
        version,
    })
}

pub fn decrypt(key: &[u8; 32], encrypted: &EncryptedData) -> Result<Vec<u8>, CoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");

    let nonce_bytes = BASE64
        .decode(&encrypted.nonce)
        .map_err(|e| CoreError::Decode(format!("invalid nonce encoding: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = BASE64
        .decode(&encrypted.ciphertext)
        .map_err(|e| CoreError::Decode(format!("invalid ciphertext encoding: {e}")))?;

    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|e| CoreError::internal(format!("decryption failed (wrong key or tampered blob): {e}")))
}

/// Derives a 256-bit key from an operator-supplied passphrase via HKDF-SHA256,
/// matching the KDF construction the crypto-helper's own ratchet uses for
/// session keys. Not a password hash: assumes the passphrase itself is
/// high-entropy (sourced from the OS keyring in production deployments).
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"kwmd-blobstore-v1"), passphrase.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(b"blobstore-aes-key", &mut key)
        .expect("32 is a valid HKDF-SHA256 output length");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [42u8; 32];
        let plaintext = b"workspace serialized state";

        let encrypted = encrypt(&key, plaintext, BLOB_ENVELOPE_VERSION).unwrap();
        assert_eq!(encrypted.version, BLOB_ENVELOPE_VERSION);

        let decrypted = decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let key = [1u8; 32];
        let wrong_key = [2u8; 32];
        let encrypted = encrypt(&key, b"secret", 1).unwrap();
        assert!(decrypt(&wrong_key, &encrypted).is_err());
    }

    #[test]
    fn serialization_roundtrip() {
        let key = [7u8; 32];
        let encrypted = encrypt(&key, b"test data", 1).unwrap();

        let json = serde_json::to_string(&encrypted).unwrap();
        let loaded: EncryptedData = serde_json::from_str(&json).unwrap();

        let decrypted = decrypt(&key, &loaded).unwrap();
        assert_eq!(decrypted, b"test data");
    }

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(derive_key("hunter2"), derive_key("hunter2"));
        assert_ne!(derive_key("hunter2"), derive_key("hunter3"));
    }
}
