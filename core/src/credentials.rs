//! Minimal credential cipher for `POST /internal/save-credential`.
//! Credential encryption-at-rest as a general-purpose *feature* is out of
//! scope (owned by the CRUD surface), but the internal save-credential
//! endpoint is in scope and needs to hand Store something encrypted.
//! Grounded in this workspace's AES-256-GCM provider: explicit nonce
//! generation, `Aead::encrypt`/`decrypt`, and ciphertext/tag kept separate
//! rather than concatenated.

use crate::errors::{CredentialError, CredentialResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

pub struct EncryptedCredential {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Pads or truncates an arbitrary-length secret to exactly 32 bytes by
/// appending ASCII spaces (or truncating). This engine always space-pads
/// — never zero-pads — and the two must never be mixed for the same
/// stored ciphertext.
pub fn derive_key(raw: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [b' '; KEY_SIZE];
    let n = raw.len().min(KEY_SIZE);
    key[..n].copy_from_slice(&raw[..n]);
    key
}

pub struct CredentialCipher {
    key: [u8; KEY_SIZE],
}

impl CredentialCipher {
    pub fn new(raw_key: &[u8]) -> Self {
        Self {
            key: derive_key(raw_key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> CredentialResult<EncryptedCredential> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        // aes-gcm appends the 16-byte tag to the ciphertext; split it out so
        // Store persists ciphertext and tag as distinct columns.
        let tag = ciphertext.split_off(ciphertext.len().saturating_sub(16));

        Ok(EncryptedCredential {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
            tag,
        })
    }

    pub fn decrypt(&self, encrypted: &EncryptedCredential) -> CredentialResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CredentialError::Decryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&encrypted.nonce);

        let mut combined = encrypted.ciphertext.clone();
        combined.extend_from_slice(&encrypted.tag);

        let plaintext = cipher
            .decrypt(nonce, combined.as_slice())
            .map_err(|e| CredentialError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CredentialError::Decryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_credential() {
        let cipher = CredentialCipher::new(b"a test encryption key material!");
        let encrypted = cipher.encrypt("ftp-password-123").unwrap();
        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, "ftp-password-123");
    }

    #[test]
    fn derive_key_space_pads_short_keys() {
        let key = derive_key(b"short");
        assert_eq!(&key[..5], b"short");
        assert_eq!(key[5], b' ');
        assert_eq!(key.len(), KEY_SIZE);
    }

    #[test]
    fn derive_key_truncates_long_keys() {
        let key = derive_key(&[7u8; 64]);
        assert_eq!(key.len(), KEY_SIZE);
    }
}
