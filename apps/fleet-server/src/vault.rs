use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use std::fmt;

const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key must be 64 hex characters (32 bytes)")]
    InvalidKey,
    #[error("failed to seal credential")]
    Encrypt,
    #[error("sealed credential is malformed: {0}")]
    Malformed(String),
    #[error("sealed credential failed authentication (tampered or sealed under another key)")]
    Decrypt,
}

/// Seals SSH passwords at rest with AES-256-GCM.
///
/// Sealed values are hex strings of `nonce || ciphertext || tag`, so they can be
/// stored verbatim in text columns and key-value entries.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CredentialVault {
    pub fn from_hex_key(key_hex: &str) -> Result<Self, VaultError> {
        let key = hex::decode(key_hex.trim()).map_err(|_| VaultError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Seals under a fresh random nonce, so equal plaintexts give different ciphertexts.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String, VaultError> {
        let raw = hex::decode(sealed.trim())
            .map_err(|err| VaultError::Malformed(format!("not hex: {err}")))?;
        if raw.len() <= NONCE_SIZE {
            return Err(VaultError::Malformed(
                "too short to contain a nonce and tag".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext)
            .map_err(|err| VaultError::Malformed(format!("plaintext is not UTF-8: {err}")))
    }
}
