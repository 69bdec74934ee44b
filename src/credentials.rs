//! Resource credentials and their encryption at rest.
//!
//! Credentials are stored on resource records and source groups as opaque
//! blobs produced by [`CredentialVault::encrypt`]. The vault key is loaded
//! from `MIRROR_MASTER_KEY` or, failing that, from the system keychain.

use std::env;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Environment variable that overrides keychain key storage.
pub const MASTER_KEY_ENV: &str = "MIRROR_MASTER_KEY";

const KEYRING_SERVICE: &str = "mirror";
const KEYRING_ENTRY_NAME: &str = "credential-master-key-v1";
const MAGIC: &[u8; 4] = b"MRV1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Errors from credential encryption and key management.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Could not access keychain and no env fallback key was provided.
    #[error(
        "unable to access system keychain for credential encryption key; set MIRROR_MASTER_KEY or configure keychain access"
    )]
    KeychainUnavailable,
    /// Stored encrypted payload is malformed.
    #[error("stored credential payload is invalid")]
    InvalidPayload,
    /// Encryption failed.
    #[error("failed to encrypt credentials")]
    EncryptionFailed,
    /// Decryption failed (wrong key or tampered payload).
    #[error("failed to decrypt credentials")]
    DecryptionFailed,
    /// Serialization/deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Login/secret pair used for authenticated fetches.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name.
    pub login: String,
    secret: String,
}

impl Credentials {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(login: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret: secret.into(),
        }
    }

    /// Returns the secret (password or key passphrase).
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Returns true when both login and secret are blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.login.is_empty() && self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Symmetric encryption for credential blobs (XChaCha20-Poly1305).
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Creates a vault from arbitrary key material (hashed to 256 bits).
    #[must_use]
    pub fn from_key_material(key_material: &str) -> Self {
        Self {
            key: derive_key_bytes(key_material),
        }
    }

    /// Loads key material from the environment or keychain, generating and
    /// storing a new key on first use.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeychainUnavailable`] when no env key is set and
    /// the keychain cannot be read or written.
    pub fn load_default() -> Result<Self, VaultError> {
        Ok(Self::from_key_material(&load_or_create_key()?))
    }

    /// Encrypts raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::EncryptionFailed`] if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce_ref = XNonce::from_slice(&nonce);

        let ciphertext = cipher
            .encrypt(nonce_ref, plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        output.extend_from_slice(MAGIC);
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypts bytes produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidPayload`] for malformed input and
    /// [`VaultError::DecryptionFailed`] for a wrong key or tampering.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, VaultError> {
        if payload.len() < MAGIC.len() + NONCE_LEN || &payload[..MAGIC.len()] != MAGIC {
            return Err(VaultError::InvalidPayload);
        }

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce_start = MAGIC.len();
        let nonce_end = nonce_start + NONCE_LEN;
        let nonce = XNonce::from_slice(&payload[nonce_start..nonce_end]);

        cipher
            .decrypt(nonce, &payload[nonce_end..])
            .map_err(|_| VaultError::DecryptionFailed)
    }

    /// Seals a credential pair. Empty credentials seal to `None`.
    ///
    /// # Errors
    ///
    /// Propagates serialization and encryption failures.
    pub fn seal(&self, credentials: Option<&Credentials>) -> Result<Option<Vec<u8>>, VaultError> {
        match credentials {
            Some(creds) if !creds.is_empty() => {
                let plaintext = serde_json::to_vec(creds)?;
                Ok(Some(self.encrypt(&plaintext)?))
            }
            _ => Ok(None),
        }
    }

    /// Opens a sealed credential blob.
    ///
    /// # Errors
    ///
    /// Propagates decryption and deserialization failures.
    pub fn open(&self, sealed: Option<&[u8]>) -> Result<Option<Credentials>, VaultError> {
        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let plaintext = self.decrypt(sealed)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }
}

fn load_or_create_key() -> Result<String, VaultError> {
    if let Some(from_env) = env::var_os(MASTER_KEY_ENV) {
        let key = from_env.to_string_lossy().trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let entry = catch_unwind(|| keyring::Entry::new(KEYRING_SERVICE, KEYRING_ENTRY_NAME))
        .map_err(|_| VaultError::KeychainUnavailable)?
        .map_err(|_| VaultError::KeychainUnavailable)?;

    let existing = catch_unwind(AssertUnwindSafe(|| entry.get_password()))
        .map_err(|_| VaultError::KeychainUnavailable)?;
    match existing {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing),
        _ => {
            let generated = generate_key_material();
            catch_unwind(AssertUnwindSafe(|| entry.set_password(&generated)))
                .map_err(|_| VaultError::KeychainUnavailable)?
                .map_err(|_| VaultError::KeychainUnavailable)?;
            Ok(generated)
        }
    }
}

fn generate_key_material() -> String {
    let mut bytes = [0_u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// Lowercase hex encoding.
#[must_use]
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

fn derive_key_bytes(key_material: &str) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(key_material.as_bytes());
    let mut key = [0_u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open_credentials() {
        let vault = CredentialVault::from_key_material("test-key");
        let creds = Credentials::new("alice", "hunter2");

        let sealed = vault.seal(Some(&creds)).unwrap().unwrap();
        assert!(!sealed.windows(7).any(|w| w == b"hunter2"));

        let opened = vault.open(Some(&sealed)).unwrap().unwrap();
        assert_eq!(opened, creds);
    }

    #[test]
    fn test_empty_credentials_seal_to_none() {
        let vault = CredentialVault::from_key_material("test-key");
        assert!(vault.seal(Some(&Credentials::new("", ""))).unwrap().is_none());
        assert!(vault.seal(None).unwrap().is_none());
        assert!(vault.open(None).unwrap().is_none());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let sealed = CredentialVault::from_key_material("key-a")
            .encrypt(b"payload")
            .unwrap();
        let result = CredentialVault::from_key_material("key-b").decrypt(&sealed);
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn test_decrypt_invalid_payload_fails() {
        let vault = CredentialVault::from_key_material("key");
        let result = vault.decrypt(b"not-encrypted-data");
        assert!(matches!(result, Err(VaultError::InvalidPayload)));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let debug = format!("{:?}", Credentials::new("bob", "s3cr3t"));
        assert!(debug.contains("bob"));
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[1_u8, 255_u8, 16_u8]), "01ff10");
    }
}
