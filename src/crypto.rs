//! Private-key encryption at rest.
//!
//! A password entered once per process derives an AES-256-GCM key via SHA-256.
//! Each private key is encrypted individually with a random nonce and the
//! base64(nonce + ciphertext) string doubles as the account's identity in both
//! store documents. A wrong password can only ever produce [`Error::InvalidKey`]
//! — it can never silently corrupt stored data.

use crate::error::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::sync::Mutex;

/// Fallback passphrase used when the operator submits an empty password.
const DEFAULT_PASSPHRASE: &str = "airclaim default passphrase";

const NONCE_LEN: usize = 12;

/// Symmetric cipher derived from one password.
#[derive(Clone)]
pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    pub fn derive(password: &str) -> Self {
        let password = if password.is_empty() {
            DEFAULT_PASSPHRASE
        } else {
            password
        };
        let key = Sha256::digest(password.as_bytes());
        let inner = Aes256Gcm::new_from_slice(&key).expect("sha256 digest is a valid aes-256 key");
        Self { inner }
    }

    /// Encrypt a private key into its store identity string.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .inner
            .encrypt(nonce, plaintext.as_bytes())
            .expect("aes-gcm encryption is infallible for in-memory buffers");

        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(&nonce_bytes);
        stored.extend_from_slice(&ciphertext);
        BASE64.encode(stored)
    }

    /// Decrypt a store identity string back into the private key.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let raw = BASE64.decode(stored).map_err(|_| Error::InvalidKey)?;
        if raw.len() < NONCE_LEN {
            return Err(Error::InvalidKey);
        }
        let nonce = Nonce::from_slice(&raw[..NONCE_LEN]);
        let plaintext = self
            .inner
            .decrypt(nonce, &raw[NONCE_LEN..])
            .map_err(|_| Error::InvalidKey)?;
        String::from_utf8(plaintext).map_err(|_| Error::InvalidKey)
    }
}

/// Where the password came from. An interactively typed password may be
/// re-prompted on mismatch; a preset one must fail loudly instead.
enum PasswordSource {
    Interactive,
    Preset(String),
}

/// Process-wide password holder. Resolves the cipher lazily: once for
/// encryption (`create`), once for decryption validated against existing
/// ciphertext (`load_all`), then cached for the rest of the process.
pub struct Keychain {
    source: PasswordSource,
    cipher: Mutex<Option<Cipher>>,
}

impl Keychain {
    pub fn interactive() -> Self {
        Self {
            source: PasswordSource::Interactive,
            cipher: Mutex::new(None),
        }
    }

    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            source: PasswordSource::Preset(password.into()),
            cipher: Mutex::new(None),
        }
    }

    /// Cipher for creating fresh records. No existing ciphertext to validate
    /// against, so whatever password is supplied wins.
    pub fn encryption_cipher(&self) -> Cipher {
        let mut slot = self.cipher.lock().expect("keychain lock poisoned");
        if let Some(cipher) = slot.as_ref() {
            return cipher.clone();
        }
        let cipher = match &self.source {
            PasswordSource::Preset(password) => Cipher::derive(password),
            PasswordSource::Interactive => {
                let password = prompt("Enter password to encrypt private keys (empty for default): ");
                if password.is_empty() {
                    tracing::info!("using the default database passphrase");
                }
                Cipher::derive(&password)
            }
        };
        *slot = Some(cipher.clone());
        cipher
    }

    /// Cipher for reading existing records, validated against a sample
    /// ciphertext from the store. The default passphrase is tried silently
    /// first so passwordless databases never prompt.
    pub fn decryption_cipher(&self, sample: &str) -> Result<Cipher> {
        let mut slot = self.cipher.lock().expect("keychain lock poisoned");
        if let Some(cipher) = slot.as_ref() {
            return Ok(cipher.clone());
        }

        let default_cipher = Cipher::derive("");
        if default_cipher.decrypt(sample).is_ok() {
            *slot = Some(default_cipher.clone());
            return Ok(default_cipher);
        }

        match &self.source {
            PasswordSource::Preset(password) => {
                let cipher = Cipher::derive(password);
                cipher.decrypt(sample).map_err(|_| {
                    Error::Store(crate::error::StoreError::Decryption)
                })?;
                *slot = Some(cipher.clone());
                Ok(cipher)
            }
            PasswordSource::Interactive => loop {
                let password =
                    prompt("Enter password to decrypt your private keys (empty for default): ");
                let cipher = Cipher::derive(&password);
                match cipher.decrypt(sample) {
                    Ok(_) => {
                        tracing::info!("database unlocked");
                        *slot = Some(cipher.clone());
                        return Ok(cipher);
                    }
                    Err(_) => tracing::error!("invalid password"),
                }
            },
        }
    }
}

fn prompt(message: &str) -> String {
    print!("{message}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    line.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cipher = Cipher::derive("hunter2");
        let stored = cipher.encrypt("0xdeadbeef");
        assert_ne!(stored, "0xdeadbeef");
        assert_eq!(cipher.decrypt(&stored).expect("decrypt"), "0xdeadbeef");
    }

    #[test]
    fn wrong_password_is_invalid_key() {
        let stored = Cipher::derive("right").encrypt("secret");
        let err = Cipher::derive("wrong").decrypt(&stored).unwrap_err();
        assert!(matches!(err, Error::InvalidKey));
    }

    #[test]
    fn empty_password_uses_default_passphrase() {
        let stored = Cipher::derive("").encrypt("pk");
        assert_eq!(
            Cipher::derive(DEFAULT_PASSPHRASE).decrypt(&stored).expect("decrypt"),
            "pk"
        );
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let cipher = Cipher::derive("pw");
        assert_ne!(cipher.encrypt("same"), cipher.encrypt("same"));
    }

    #[test]
    fn preset_keychain_validates_against_sample() {
        let stored = Cipher::derive("pw").encrypt("pk");

        let good = Keychain::with_password("pw");
        let cipher = good.decryption_cipher(&stored).expect("unlock");
        assert_eq!(cipher.decrypt(&stored).expect("decrypt"), "pk");

        let bad = Keychain::with_password("nope");
        let err = bad.decryption_cipher(&stored).err().expect("mismatch");
        assert!(err.is_fatal());
    }

    #[test]
    fn preset_keychain_accepts_default_passphrase_databases() {
        let stored = Cipher::derive("").encrypt("pk");
        // Even with a (wrong) preset password the default passphrase is tried
        // first, matching how passwordless databases are opened.
        let keychain = Keychain::with_password("anything");
        let cipher = keychain.decryption_cipher(&stored).expect("unlock");
        assert_eq!(cipher.decrypt(&stored).expect("decrypt"), "pk");
    }
}
