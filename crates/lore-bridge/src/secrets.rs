use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use secrecy::{ExposeSecret, SecretBox, SecretString};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key that encrypts pickle keys at rest.
pub struct MasterKey(SecretBox<[u8; KEY_LEN]>);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(SecretBox::new(Box::new(key)))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SecretError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SecretError::InvalidKeyLength)?;
        Ok(Self(SecretBox::new(Box::new(key))))
    }

    /// Read the base64 key file, creating it (mode `0600`) on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, SecretError> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|_| SecretError::InvalidEncoding)?;
            return Self::from_bytes(&bytes);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, STANDARD.encode(key.0.expose_secret()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(path = %path.display(), "created master key");
        Ok(key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(self.0.expose_secret().into())
    }

    /// Encrypt `plaintext` bound to `context`. Output is base64 of nonce || ciphertext.
    pub fn seal(&self, plaintext: &str, context: &str) -> Result<String, SecretError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| SecretError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Inverse of [`seal`](Self::seal). Fails if `context` differs.
    pub fn open(&self, sealed: &str, context: &str) -> Result<SecretString, SecretError> {
        let combined = STANDARD
            .decode(sealed)
            .map_err(|_| SecretError::InvalidEncoding)?;
        if combined.len() < NONCE_LEN {
            return Err(SecretError::InvalidEncoding);
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| SecretError::DecryptionFailed)?;
        let text = String::from_utf8(plaintext).map_err(|_| SecretError::InvalidUtf8)?;
        Ok(SecretString::from(text))
    }
}

/// Fresh pickle key: 32 random bytes, base64.
pub fn random_pickle_key() -> SecretString {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    SecretString::from(STANDARD.encode(bytes))
}
