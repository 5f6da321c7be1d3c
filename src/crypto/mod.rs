//! Symmetric encryption for user host tokens. Tokens are stored as
//! `nonce(12) || ciphertext` under AES-256-GCM; the key arrives base64-encoded
//! in `ENCRYPTION_KEY` and decryption happens lazily, per use, inside the
//! analyze path.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("encryption key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    #[error("ciphertext is too short to carry a nonce")]
    Truncated,

    #[error("unable to decrypt token")]
    Decrypt,

    #[error("unable to encrypt token")]
    Encrypt,

    #[error("decrypted token is not valid UTF-8")]
    TokenEncoding(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn from_base64_key(key: &str) -> Result<Self, CryptoError> {
        let key = BASE64.decode(key.trim())?;
        if key.len() != KEY_LEN {
            return Err(CryptoError::KeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<String, CryptoError> {
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}
