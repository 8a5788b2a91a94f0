//! CryptoBox: authenticated encryption for secrets at rest.
//!
//! Git tokens and env-var values are sealed with ChaCha20-Poly1305 under a
//! single 32-byte process key. The stored form is base64 of
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`, with a fresh random
//! nonce per call. Without a key the box is a passthrough (development mode).

use base64::{Engine as _, engine::general_purpose};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

/// Key size for ChaCha20-Poly1305.
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key: expected {KEY_SIZE} bytes, got {actual}")]
    InvalidKey { actual: usize },
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Seals and opens secret values. Holds the only copy of the key material.
#[derive(Clone)]
pub struct CryptoBox {
    cipher: Option<ChaCha20Poly1305>,
}

impl fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoBox")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl CryptoBox {
    /// Build a box from raw key bytes. `None` disables encryption.
    pub fn new(key: Option<&[u8]>) -> CryptoResult<Self> {
        let cipher = match key {
            None => None,
            Some(bytes) => Some(
                ChaCha20Poly1305::new_from_slice(bytes)
                    .map_err(|_| CryptoError::InvalidKey { actual: bytes.len() })?,
            ),
        };
        Ok(Self { cipher })
    }

    /// Build a box from the configured key string.
    ///
    /// Accepts exactly 32 raw bytes, or standard base64 decoding to 32 bytes.
    /// An empty string counts as absent.
    pub fn from_config_key(raw: Option<&str>) -> CryptoResult<Self> {
        let Some(raw) = raw.filter(|s| !s.is_empty()) else {
            return Self::new(None);
        };
        if raw.len() == KEY_SIZE {
            return Self::new(Some(raw.as_bytes()));
        }
        match general_purpose::STANDARD.decode(raw) {
            Ok(decoded) => Self::new(Some(&decoded)),
            Err(_) => Err(CryptoError::InvalidKey { actual: raw.len() }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal `plaintext` into a text-safe opaque string.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    /// Open a value produced by [`CryptoBox::encrypt`].
    ///
    /// Tampering, truncation, a wrong key, or malformed base64 all yield
    /// `InvalidCiphertext`.
    pub fn decrypt(&self, sealed: &str) -> CryptoResult<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(sealed.to_string());
        };

        let raw = general_purpose::STANDARD
            .decode(sealed.trim())
            .map_err(|e| CryptoError::InvalidCiphertext(format!("base64: {}", e)))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidCiphertext(format!(
                "too short ({} bytes)",
                raw.len()
            )));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::InvalidCiphertext("authentication failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::InvalidCiphertext("plaintext is not UTF-8".into()))
    }
}
