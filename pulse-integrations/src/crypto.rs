//! Token encryption at rest.
//!
//! AES-256-GCM with a fresh 12-byte nonce per ciphertext. The stored form
//! is `base64(nonce || ciphertext || tag)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use pulse_core::{ConfigError, PulseConfig, PulseError, PulseResult};
use std::fmt;

const NONCE_LEN: usize = 12;

/// Authenticated cipher for provider tokens.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    pub fn from_config(config: &PulseConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(&config.token_key()?))
    }

    pub fn encrypt(&self, plaintext: &str) -> PulseResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| PulseError::Decryption {
                reason: "encryption failed".into(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Fails on malformed input or a tag mismatch (wrong key, tampering).
    pub fn decrypt(&self, sealed: &str) -> PulseResult<String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(sealed.trim())
            .map_err(|e| PulseError::Decryption {
                reason: format!("invalid base64: {}", e),
            })?;
        if raw.len() <= NONCE_LEN {
            return Err(PulseError::Decryption {
                reason: "ciphertext too short".into(),
            });
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| PulseError::Decryption {
                reason: "authentication tag mismatch".into(),
            })?;
        String::from_utf8(plaintext).map_err(|_| PulseError::Decryption {
            reason: "plaintext is not UTF-8".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::ErrorKind;

    fn cipher(seed: u8) -> TokenCipher {
        TokenCipher::new(&[seed; 32])
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher(7);
        let sealed = c.encrypt("sk_live_abc").unwrap();
        assert_ne!(sealed, "sk_live_abc");
        assert_eq!(c.decrypt(&sealed).unwrap(), "sk_live_abc");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let c = cipher(7);
        assert_ne!(c.encrypt("same").unwrap(), c.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher(1).encrypt("token").unwrap();
        let err = cipher(2).decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_truncated_input_fails() {
        let c = cipher(3);
        assert!(c.decrypt("").is_err());
        assert!(c.decrypt("not base64!!").is_err());
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 8]);
        assert!(c.decrypt(&short).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        assert!(format!("{:?}", cipher(9)).contains("REDACTED"));
    }
}
