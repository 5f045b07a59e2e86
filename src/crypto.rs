use std::num::NonZeroU32;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const ENVELOPE_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key cannot be empty")]
    EmptyKey,

    #[error("encryption salt cannot be empty")]
    EmptySalt,

    #[error("failed to encrypt secret")]
    Encryption,

    #[error("failed to decrypt secret: {0}")]
    Decryption(&'static str),
}

/// Symmetric cipher for secrets at rest (access/refresh tokens, client
/// secrets, device codes). The key is derived once from the configured
/// secret + salt and held in memory only; it is never logged or persisted.
///
/// Ciphertext envelope: `v1:<base64 nonce>:<base64 ciphertext+tag>`.
pub struct TokenCipher {
    key: [u8; KEY_BYTES],
    rng: SystemRandom,
}

impl TokenCipher {
    pub fn new(secret: &str, salt: &str) -> Result<Self, CryptoError> {
        if secret.trim().is_empty() {
            return Err(CryptoError::EmptyKey);
        }
        if salt.trim().is_empty() {
            return Err(CryptoError::EmptySalt);
        }

        let mut key = [0u8; KEY_BYTES];
        let iterations =
            NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2 iteration count is non-zero");
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt.as_bytes(),
            secret.as_bytes(),
            &mut key,
        );

        Ok(Self {
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt a secret. Empty input passes through unchanged: absent
    /// tokens are stored as empty strings, not ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let unbound_key =
            UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::Encryption)?;
        let key = LessSafeKey::new(unbound_key);

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Encryption)?;

        let mut buffer = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut buffer,
        )
        .map_err(|_| CryptoError::Encryption)?;

        Ok(format!(
            "{ENVELOPE_VERSION}:{}:{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(&buffer)
        ))
    }

    /// Decrypt an envelope produced by [`encrypt`](Self::encrypt). Tampered
    /// or malformed input fails; it never yields garbage plaintext.
    pub fn decrypt(&self, envelope: &str) -> Result<String, CryptoError> {
        if envelope.is_empty() {
            return Ok(String::new());
        }

        let mut parts = envelope.splitn(3, ':');
        let version = parts.next().unwrap_or_default();
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::Decryption("unsupported envelope version"));
        }

        let nonce_raw = parts
            .next()
            .ok_or(CryptoError::Decryption("missing nonce"))?;
        let ciphertext_raw = parts
            .next()
            .ok_or(CryptoError::Decryption("missing ciphertext"))?;

        let nonce_vec = URL_SAFE_NO_PAD
            .decode(nonce_raw)
            .map_err(|_| CryptoError::Decryption("invalid nonce encoding"))?;
        let nonce_bytes: [u8; NONCE_BYTES] = nonce_vec
            .try_into()
            .map_err(|_| CryptoError::Decryption("invalid nonce length"))?;

        let mut buffer = URL_SAFE_NO_PAD
            .decode(ciphertext_raw)
            .map_err(|_| CryptoError::Decryption("invalid ciphertext encoding"))?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| CryptoError::Decryption("key setup failed"))?;
        let key = LessSafeKey::new(unbound_key);

        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Decryption("authentication failed"))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::Decryption("plaintext is not valid UTF-8"))
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never leak through Debug output.
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{CryptoError, TokenCipher};

    fn cipher() -> TokenCipher {
        TokenCipher::new("test-encryption-secret", "test-salt").expect("build cipher")
    }

    #[test]
    fn round_trip_recovers_plaintext() {
        let cipher = cipher();
        for input in ["access-token-abc123", "short", "with spaces and ünïcode"] {
            let sealed = cipher.encrypt(input).expect("encrypt");
            assert_ne!(sealed, input);
            assert!(!sealed.contains(input));
            assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), input);
        }
    }

    #[test]
    fn empty_string_passes_through() {
        let cipher = cipher();
        assert_eq!(cipher.encrypt("").expect("encrypt empty"), "");
        assert_eq!(cipher.decrypt("").expect("decrypt empty"), "");
    }

    #[test]
    fn nonce_makes_ciphertext_unique() {
        let cipher = cipher();
        let first = cipher.encrypt("same-token").expect("encrypt");
        let second = cipher.encrypt("same-token").expect("encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = cipher();
        let sealed = cipher.encrypt("refresh-token").expect("encrypt");

        let mut corrupted = sealed.clone().into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'A' { b'B' } else { b'A' };
        let corrupted = String::from_utf8(corrupted).expect("still utf-8");

        assert!(matches!(
            cipher.decrypt(&corrupted),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn foreign_key_cannot_decrypt() {
        let sealed = cipher().encrypt("secret").expect("encrypt");
        let other = TokenCipher::new("different-secret", "test-salt").expect("build cipher");
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let cipher = cipher();
        assert!(cipher.decrypt("v2:abc:def").is_err());
        assert!(cipher.decrypt("not-an-envelope").is_err());
        assert!(cipher.decrypt("v1:!!!:???").is_err());
    }

    #[test]
    fn empty_key_or_salt_is_refused() {
        assert!(matches!(
            TokenCipher::new("", "salt"),
            Err(CryptoError::EmptyKey)
        ));
        assert!(matches!(
            TokenCipher::new("key", "  "),
            Err(CryptoError::EmptySalt)
        ));
    }
}
