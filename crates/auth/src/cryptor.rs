//! Symmetric authenticated encryption for access/refresh/id tokens at rest
//! (spec §4.1).
//!
//! The key is loaded from a single on-disk file; if absent, a fresh key is
//! generated, written with owner-only permissions, and cached in memory for
//! the lifetime of the process. A corrupted or tampered ciphertext fails
//! with `Error::InvalidToken`, which callers treat as permanent — the
//! account cannot be used without re-login.

use std::path::Path;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypts/decrypts token strings with a single on-disk key.
pub struct TokenCryptor {
    cipher: ChaCha20Poly1305,
}

impl TokenCryptor {
    /// Load the key from `path`, generating and persisting one if absent.
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let key = if tokio::fs::try_exists(path)
            .await
            .map_err(|e| Error::Io(e.to_string()))?
        {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            if bytes.len() != KEY_LEN {
                return Err(Error::Io(format!(
                    "key file {} has unexpected length {} (want {KEY_LEN})",
                    path.display(),
                    bytes.len()
                )));
            }
            Zeroizing::new(bytes)
        } else {
            let mut bytes = vec![0u8; KEY_LEN];
            rand::Rng::fill(&mut rand::rng(), bytes.as_mut_slice());
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::Io(e.to_string()))?;
                }
            }
            tokio::fs::write(path, &bytes)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                    .await
                    .map_err(|e| Error::Io(e.to_string()))?;
            }
            Zeroizing::new(bytes)
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext token string, prefixing the ciphertext with its
    /// random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::InvalidToken)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt bytes produced by `encrypt`. Returns `Error::InvalidToken` on
    /// any malformed or tampered input.
    pub fn decrypt(&self, data: &[u8]) -> Result<String> {
        if data.len() < NONCE_LEN {
            return Err(Error::InvalidToken);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::InvalidToken)?;
        String::from_utf8(plaintext).map_err(|_| Error::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let cryptor = TokenCryptor::load_or_generate(dir.path().join("key")).await.unwrap();
        let ciphertext = cryptor.encrypt("at_super_secret").unwrap();
        assert_ne!(ciphertext, b"at_super_secret");
        assert_eq!(cryptor.decrypt(&ciphertext).unwrap(), "at_super_secret");
    }

    #[tokio::test]
    async fn generates_key_file_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        assert!(!path.exists());
        TokenCryptor::load_or_generate(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn reuses_existing_key_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        let a = TokenCryptor::load_or_generate(&path).await.unwrap();
        let ciphertext = a.encrypt("token").unwrap();

        let b = TokenCryptor::load_or_generate(&path).await.unwrap();
        assert_eq!(b.decrypt(&ciphertext).unwrap(), "token");
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_invalid_token() {
        let dir = tempfile::tempdir().unwrap();
        let cryptor = TokenCryptor::load_or_generate(dir.path().join("key")).await.unwrap();
        let mut ciphertext = cryptor.encrypt("token").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(matches!(cryptor.decrypt(&ciphertext), Err(Error::InvalidToken)));
    }

    #[tokio::test]
    async fn truncated_ciphertext_is_invalid_token() {
        let dir = tempfile::tempdir().unwrap();
        let cryptor = TokenCryptor::load_or_generate(dir.path().join("key")).await.unwrap();
        assert!(matches!(cryptor.decrypt(&[1, 2, 3]), Err(Error::InvalidToken)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        TokenCryptor::load_or_generate(&path).await.unwrap();
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn two_encryptions_of_same_plaintext_differ() {
        let dir = tempfile::tempdir().unwrap();
        let cryptor = TokenCryptor::load_or_generate(dir.path().join("key")).await.unwrap();
        let a = cryptor.encrypt("token").unwrap();
        let b = cryptor.encrypt("token").unwrap();
        assert_ne!(a, b, "nonces must differ between calls");
    }
}
