//! Authenticated encryption for secret values at rest.
//!
//! Every secret is sealed under a process-wide master key with
//! XChaCha20-Poly1305. The produced blob is self-describing:
//! a fresh 24-byte nonce followed by the ciphertext and tag. A wrong key,
//! a truncated blob or any bit flip fails the tag check and surfaces as
//! [`CipherError::Decrypt`] — a deployment started with the wrong master
//! key fails on its first decrypt instead of running with garbage.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};

pub const MASTER_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("master key must be {MASTER_KEY_LEN} bytes ({} hex chars)", MASTER_KEY_LEN * 2)]
    InvalidKey,
    #[error("ciphertext too short to carry a nonce")]
    TruncatedCiphertext,
    #[error("decryption failed: wrong key or tampered ciphertext")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

pub struct Cipher {
    cipher: XChaCha20Poly1305,
}

impl Cipher {
    /// Builds a cipher from the hex-encoded master key supplied at process
    /// start.
    pub fn from_hex_key(master_key: &str) -> Result<Self, CipherError> {
        let stripped = master_key.strip_prefix("0x").unwrap_or(master_key);
        let bytes = hex::decode(stripped).map_err(|_| CipherError::InvalidKey)?;
        Self::new(&bytes)
    }

    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != MASTER_KEY_LEN {
            return Err(CipherError::InvalidKey);
        }
        Ok(Self {
            cipher: XChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?,
        })
    }

    /// Encrypts `plaintext`, prepending the randomly generated nonce to the
    /// sealed bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`Cipher::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        // nonce + at least the 16-byte tag
        if blob.len() < NONCE_LEN + 16 {
            return Err(CipherError::TruncatedCiphertext);
        }
        let nonce = XNonce::from_slice(&blob[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|_| CipherError::Decrypt)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Cipher {
        Cipher::new(&[7u8; MASTER_KEY_LEN]).unwrap()
    }

    #[test]
    fn round_trip() {
        let cipher = test_cipher();
        let blob = cipher.encrypt(b"sk-very-secret").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"sk-very-secret");
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let cipher = test_cipher();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = test_cipher();
        let mut blob = cipher.encrypt(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&blob), Err(CipherError::Decrypt)));
    }

    #[test]
    fn wrong_key_is_detected() {
        let blob = test_cipher().encrypt(b"payload").unwrap();
        let other = Cipher::new(&[8u8; MASTER_KEY_LEN]).unwrap();
        assert!(matches!(other.decrypt(&blob), Err(CipherError::Decrypt)));
    }

    #[test]
    fn short_input_is_rejected_before_decrypting() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.decrypt(&[0u8; 10]),
            Err(CipherError::TruncatedCiphertext)
        ));
    }

    #[test]
    fn hex_key_parsing() {
        let key = "11".repeat(MASTER_KEY_LEN);
        assert!(Cipher::from_hex_key(&key).is_ok());
        assert!(Cipher::from_hex_key(&format!("0x{key}")).is_ok());
        assert!(matches!(
            Cipher::from_hex_key("deadbeef"),
            Err(CipherError::InvalidKey)
        ));
    }
}
