//! Process-wide symmetric cipher and payload codec.
//!
//! A payload on the wire is `nonce (12 bytes) || ChaCha20-Poly1305(zstd(file bytes))`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const ZSTD_LEVEL: i32 = 3;

/// Shared key derived once per process from the configured secret.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: derive_key(secret.as_bytes()),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, PayloadError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| PayloadError::Key)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| PayloadError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(&self, buf: &[u8]) -> Result<Vec<u8>, PayloadError> {
        if buf.len() < NONCE_LEN {
            return Err(PayloadError::Truncated);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| PayloadError::Key)?;
        let (nonce, body) = buf.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| PayloadError::Decrypt)
    }

    /// Compress then encrypt a whole file for sending.
    pub fn encode_payload(&self, data: &[u8]) -> Result<Vec<u8>, PayloadError> {
        let packed = zstd::encode_all(data, ZSTD_LEVEL).map_err(PayloadError::Compress)?;
        self.seal(&packed)
    }

    /// Decrypt then decompress a received payload.
    pub fn decode_payload(&self, buf: &[u8]) -> Result<Vec<u8>, PayloadError> {
        let packed = self.open(buf)?;
        zstd::decode_all(packed.as_slice()).map_err(PayloadError::Decompress)
    }
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"lynx-shared-v1");
    hasher.update(secret);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("payload shorter than nonce")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let cipher = Cipher::from_secret("s3cret");
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);
        let wire = cipher.encode_payload(&data).unwrap();
        assert_eq!(cipher.decode_payload(&wire).unwrap(), data);
    }

    #[test]
    fn nonces_differ_between_seals() {
        let cipher = Cipher::from_secret("s3cret");
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_secret_fails_to_open() {
        let wire = Cipher::from_secret("one").encode_payload(b"hello").unwrap();
        assert!(matches!(
            Cipher::from_secret("two").decode_payload(&wire),
            Err(PayloadError::Decrypt)
        ));
    }

    #[test]
    fn sealed_garbage_fails_to_decompress() {
        let cipher = Cipher::from_secret("k");
        let wire = cipher.seal(b"definitely not zstd").unwrap();
        assert!(matches!(
            cipher.decode_payload(&wire),
            Err(PayloadError::Decompress(_))
        ));
    }

    #[test]
    fn short_buffer_is_truncated() {
        let cipher = Cipher::from_secret("k");
        assert!(matches!(cipher.open(&[1, 2, 3]), Err(PayloadError::Truncated)));
    }
}
