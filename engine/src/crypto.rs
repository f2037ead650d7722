//! Key derivation and symmetric encryption.
//!
//! - PBKDF2-HMAC-SHA256 producing a 256-bit key
//! - AES-256-CBC with PKCS#7 padding
//! - A fresh random 16-byte IV for every encryption
//!
//! All functions are pure over their explicit inputs (apart from RNG use) and
//! safe to call from several threads at once.

use crate::value::EncryptedValue;
use crate::Timestamp;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of a derived key in bytes.
pub const KEY_LEN: usize = 32;
/// Length of an initialization vector in bytes.
pub const IV_LEN: usize = 16;
/// Shortest salt produced by [`random_salt`].
pub const SALT_MIN_LEN: usize = 32;
/// Longest salt produced by [`random_salt`].
pub const SALT_MAX_LEN: usize = 64;

const BLOCK_LEN: usize = 16;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid crypto parameters: {0}")]
    InvalidParams(String),

    /// Bad padding, bad length and wrong key all collapse into this one
    /// variant so callers cannot tell them apart.
    #[error("decryption failed")]
    Decryption,
}

/// A derived symmetric key. Zeroed when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Derive a key from a password with PBKDF2-HMAC-SHA256.
///
/// Deterministic for identical inputs. `rounds` must be at least 1.
pub fn derive_key(password: &str, salt: &[u8], rounds: u32) -> Result<SecretKey, CryptoError> {
    if rounds == 0 {
        return Err(CryptoError::KeyDerivation(
            "round count must be at least 1".to_string(),
        ));
    }
    if salt.is_empty() {
        return Err(CryptoError::KeyDerivation("salt is empty".to_string()));
    }

    let mut key = SecretKey::from_bytes([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut key.bytes);
    Ok(key)
}

/// Generate a random salt whose length is itself random in `[32, 64]`.
pub fn random_salt() -> Vec<u8> {
    let len = OsRng.gen_range(SALT_MIN_LEN..=SALT_MAX_LEN);
    let mut salt = vec![0u8; len];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypt a payload under `key`, stamping the result with `modified`.
///
/// A missing payload is encrypted as empty bytes.
pub fn encrypt(key: &SecretKey, plaintext: Option<&[u8]>, modified: Timestamp) -> EncryptedValue {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.unwrap_or_default());

    EncryptedValue::new(iv, ciphertext, modified)
}

/// Decrypt a value produced by [`encrypt`].
///
/// Fails with [`CryptoError::Decryption`] for every kind of corruption,
/// including a wrong key that happens to break the padding.
pub fn decrypt(key: &SecretKey, value: &EncryptedValue) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = value.ciphertext();
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::Decryption);
    }

    Aes256CbcDec::new(key.as_bytes().into(), value.iv().into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decryption)
}
