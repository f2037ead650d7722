//! Encrypted value container.

use crate::crypto::IV_LEN;
use crate::Timestamp;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;

/// An initialization vector plus ciphertext, stamped with the time the
/// plaintext was last written.
///
/// Only [`crate::crypto::encrypt`] produces meaningful values and only
/// [`crate::crypto::decrypt`] looks inside them. Equality compares the IV and
/// ciphertext and ignores the timestamp.
#[derive(Clone)]
pub struct EncryptedValue {
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
    modified: Timestamp,
}

impl EncryptedValue {
    /// Assemble a value from its parts.
    pub fn new(iv: [u8; IV_LEN], ciphertext: Vec<u8>, modified: Timestamp) -> Self {
        Self {
            iv,
            ciphertext,
            modified,
        }
    }

    /// Assemble a value from base64 text, as found in persisted JSON.
    pub fn from_base64(iv: &str, data: &str, modified: Timestamp) -> Option<Self> {
        let iv: [u8; IV_LEN] = STANDARD.decode(iv).ok()?.try_into().ok()?;
        let ciphertext = STANDARD.decode(data).ok()?;
        Some(Self::new(iv, ciphertext, modified))
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn modified(&self) -> Timestamp {
        self.modified
    }

    pub fn iv_base64(&self) -> String {
        STANDARD.encode(self.iv)
    }

    pub fn data_base64(&self) -> String {
        STANDARD.encode(&self.ciphertext)
    }
}

impl PartialEq for EncryptedValue {
    fn eq(&self, other: &Self) -> bool {
        self.iv == other.iv && self.ciphertext == other.ciphertext
    }
}

impl Eq for EncryptedValue {}

impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("iv", &self.iv_base64())
            .field("len", &self.ciphertext.len())
            .field("modified", &self.modified)
            .finish()
    }
}
