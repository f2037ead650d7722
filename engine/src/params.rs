//! Crypto parameters for one encryption tier.
//!
//! A [`crate::Database`] carries two tiers: a fast one with few KDF rounds for
//! in-memory values and a slow one for the at-rest file. Only the salt, round
//! count and timestamp are ever persisted; the derived key lives for the
//! session and is zeroed when the last holder drops it.

use crate::crypto::{self, CryptoError, SecretKey, SALT_MAX_LEN, SALT_MIN_LEN};
use crate::Timestamp;
use std::fmt;

/// Default KDF rounds for the in-memory tier.
pub const DEFAULT_MEMORY_ROUNDS: u32 = 1_000;
/// Default KDF rounds for the at-rest file tier.
pub const DEFAULT_FILE_ROUNDS: u32 = 100_000;

/// Salt, round count, creation time and the key derived from them.
pub struct CryptoParams {
    salt: Vec<u8>,
    rounds: u32,
    last_modified: Timestamp,
    key: SecretKey,
}

impl CryptoParams {
    /// Derive parameters from a password and known salt/rounds, as when
    /// reading a persisted header.
    pub fn derive(
        password: &str,
        salt: Vec<u8>,
        rounds: u32,
        last_modified: Timestamp,
    ) -> Result<Self, CryptoError> {
        if !(SALT_MIN_LEN..=SALT_MAX_LEN).contains(&salt.len()) {
            return Err(CryptoError::InvalidParams(format!(
                "salt length {} outside {}..={}",
                salt.len(),
                SALT_MIN_LEN,
                SALT_MAX_LEN
            )));
        }
        let key = crypto::derive_key(password, &salt, rounds)?;
        Ok(Self {
            salt,
            rounds,
            last_modified,
            key,
        })
    }

    /// Create fresh parameters with a random salt.
    pub fn generate(password: &str, rounds: u32, now: Timestamp) -> Result<Self, CryptoError> {
        Self::derive(password, crypto::random_salt(), rounds, now)
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    /// Whether these parameters were produced with weaker or older settings
    /// than `current`.
    pub fn is_stale_relative_to(&self, current: &CryptoParams) -> bool {
        self.rounds < current.rounds || self.last_modified < current.last_modified
    }
}

impl fmt::Debug for CryptoParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoParams")
            .field("salt_len", &self.salt.len())
            .field("rounds", &self.rounds)
            .field("last_modified", &self.last_modified)
            .field("key", &self.key)
            .finish()
    }
}
