//! Configuration management for the CLI.

use std::env;
use std::fmt;
use vaultsync_engine::{DEFAULT_FILE_ROUNDS, DEFAULT_MEMORY_ROUNDS};
use zeroize::Zeroizing;

/// CLI configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Vault password, zeroed on drop
    pub password: Zeroizing<String>,
    /// KDF rounds for the in-memory tier of new vaults
    pub memory_rounds: u32,
    /// KDF rounds for the at-rest tier of new vaults
    pub file_rounds: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let password = lookup("VAULTSYNC_PASSWORD")
            .filter(|p| !p.is_empty())
            .map(Zeroizing::new)
            .ok_or(ConfigError::MissingPassword)?;

        let memory_rounds = parse_rounds(
            lookup("VAULTSYNC_MEMORY_ROUNDS"),
            DEFAULT_MEMORY_ROUNDS,
            "VAULTSYNC_MEMORY_ROUNDS",
        )?;
        let file_rounds = parse_rounds(
            lookup("VAULTSYNC_FILE_ROUNDS"),
            DEFAULT_FILE_ROUNDS,
            "VAULTSYNC_FILE_ROUNDS",
        )?;

        Ok(Self {
            password,
            memory_rounds,
            file_rounds,
        })
    }
}

fn parse_rounds(value: Option<String>, default: u32, key: &'static str) -> Result<u32, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(rounds) if rounds >= 1 => Ok(rounds),
            _ => Err(ConfigError::InvalidRounds(key)),
        },
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("password", &"[REDACTED]")
            .field("memory_rounds", &self.memory_rounds)
            .field("file_rounds", &self.file_rounds)
            .finish()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("VAULTSYNC_PASSWORD environment variable is required")]
    MissingPassword,

    #[error("Invalid {0} value, expected a positive integer")]
    InvalidRounds(&'static str),
}
