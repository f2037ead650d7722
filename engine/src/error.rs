//! Error types for the vaultsync engine.

use crate::crypto::CryptoError;
use thiserror::Error;
use uuid::Uuid;

/// All possible errors from the vaultsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Crypto errors are fatal: no partial result is ever produced
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    // Input errors
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("unsupported format version: {0}")]
    UnsupportedFormat(u32),

    #[error("io error: {0}")]
    Io(String),

    // Wrapped failures from import, export or merge
    #[error("{context}: {source}")]
    Conversion {
        context: String,
        #[source]
        source: Box<Error>,
    },

    // Programmer errors
    #[error("duplicate node id: {0}")]
    DuplicateId(Uuid),

    #[error("tree invariant violated: {0}")]
    StructuralInvariant(String),
}

impl Error {
    /// Wrap this error with context about the node and operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Conversion {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all conversion context stripped.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Conversion { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedInput(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
