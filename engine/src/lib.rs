//! # vaultsync engine
//!
//! An encrypted, hierarchical secret store whose copies can be merged after
//! being modified independently.
//!
//! The engine has no IO: persisted forms go in and out as JSON strings and
//! the caller decides where they live.
//!
//! ## Core Concepts
//!
//! ### Encryption tiers
//!
//! Every [`Database`] carries two [`CryptoParams`]: a fast in-memory tier used
//! for every value held in the tree, and a slow at-rest tier used only when
//! saving or loading a vault file. Values are AES-256-CBC [`EncryptedValue`]s
//! with a fresh IV per encryption; keys come from PBKDF2-HMAC-SHA256.
//!
//! ### Nodes
//!
//! A vault is a tree of [`DatabaseNode`]s held in a [`NodeTree`] arena. Each
//! node has a stable id, an optional name, an optional encrypted value, a
//! last-modified timestamp and a set of tombstones recording which children
//! were deleted and when.
//!
//! ### Merging
//!
//! [`DatabaseMerger`] folds a remote tree into a local one in place. Nodes are
//! matched by id. Tombstones stop stale copies from resurrecting deletions
//! unless the remote edit is newer than the delete. Every decision lands in a
//! [`MergeLog`].
//!
//! ## Quick Start
//!
//! ```rust
//! use vaultsync_engine::{Database, DatabaseMerger};
//!
//! let mut local = Database::new("hunter2", 1, 1).unwrap();
//! let root = local.root();
//! local.add_entry(root, "mail", b"alice@example.com").unwrap();
//!
//! // A remote copy sharing the same keys
//! let mut remote = Database::create_like(&local);
//! let remote_root = remote.root();
//! remote.add_entry(remote_root, "bank", b"1234").unwrap();
//!
//! let log = DatabaseMerger::new().merge(&remote, &mut local).unwrap();
//! assert!(local.find_path(&["bank"]).is_some());
//! println!("{}", log.as_text());
//! ```

pub mod convert;
pub mod crypto;
pub mod database;
pub mod error;
pub mod log;
pub mod merge;
pub mod node;
pub mod params;
pub mod snapshot;
pub mod value;

// Re-export main types at crate root
pub use convert::{ConvertOptions, Converter, Format, NativeConverter, NativeDocument, NativeNode};
pub use crypto::{CryptoError, SecretKey};
pub use database::{ChangeEvent, Database};
pub use error::{Error, Result};
pub use log::{LogItem, LogLevel, MergeLog};
pub use merge::{DatabaseMerger, ExcludeFilter, REMOTE_SYNC_NODE};
pub use node::{DatabaseNode, NodeIdx, NodeTree};
pub use params::{CryptoParams, DEFAULT_FILE_ROUNDS, DEFAULT_MEMORY_ROUNDS};
pub use snapshot::{NodeRecord, Tombstone, TreeSnapshot, VaultFile, FORMAT_VERSION};
pub use value::EncryptedValue;

/// Type aliases for clarity
pub type NodeId = uuid::Uuid;
/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
