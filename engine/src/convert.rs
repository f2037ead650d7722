//! Converters between a [`Database`] and external text.
//!
//! A converter never replaces a tree outright: imports are parsed into a
//! scratch database sharing the target's keys and merged in with
//! [`DatabaseMerger`].

use crate::{
    error::Result,
    merge::{is_remote_sync, DatabaseMerger},
    snapshot::{from_json_unbounded, NodeRecord, Tombstone},
    Database, EncryptedValue, Error, LogItem, NodeIdx, Timestamp, FORMAT_VERSION,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Recognized external formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// The per-node JSON form with plaintext values
    #[default]
    Native,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Native => f.write_str("native"),
        }
    }
}

/// Options shared by every converter call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    pub format: Format,
    /// Include the top-level remote-sync subtree
    pub remote_sync: bool,
}

impl ConvertOptions {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            remote_sync: false,
        }
    }

    pub fn with_remote_sync(mut self, remote_sync: bool) -> Self {
        self.remote_sync = remote_sync;
        self
    }
}

/// Import and export for one [`Format`].
pub trait Converter {
    fn format(&self) -> Format;

    /// Merge the tree described by `text` into `db`, returning what was done.
    fn import_text(&self, db: &mut Database, options: &ConvertOptions, text: &str) -> Result<Vec<LogItem>>;

    fn import_stream(
        &self,
        db: &mut Database,
        options: &ConvertOptions,
        reader: &mut dyn Read,
    ) -> Result<Vec<LogItem>> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        self.import_text(db, options, &text)
    }

    fn export_text(&self, db: &Database, options: &ConvertOptions) -> Result<String>;

    fn export_stream(&self, db: &Database, options: &ConvertOptions, writer: &mut dyn Write) -> Result<()> {
        let text = self.export_text(db, options)?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// One node of a native document.
///
/// Values are plaintext: UTF-8 values go in `value`, anything else is base64
/// in `valueBase64`. Ids, timestamps and tombstones are kept so that an
/// import merges like another copy of the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeNode {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub modified: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_base64: Option<String>,
    #[serde(default)]
    pub children: Vec<NativeNode>,
    #[serde(default)]
    pub deleted_children: Vec<Tombstone>,
}

impl NativeNode {
    fn export<K>(db: &Database, idx: NodeIdx, include: &K) -> Result<Self>
    where
        K: Fn(NodeIdx) -> bool,
    {
        let node = &db.tree()[idx];
        let plaintext = node
            .value()
            .map(|v| db.decrypt(v).map(Zeroizing::new))
            .transpose()
            .map_err(|e| e.context(format!("exporting {}", db.path(idx))))?;
        let (value, value_base64) = match plaintext {
            None => (None, None),
            Some(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => (Some(text.to_string()), None),
                Err(_) => (None, Some(STANDARD.encode(bytes.as_slice()))),
            },
        };

        let mut children = Vec::with_capacity(node.child_count());
        for (_, child) in node.children() {
            if include(child) {
                children.push(Self::export(db, child, include)?);
            }
        }

        Ok(Self {
            id: node.id(),
            name: node.name().map(str::to_string),
            modified: node.last_modified(),
            value,
            value_base64,
            children,
            deleted_children: node
                .deleted_children()
                .iter()
                .map(|(id, deleted)| Tombstone::Stamped {
                    id: *id,
                    deleted: *deleted,
                })
                .collect(),
        })
    }

    /// Encrypt this subtree under `db`'s memory key as a [`NodeRecord`].
    fn to_record(&self, db: &Database) -> Result<NodeRecord> {
        let plaintext = match (&self.value, &self.value_base64) {
            (None, None) => None,
            (Some(text), None) => Some(Zeroizing::new(text.as_bytes().to_vec())),
            (None, Some(encoded)) => Some(Zeroizing::new(STANDARD.decode(encoded).map_err(|e| {
                Error::MalformedInput(format!("invalid valueBase64 on node {}: {}", self.id, e))
            })?)),
            (Some(_), Some(_)) => {
                return Err(Error::MalformedInput(format!(
                    "node {} has both value and valueBase64",
                    self.id
                )))
            }
        };
        let encrypted = plaintext.map(|p| db.encrypt_at(Some(p.as_slice()), self.modified));

        Ok(NodeRecord {
            id: self.id,
            name: self.name.clone(),
            modified: self.modified,
            iv: encrypted.as_ref().map(EncryptedValue::iv_base64),
            data: encrypted.as_ref().map(EncryptedValue::data_base64),
            children: self
                .children
                .iter()
                .map(|c| c.to_record(db))
                .collect::<Result<_>>()?,
            deleted_children: self.deleted_children.clone(),
        })
    }
}

/// A whole tree in the native form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeDocument {
    pub format_version: u32,
    pub root: NativeNode,
}

impl NativeDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        let document: Self = from_json_unbounded(json.as_bytes())?;
        if document.format_version > FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(document.format_version));
        }
        Ok(document)
    }
}

/// Converter for [`Format::Native`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConverter;

impl NativeConverter {
    pub fn new() -> Self {
        Self
    }
}

impl Converter for NativeConverter {
    fn format(&self) -> Format {
        Format::Native
    }

    fn import_text(&self, db: &mut Database, options: &ConvertOptions, text: &str) -> Result<Vec<LogItem>> {
        let document = NativeDocument::from_json(text)?;
        let tree = document
            .root
            .to_record(db)
            .and_then(|record| record.restore(&mut |v: &EncryptedValue| Ok(v.clone())))
            .map_err(|e| e.context("importing native text"))?;
        let parsed = Database::with_tree(
            tree,
            Arc::clone(db.memory_params()),
            Arc::clone(db.file_params()),
        );
        debug!(nodes = parsed.tree().len(), "parsed native text");

        let merger = if options.remote_sync {
            DatabaseMerger::new()
        } else {
            DatabaseMerger::excluding_remote_sync()
        };
        let log = merger
            .merge(&parsed, db)
            .map_err(|e| e.context("importing native text"))?;
        Ok(log.items().to_vec())
    }

    fn export_text(&self, db: &Database, options: &ConvertOptions) -> Result<String> {
        let tree = db.tree();
        let include = |idx: NodeIdx| options.remote_sync || !is_remote_sync(&tree.path(idx), &tree[idx]);
        let root = NativeNode::export(db, db.root(), &include)
            .map_err(|e| e.context("exporting native text"))?;
        let document = NativeDocument {
            format_version: FORMAT_VERSION,
            root,
        };
        serde_json::to_string_pretty(&document).map_err(|e| Error::MalformedInput(e.to_string()))
    }
}
