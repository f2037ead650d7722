//! Persisted forms of a vault.
//!
//! Two layers:
//!
//! - [`TreeSnapshot`] / [`NodeRecord`]: the per-node form. Each node carries
//!   its id, name, timestamp, encrypted value, children and tombstones.
//! - [`VaultFile`]: the at-rest form. The serialized [`TreeSnapshot`] becomes a
//!   single ciphertext next to the file-tier salt, rounds and timestamp.
//!
//! Children are emitted in ascending id order, so serializing the same tree
//! twice yields identical JSON.

use crate::{
    crypto::{self, CryptoError},
    error::Result,
    node::DatabaseNode,
    CryptoParams, EncryptedValue, Error, NodeIdx, NodeTree, Timestamp,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Version of the per-node format for future compatibility.
pub const FORMAT_VERSION: u32 = 1;

/// A deletion record inside [`NodeRecord::deleted_children`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tombstone {
    Stamped { id: Uuid, deleted: Timestamp },
    /// A bare id; takes the owning node's timestamp as its deletion time
    Bare(Uuid),
}

/// One node in the per-node form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub modified: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub children: Vec<NodeRecord>,
    #[serde(default)]
    pub deleted_children: Vec<Tombstone>,
}

impl NodeRecord {
    /// Capture the subtree at `idx`. `value_of` re-encrypts each value for
    /// the target tier; `include` decides which children are written.
    pub fn capture<F, K>(tree: &NodeTree, idx: NodeIdx, value_of: &mut F, include: &K) -> Result<Self>
    where
        F: FnMut(&EncryptedValue) -> Result<EncryptedValue>,
        K: Fn(&NodeTree, NodeIdx) -> bool,
    {
        let node = &tree[idx];
        let value = node
            .value()
            .map(|v| value_of(v))
            .transpose()
            .map_err(|e| e.context(format!("exporting {}", tree.path(idx))))?;

        let mut children = Vec::with_capacity(node.child_count());
        for (_, child) in node.children() {
            if include(tree, child) {
                children.push(Self::capture(tree, child, value_of, include)?);
            }
        }

        Ok(Self {
            id: node.id(),
            name: node.name().map(str::to_string),
            modified: node.last_modified(),
            iv: value.as_ref().map(EncryptedValue::iv_base64),
            data: value.as_ref().map(EncryptedValue::data_base64),
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

    fn detached_node(&self) -> Result<DatabaseNode> {
        let value = match (&self.iv, &self.data) {
            (Some(iv), Some(data)) => Some(
                EncryptedValue::from_base64(iv, data, self.modified).ok_or_else(|| {
                    Error::MalformedInput(format!("invalid iv or data on node {}", self.id))
                })?,
            ),
            (None, None) => None,
            _ => {
                return Err(Error::MalformedInput(format!(
                    "node {} has only one of iv and data",
                    self.id
                )))
            }
        };
        Ok(DatabaseNode::with_id(
            self.id,
            self.name.clone(),
            value,
            self.modified,
        ))
    }

    fn tombstones(&self) -> impl Iterator<Item = (Uuid, Timestamp)> + '_ {
        self.deleted_children.iter().map(|t| match t {
            Tombstone::Stamped { id, deleted } => (*id, *deleted),
            Tombstone::Bare(id) => (*id, self.modified),
        })
    }

    /// Rebuild a tree rooted at this record. `value_of` re-encrypts each value
    /// for the in-memory tier.
    pub fn restore<F>(&self, value_of: &mut F) -> Result<NodeTree>
    where
        F: FnMut(&EncryptedValue) -> Result<EncryptedValue>,
    {
        let mut tree = NodeTree::with_root(self.transformed(value_of, "/")?);
        let root = tree.root();
        self.restore_children(&mut tree, root, value_of)?;
        Ok(tree)
    }

    fn transformed<F>(&self, value_of: &mut F, path: &str) -> Result<DatabaseNode>
    where
        F: FnMut(&EncryptedValue) -> Result<EncryptedValue>,
    {
        let mut node = self.detached_node()?;
        let value = node
            .value()
            .map(|v| value_of(v))
            .transpose()
            .map_err(|e| e.context(format!("importing {}", path)))?;
        if value.is_some() {
            node.set_value(value, self.modified);
        }
        Ok(node)
    }

    fn restore_children<F>(&self, tree: &mut NodeTree, idx: NodeIdx, value_of: &mut F) -> Result<()>
    where
        F: FnMut(&EncryptedValue) -> Result<EncryptedValue>,
    {
        for child in &self.children {
            let path = tree.child_path(idx, child.name.as_deref(), &child.id);
            let node = child.transformed(value_of, &path)?;
            let child_idx = tree.add_child(idx, node).map_err(as_malformed)?;
            child.restore_children(tree, child_idx, value_of)?;
        }
        for (id, deleted) in self.tombstones() {
            tree.set_tombstone(idx, id, deleted).map_err(as_malformed)?;
        }
        Ok(())
    }

    /// Number of nodes in this subtree, itself included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(NodeRecord::count).sum::<usize>()
    }
}

/// Structural problems in external data are input errors, not defects.
fn as_malformed(err: Error) -> Error {
    match err {
        Error::DuplicateId(id) => Error::MalformedInput(format!("duplicate node id {}", id)),
        Error::StructuralInvariant(msg) => Error::MalformedInput(msg),
        other => other,
    }
}

/// The per-node form of a whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub format_version: u32,
    pub root: NodeRecord,
}

impl TreeSnapshot {
    pub fn new(root: NodeRecord) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            root,
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::MalformedInput(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = from_json_unbounded(bytes)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<()> {
        if self.format_version > FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(self.format_version));
        }
        Ok(())
    }
}

/// Parse JSON of any nesting depth. Trees nest two JSON levels per node,
/// so the parser's default limit of 128 would cap vaults at about 63 levels;
/// the stack grows on the heap instead.
pub(crate) fn from_json_unbounded<T: DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<T> {
    let mut de = serde_json::Deserializer::from_slice(bytes);
    de.disable_recursion_limit();
    let value = T::deserialize(serde_stacker::Deserializer::new(&mut de))?;
    de.end()?;
    Ok(value)
}

/// The at-rest file: file-tier parameters plus the encrypted tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultFile {
    #[serde(rename = "cryptoParams.salt")]
    pub salt: String,
    #[serde(rename = "cryptoParams.rounds")]
    pub rounds: u32,
    #[serde(rename = "cryptoParams.modified")]
    pub modified: Timestamp,
    pub iv: String,
    pub data: String,
}

impl VaultFile {
    /// Encrypt `snapshot` as one blob under the file key.
    pub fn seal(snapshot: &TreeSnapshot, file: &CryptoParams) -> Result<Self> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(snapshot).map_err(|e| Error::MalformedInput(e.to_string()))?,
        );
        let blob = crypto::encrypt(file.key(), Some(plaintext.as_slice()), file.last_modified());
        Ok(Self {
            salt: STANDARD.encode(file.salt()),
            rounds: file.rounds(),
            modified: file.last_modified(),
            iv: blob.iv_base64(),
            data: blob.data_base64(),
        })
    }

    /// Derive the file-tier parameters from the header and `password`.
    pub fn params(&self, password: &str) -> Result<CryptoParams> {
        let salt = STANDARD
            .decode(&self.salt)
            .map_err(|e| Error::MalformedInput(format!("invalid salt: {}", e)))?;
        Ok(CryptoParams::derive(password, salt, self.rounds, self.modified)?)
    }

    /// Decrypt the blob. A wrong key shows up as a decryption failure even
    /// when the padding happens to check out.
    pub fn open(&self, file: &CryptoParams) -> Result<TreeSnapshot> {
        let blob = EncryptedValue::from_base64(&self.iv, &self.data, self.modified)
            .ok_or_else(|| Error::MalformedInput("invalid iv or data".to_string()))?;
        let plaintext = Zeroizing::new(crypto::decrypt(file.key(), &blob)?);
        let snapshot: TreeSnapshot = from_json_unbounded(&plaintext)
            .map_err(|_| Error::Crypto(CryptoError::Decryption))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::MalformedInput(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IV_LEN;

    fn identity(v: &EncryptedValue) -> Result<EncryptedValue> {
        Ok(v.clone())
    }

    fn all(_: &NodeTree, _: NodeIdx) -> bool {
        true
    }

    fn sample_tree() -> NodeTree {
        let mut tree = NodeTree::new();
        let root = tree.root();
        let value = EncryptedValue::new([3; IV_LEN], vec![9; 16], 100);
        let mail = tree
            .add_child(root, DatabaseNode::new("mail", None, 50))
            .unwrap();
        tree.add_child(mail, DatabaseNode::new("alice", Some(value), 100))
            .unwrap();
        tree.set_tombstone(mail, Uuid::new_v4(), 120).unwrap();
        tree
    }

    #[test]
    fn capture_restore_preserves_structure() {
        let tree = sample_tree();
        let record = NodeRecord::capture(&tree, tree.root(), &mut identity, &all).unwrap();
        assert_eq!(record.count(), 3);

        let restored = record.restore(&mut identity).unwrap();
        assert_eq!(restored.len(), 3);

        let alice = restored.find_path(&["mail", "alice"]).unwrap();
        let original = tree.find_path(&["mail", "alice"]).unwrap();
        assert_eq!(restored[alice].id(), tree[original].id());
        assert_eq!(restored[alice].value(), tree[original].value());
        assert_eq!(restored[alice].last_modified(), 100);

        let mail = restored.find_path(&["mail"]).unwrap();
        assert_eq!(restored[mail].deleted_children().len(), 1);
        assert_eq!(restored[restored.root()].id(), tree[tree.root()].id());
    }

    #[test]
    fn deterministic_serialization() {
        let tree = sample_tree();
        let a = TreeSnapshot::new(NodeRecord::capture(&tree, tree.root(), &mut identity, &all).unwrap());
        let b = TreeSnapshot::new(NodeRecord::capture(&tree, tree.root(), &mut identity, &all).unwrap());
        assert_eq!(a.to_json_pretty().unwrap(), b.to_json_pretty().unwrap());
    }

    #[test]
    fn serialization_format() {
        let tree = sample_tree();
        let snapshot =
            TreeSnapshot::new(NodeRecord::capture(&tree, tree.root(), &mut identity, &all).unwrap());
        let json = snapshot.to_json_pretty().unwrap();
        assert!(json.contains("\"formatVersion\": 1"));
        assert!(json.contains("\"deletedChildren\""));
        assert!(json.contains("\"deleted\": 120"));
        assert!(json.contains("\"iv\""));
        assert!(json.contains("\"data\""));
    }

    #[test]
    fn bare_tombstones_take_node_timestamp() {
        let gone = Uuid::new_v4();
        let json = format!(
            r#"{{
                "formatVersion": 1,
                "root": {{
                    "id": "{}",
                    "modified": 77,
                    "children": [],
                    "deletedChildren": ["{}"]
                }}
            }}"#,
            Uuid::new_v4(),
            gone
        );
        let snapshot = TreeSnapshot::from_json(&json).unwrap();
        let tree = snapshot.root.restore(&mut identity).unwrap();
        assert_eq!(tree[tree.root()].deleted_at(&gone), Some(77));
    }

    #[test]
    fn reject_future_format_version() {
        let json = format!(
            r#"{{"formatVersion": 999, "root": {{"id": "{}", "modified": 0}}}}"#,
            Uuid::new_v4()
        );
        let result = TreeSnapshot::from_json(&json);
        assert_eq!(result, Err(Error::UnsupportedFormat(999)));
    }

    #[test]
    fn duplicate_ids_are_malformed_input() {
        let dup = Uuid::new_v4();
        let json = format!(
            r#"{{"formatVersion": 1, "root": {{"id": "{}", "modified": 0, "children": [
                {{"id": "{dup}", "name": "a", "modified": 1}},
                {{"id": "{dup}", "name": "b", "modified": 1}}
            ]}}}}"#,
            Uuid::new_v4()
        );
        let snapshot = TreeSnapshot::from_json(&json).unwrap();
        let result = snapshot.root.restore(&mut identity);
        assert!(matches!(result, Err(Error::MalformedInput(_))));
    }

    #[test]
    fn live_and_tombstoned_is_malformed_input() {
        let child = Uuid::new_v4();
        let json = format!(
            r#"{{"formatVersion": 1, "root": {{"id": "{}", "modified": 0,
                "children": [{{"id": "{child}", "name": "a", "modified": 1}}],
                "deletedChildren": [{{"id": "{child}", "deleted": 5}}]
            }}}}"#,
            Uuid::new_v4()
        );
        let snapshot = TreeSnapshot::from_json(&json).unwrap();
        assert!(matches!(
            snapshot.root.restore(&mut identity),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn half_a_value_is_malformed_input() {
        let json = format!(
            r#"{{"formatVersion": 1, "root": {{"id": "{}", "modified": 0, "iv": "AAAA"}}}}"#,
            Uuid::new_v4()
        );
        let snapshot = TreeSnapshot::from_json(&json).unwrap();
        assert!(matches!(
            snapshot.root.restore(&mut identity),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn vault_file_seal_open() {
        let file = CryptoParams::generate("pw", 1, 42).unwrap();
        let tree = sample_tree();
        let snapshot =
            TreeSnapshot::new(NodeRecord::capture(&tree, tree.root(), &mut identity, &all).unwrap());

        let sealed = VaultFile::seal(&snapshot, &file).unwrap();
        assert_eq!(sealed.rounds, 1);
        assert_eq!(sealed.modified, 42);

        let json = sealed.to_json().unwrap();
        assert!(json.contains("\"cryptoParams.salt\""));
        assert!(json.contains("\"cryptoParams.rounds\": 1"));
        assert!(json.contains("\"cryptoParams.modified\": 42"));
        assert!(!json.contains("alice"));

        let parsed = VaultFile::from_json(&json).unwrap();
        let params = parsed.params("pw").unwrap();
        assert_eq!(parsed.open(&params).unwrap(), snapshot);
    }

    #[test]
    fn vault_file_wrong_password() {
        let file = CryptoParams::generate("pw", 1, 0).unwrap();
        let tree = sample_tree();
        let snapshot =
            TreeSnapshot::new(NodeRecord::capture(&tree, tree.root(), &mut identity, &all).unwrap());
        let sealed = VaultFile::seal(&snapshot, &file).unwrap();

        let wrong = sealed.params("not the password").unwrap();
        assert_eq!(sealed.open(&wrong), Err(Error::Crypto(CryptoError::Decryption)));
    }

    #[test]
    fn vault_file_rejects_garbage() {
        assert!(matches!(
            VaultFile::from_json("not json"),
            Err(Error::MalformedInput(_))
        ));

        let file = VaultFile {
            salt: "%%%".into(),
            rounds: 1,
            modified: 0,
            iv: String::new(),
            data: String::new(),
        };
        assert!(matches!(file.params("pw"), Err(Error::MalformedInput(_))));
    }
}
