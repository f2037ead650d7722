//! The database: a node tree plus the two crypto tiers that protect it.

use crate::{
    crypto,
    error::Result,
    node::DatabaseNode,
    now_millis,
    snapshot::{NodeRecord, TreeSnapshot, VaultFile},
    CryptoParams, EncryptedValue, Error, NodeId, NodeIdx, NodeTree, Timestamp,
};
use std::sync::{mpsc, Arc};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Notification sent to subscribers when the tree changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added { path: String },
    Removed { path: String },
    Modified { path: String },
    /// A merge was committed; `entries` is the length of its log
    Merged { entries: usize },
}

/// One open vault: the tree and its memory and file crypto parameters.
///
/// Every value in the tree is encrypted with the memory key. The file key is
/// used only by [`Database::to_vault_json`] and [`Database::from_vault_json`].
#[derive(Debug)]
pub struct Database {
    tree: NodeTree,
    memory: Arc<CryptoParams>,
    file: Arc<CryptoParams>,
    subscribers: Vec<mpsc::Sender<ChangeEvent>>,
}

impl Database {
    /// Create an empty vault, deriving fresh keys for both tiers.
    pub fn new(password: &str, memory_rounds: u32, file_rounds: u32) -> Result<Self> {
        let now = now_millis();
        let memory = CryptoParams::generate(password, memory_rounds, now)?;
        let file = CryptoParams::generate(password, file_rounds, now)?;
        Ok(Self::with_params(Arc::new(memory), Arc::new(file)))
    }

    /// An empty vault using existing parameters.
    pub fn with_params(memory: Arc<CryptoParams>, file: Arc<CryptoParams>) -> Self {
        Self::with_tree(NodeTree::new(), memory, file)
    }

    pub(crate) fn with_tree(
        tree: NodeTree,
        memory: Arc<CryptoParams>,
        file: Arc<CryptoParams>,
    ) -> Self {
        Self {
            tree,
            memory,
            file,
            subscribers: Vec::new(),
        }
    }

    /// An empty vault sharing `other`'s keys, so that trees parsed into it
    /// can be merged into `other`.
    pub fn create_like(other: &Database) -> Self {
        Self::with_params(Arc::clone(&other.memory), Arc::clone(&other.file))
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn root(&self) -> NodeIdx {
        self.tree.root()
    }

    pub fn node(&self, idx: NodeIdx) -> Option<&DatabaseNode> {
        self.tree.get(idx)
    }

    pub fn memory_params(&self) -> &Arc<CryptoParams> {
        &self.memory
    }

    pub fn file_params(&self) -> &Arc<CryptoParams> {
        &self.file
    }

    /// Encrypt with the memory key, stamped with the current time.
    pub fn encrypt(&self, plaintext: Option<&[u8]>) -> EncryptedValue {
        self.encrypt_at(plaintext, now_millis())
    }

    /// Encrypt with the memory key and an explicit timestamp.
    pub fn encrypt_at(&self, plaintext: Option<&[u8]>, modified: Timestamp) -> EncryptedValue {
        crypto::encrypt(self.memory.key(), plaintext, modified)
    }

    /// Decrypt a value encrypted with the memory key.
    pub fn decrypt(&self, value: &EncryptedValue) -> Result<Vec<u8>> {
        Ok(crypto::decrypt(self.memory.key(), value)?)
    }

    /// Decrypted value of a node, if it has one.
    pub fn value_of(&self, idx: NodeIdx) -> Result<Option<Vec<u8>>> {
        let node = self.existing(idx)?;
        node.value().map(|v| self.decrypt(v)).transpose()
    }

    /// Add a named child holding `plaintext`.
    pub fn add_entry(&mut self, parent: NodeIdx, name: &str, plaintext: &[u8]) -> Result<NodeIdx> {
        self.add_entry_at(parent, name, Some(plaintext), now_millis())
    }

    /// Add a named child without a value, used to group other entries.
    pub fn add_group(&mut self, parent: NodeIdx, name: &str) -> Result<NodeIdx> {
        self.add_entry_at(parent, name, None, now_millis())
    }

    /// Add a named child with an explicit modification time.
    pub fn add_entry_at(
        &mut self,
        parent: NodeIdx,
        name: &str,
        plaintext: Option<&[u8]>,
        modified: Timestamp,
    ) -> Result<NodeIdx> {
        let value = plaintext.map(|p| self.encrypt_at(Some(p), modified));
        self.attach(parent, DatabaseNode::new(name, value, modified))
    }

    /// Attach a prepared node whose value, if any, is already encrypted with
    /// this vault's memory key.
    pub fn attach(&mut self, parent: NodeIdx, node: DatabaseNode) -> Result<NodeIdx> {
        let idx = self.tree.add_child(parent, node)?;
        self.notify(ChangeEvent::Added {
            path: self.tree.path(idx),
        });
        Ok(idx)
    }

    /// Replace a node's value.
    pub fn set_value(&mut self, idx: NodeIdx, plaintext: &[u8]) -> Result<()> {
        self.set_value_at(idx, plaintext, now_millis())
    }

    pub fn set_value_at(&mut self, idx: NodeIdx, plaintext: &[u8], modified: Timestamp) -> Result<()> {
        self.existing(idx)?;
        let value = self.encrypt_at(Some(plaintext), modified);
        if let Some(node) = self.tree.get_mut(idx) {
            node.set_value(Some(value), modified);
        }
        self.notify(ChangeEvent::Modified {
            path: self.tree.path(idx),
        });
        Ok(())
    }

    pub fn rename(&mut self, idx: NodeIdx, name: &str) -> Result<()> {
        let node = self
            .tree
            .get_mut(idx)
            .ok_or_else(|| Error::StructuralInvariant(format!("stale node handle {:?}", idx)))?;
        node.rename(name, now_millis());
        self.notify(ChangeEvent::Modified {
            path: self.tree.path(idx),
        });
        Ok(())
    }

    /// Delete the child `id` of `parent`, leaving a tombstone stamped now.
    /// Returns `false` if there was no such live child.
    pub fn remove(&mut self, parent: NodeIdx, id: &NodeId) -> bool {
        self.remove_at(parent, id, now_millis())
    }

    pub fn remove_at(&mut self, parent: NodeIdx, id: &NodeId, deleted: Timestamp) -> bool {
        let path = match self.tree.get(parent).and_then(|p| p.child(id)) {
            Some(child) => self.tree.path(child),
            None => return false,
        };
        let removed = self.tree.remove_child(parent, id, deleted);
        if removed {
            self.notify(ChangeEvent::Removed { path });
        }
        removed
    }

    /// Serialize to the at-rest form.
    ///
    /// Every value is re-encrypted from the memory key to the file key, then
    /// the whole tree is encrypted once more as a single blob.
    pub fn to_vault_json(&self) -> Result<String> {
        let (memory, file) = (&self.memory, &self.file);
        let root = NodeRecord::capture(
            &self.tree,
            self.tree.root(),
            &mut |v: &EncryptedValue| Self::reencrypt(v, memory, file),
            &|_: &NodeTree, _: NodeIdx| true,
        )?;
        let json = VaultFile::seal(&TreeSnapshot::new(root), file)?.to_json()?;
        info!(nodes = self.tree.len(), "serialized vault");
        Ok(json)
    }

    /// Parse an at-rest vault, deriving the file key from `password` and the
    /// stored header. Values are re-encrypted under `memory`.
    pub fn from_vault_json(json: &str, password: &str, memory: Arc<CryptoParams>) -> Result<Self> {
        let vault = VaultFile::from_json(json)?;
        let file = Arc::new(vault.params(password)?);
        debug!(rounds = file.rounds(), "derived file key");

        let snapshot = vault.open(&file)?;
        let tree = snapshot
            .root
            .restore(&mut |v: &EncryptedValue| Self::reencrypt(v, &file, &memory))?;
        info!(nodes = tree.len(), "loaded vault");
        Ok(Self::with_tree(tree, memory, file))
    }

    /// Parse an at-rest vault with fresh memory-tier parameters.
    pub fn open_vault_json(json: &str, password: &str, memory_rounds: u32) -> Result<Self> {
        let memory = CryptoParams::generate(password, memory_rounds, now_millis())?;
        Self::from_vault_json(json, password, Arc::new(memory))
    }

    /// Parse an at-rest vault into `other`'s memory tier so that it can be
    /// merged into `other`. The file tier comes from the parsed header.
    pub fn load_like(json: &str, password: &str, other: &Database) -> Result<Self> {
        Self::from_vault_json(json, password, Arc::clone(&other.memory))
    }

    /// Follow a chain of names from the root.
    pub fn find_path(&self, names: &[&str]) -> Option<NodeIdx> {
        self.tree.find_path(names)
    }

    pub fn path(&self, idx: NodeIdx) -> String {
        self.tree.path(idx)
    }

    /// Every node, depth-first from the root.
    pub fn walk(&self) -> Vec<NodeIdx> {
        self.tree.walk(self.tree.root())
    }

    /// Receive a [`ChangeEvent`] for every later mutation.
    pub fn subscribe(&mut self) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn notify(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Swap in a tree built elsewhere (a committed merge or a load).
    pub(crate) fn replace_tree(&mut self, tree: NodeTree) {
        self.tree = tree;
    }

    /// Move one value from one tier's key to another's, keeping its timestamp.
    pub(crate) fn reencrypt(
        value: &EncryptedValue,
        from: &CryptoParams,
        to: &CryptoParams,
    ) -> Result<EncryptedValue> {
        let plaintext = Zeroizing::new(crypto::decrypt(from.key(), value)?);
        Ok(crypto::encrypt(to.key(), Some(plaintext.as_slice()), value.modified()))
    }

    fn existing(&self, idx: NodeIdx) -> Result<&DatabaseNode> {
        self.tree
            .get(idx)
            .ok_or_else(|| Error::StructuralInvariant(format!("stale node handle {:?}", idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::new("pw", 1, 1).unwrap()
    }

    #[test]
    fn encrypt_decrypt_with_memory_key() {
        let db = test_db();
        let value = db.encrypt(Some(&b"secret"[..]));
        assert_eq!(db.decrypt(&value).unwrap(), b"secret");
        assert!(db.decrypt(&db.encrypt(None)).unwrap().is_empty());
    }

    #[test]
    fn file_key_cannot_read_memory_values() {
        let db = test_db();
        let value = db.encrypt(Some(&b"secret"[..]));
        let other = crypto::decrypt(db.file_params().key(), &value);
        assert_ne!(other.ok(), Some(b"secret".to_vec()));
    }

    #[test]
    fn create_like_shares_keys_with_new_root() {
        let mut db = test_db();
        let root = db.root();
        db.add_entry(root, "mail", b"x").unwrap();

        let like = Database::create_like(&db);
        assert!(Arc::ptr_eq(like.memory_params(), db.memory_params()));
        assert!(Arc::ptr_eq(like.file_params(), db.file_params()));
        assert_eq!(like.tree().len(), 1);
        assert_ne!(like.tree()[like.root()].id(), db.tree()[db.root()].id());

        let value = like.encrypt(Some(&b"shared"[..]));
        assert_eq!(db.decrypt(&value).unwrap(), b"shared");
    }

    #[test]
    fn entries_and_groups() {
        let mut db = test_db();
        let root = db.root();
        let mail = db.add_group(root, "mail").unwrap();
        let alice = db.add_entry_at(mail, "alice", Some(&b"pw1"[..]), 100).unwrap();

        assert_eq!(db.value_of(mail).unwrap(), None);
        assert_eq!(db.value_of(alice).unwrap(), Some(b"pw1".to_vec()));
        assert_eq!(db.tree()[alice].last_modified(), 100);
        assert_eq!(db.path(alice), "/mail/alice");

        db.set_value_at(alice, b"pw2", 200).unwrap();
        assert_eq!(db.value_of(alice).unwrap(), Some(b"pw2".to_vec()));
        assert_eq!(db.tree()[alice].last_modified(), 200);

        db.rename(alice, "alice2").unwrap();
        assert_eq!(db.find_path(&["mail", "alice2"]), Some(alice));
    }

    #[test]
    fn remove_leaves_tombstone() {
        let mut db = test_db();
        let root = db.root();
        let idx = db.add_entry(root, "mail", b"x").unwrap();
        let id = db.tree()[idx].id();

        assert!(db.remove_at(root, &id, 150));
        assert_eq!(db.tree()[root].deleted_at(&id), Some(150));
        assert!(!db.remove(root, &id));
    }

    #[test]
    fn subscribers_receive_events() {
        let mut db = test_db();
        let rx = db.subscribe();
        let root = db.root();
        let idx = db.add_entry(root, "mail", b"x").unwrap();
        db.set_value(idx, b"y").unwrap();
        let id = db.tree()[idx].id();
        db.remove(root, &id);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ChangeEvent::Added { path: "/mail".into() },
                ChangeEvent::Modified { path: "/mail".into() },
                ChangeEvent::Removed { path: "/mail".into() },
            ]
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut db = test_db();
        drop(db.subscribe());
        let root = db.root();
        db.add_entry(root, "mail", b"x").unwrap();
        assert!(db.subscribers.is_empty());
    }

    #[test]
    fn vault_json_roundtrip() {
        let mut db = test_db();
        let root = db.root();
        let mail = db.add_group(root, "mail").unwrap();
        let alice = db.add_entry_at(mail, "alice", Some(&b"pw1"[..]), 100).unwrap();
        let gone = db.add_entry(mail, "bob", b"pw2").unwrap();
        let gone_id = db.tree()[gone].id();
        db.remove_at(mail, &gone_id, 150);

        let json = db.to_vault_json().unwrap();
        assert!(!json.contains("alice"));

        let loaded = Database::open_vault_json(&json, "pw", 1).unwrap();
        let loaded_alice = loaded.find_path(&["mail", "alice"]).unwrap();
        assert_eq!(loaded.value_of(loaded_alice).unwrap(), Some(b"pw1".to_vec()));
        assert_eq!(loaded.tree()[loaded_alice].id(), db.tree()[alice].id());
        assert_eq!(loaded.tree()[loaded_alice].last_modified(), 100);

        let loaded_mail = loaded.find_path(&["mail"]).unwrap();
        assert_eq!(loaded.tree()[loaded_mail].deleted_at(&gone_id), Some(150));
        assert_eq!(loaded.file_params().salt(), db.file_params().salt());
    }

    #[test]
    fn vault_json_wrong_password() {
        let db = test_db();
        let json = db.to_vault_json().unwrap();
        let result = Database::open_vault_json(&json, "wrong", 1);
        assert_eq!(result.err(), Some(Error::Crypto(crypto::CryptoError::Decryption)));
    }

    #[test]
    fn load_like_shares_memory_key() {
        let mut db = test_db();
        let root = db.root();
        db.add_entry(root, "mail", b"x").unwrap();
        let json = db.to_vault_json().unwrap();

        let loaded = Database::load_like(&json, "pw", &db).unwrap();
        assert!(Arc::ptr_eq(loaded.memory_params(), db.memory_params()));
        let idx = loaded.find_path(&["mail"]).unwrap();
        let value = loaded.tree()[idx].value().unwrap();
        assert_eq!(db.decrypt(value).unwrap(), b"x");
    }

    #[test]
    fn stale_handle_is_an_error() {
        let mut db = test_db();
        let root = db.root();
        let idx = db.add_entry(root, "mail", b"x").unwrap();
        let id = db.tree()[idx].id();
        db.remove(root, &id);

        assert!(matches!(db.value_of(idx), Err(Error::StructuralInvariant(_))));
        assert!(db.set_value(idx, b"y").is_err());
    }
}
