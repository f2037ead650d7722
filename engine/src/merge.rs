//! Merging a remote tree into a local one.
//!
//! Nodes are matched by id, never by name or position. For every pair of
//! matched nodes the merger walks the remote children, then the local-only
//! children, then unions the tombstones:
//!
//! 1. Remote-only children that were never deleted locally are adopted.
//! 2. Remote children deleted locally come back only if the remote copy was
//!    modified after the delete.
//! 3. Children live on both sides keep the newer content. Equal timestamps
//!    with different content are a conflict; the greater plaintext
//!    `(name, value)` wins so that both sides converge on the same result.
//! 4. Local children deleted on the remote go away unless edited after the
//!    delete.
//! 5. Tombstones end up as the union of both sides, keeping the later time.
//!
//! The merge runs against a copy of the local tree and is committed only once
//! every node has been processed, so a failure leaves the local vault as it
//! was.

use crate::{
    database::ChangeEvent, error::Result, Database, DatabaseNode, MergeLog, NodeId, NodeIdx,
    NodeTree,
};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Name of the top-level node holding remote-sync configuration.
pub const REMOTE_SYNC_NODE: &str = "remote-sync";

/// Predicate over `(path, node)`; nodes for which it returns `true` are left
/// out of the merge together with their subtrees.
pub type ExcludeFilter = Box<dyn Fn(&str, &DatabaseNode) -> bool + Send + Sync>;

/// Whether `path` names the top-level remote-sync subtree.
pub fn is_remote_sync(path: &str, _node: &DatabaseNode) -> bool {
    path.strip_prefix('/') == Some(REMOTE_SYNC_NODE)
}

/// Folds a remote [`Database`] into a local one.
#[derive(Default)]
pub struct DatabaseMerger {
    exclude: Option<ExcludeFilter>,
}

impl fmt::Debug for DatabaseMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseMerger")
            .field("exclude", &self.exclude.is_some())
            .finish()
    }
}

impl DatabaseMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave out every node matching `filter`.
    pub fn with_exclude<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &DatabaseNode) -> bool + Send + Sync + 'static,
    {
        self.exclude = Some(Box::new(filter));
        self
    }

    /// A merger that leaves the top-level remote-sync subtree alone.
    pub fn excluding_remote_sync() -> Self {
        Self::new().with_exclude(is_remote_sync)
    }

    /// Merge `remote` into `local` in place and report every decision.
    ///
    /// Values are compared by plaintext, each side decrypted with its own
    /// memory key; adopted values are re-encrypted under `local`'s key. Any
    /// decryption failure aborts the whole merge and `local` is untouched.
    #[tracing::instrument(skip_all)]
    pub fn merge(&self, remote: &Database, local: &mut Database) -> Result<MergeLog> {
        let mut run = MergeRun {
            merger: self,
            remote,
            local: &*local,
            tree: local.tree().clone(),
            log: MergeLog::new(),
            remote_lacks: false,
            changed: false,
        };
        let remote_root = remote.root();
        let local_root = run.tree.root();
        run.merge_node(remote_root, local_root)?;

        let MergeRun {
            tree,
            mut log,
            remote_lacks,
            changed,
            ..
        } = run;

        if remote.file_params().is_stale_relative_to(local.file_params()) {
            log.warn(false, "/", "remote copy uses older crypto parameters");
            log.mark_remote_out_of_date();
        }
        if remote_lacks {
            log.mark_remote_out_of_date();
        }

        if changed {
            log.mark_local_changed();
            local.replace_tree(tree);
        }
        local.notify(ChangeEvent::Merged { entries: log.len() });
        info!(
            entries = log.len(),
            conflicts = log.has_conflicts(),
            remote_out_of_date = log.remote_out_of_date(),
            local_changed = changed,
            "merge committed"
        );
        Ok(log)
    }
}

/// State of one merge in progress.
struct MergeRun<'a> {
    merger: &'a DatabaseMerger,
    remote: &'a Database,
    local: &'a Database,
    /// Working copy of the local tree
    tree: NodeTree,
    log: MergeLog,
    /// Set when the merged tree holds something the remote copy does not
    remote_lacks: bool,
    /// Set on the first mutation of `tree`
    changed: bool,
}

impl MergeRun<'_> {
    fn note(&mut self, path: String, text: &str) {
        debug!(path = %path, text, "merge decision");
        self.log.info(true, path, text);
    }

    fn conflict(&mut self, path: String, text: String) {
        warn!(path = %path, text = %text, "merge conflict");
        self.log.conflict(true, path, text);
    }

    fn excluded(&self, path: &str, node: &DatabaseNode) -> bool {
        let excluded = self.merger.exclude.as_ref().is_some_and(|f| f(path, node));
        if excluded {
            debug!(path, "excluded from merge");
        }
        excluded
    }

    fn merge_node(&mut self, remote_idx: NodeIdx, local_idx: NodeIdx) -> Result<()> {
        let remote = self.remote;
        let rtree = remote.tree();
        let rnode = &rtree[remote_idx];

        for (id, rchild) in rnode.children() {
            if self.excluded(&rtree.path(rchild), &rtree[rchild]) {
                continue;
            }
            let local_child = self.tree[local_idx].child(&id);
            let tombstone = self.tree[local_idx].deleted_at(&id);
            match (local_child, tombstone) {
                (Some(lchild), _) => {
                    if self.excluded(&self.tree.path(lchild), &self.tree[lchild]) {
                        continue;
                    }
                    self.merge_content(rchild, lchild)?;
                    self.merge_node(rchild, lchild)?;
                }
                (None, Some(deleted)) => {
                    let path = self.tree.child_path(local_idx, rtree[rchild].name(), &id);
                    if rtree[rchild].last_modified() > deleted {
                        self.adopt(local_idx, rchild)?;
                        self.conflict(
                            path,
                            "resurrected, remote edit newer than local delete".to_string(),
                        );
                    } else {
                        self.note(path, "delete preserved");
                        self.remote_lacks = true;
                    }
                }
                (None, None) => {
                    let idx = self.adopt(local_idx, rchild)?;
                    let path = self.tree.path(idx);
                    self.note(path, "added");
                }
            }
        }

        let local_only: Vec<(NodeId, NodeIdx)> = self.tree[local_idx]
            .children()
            .filter(|(id, _)| !rnode.has_child(id))
            .collect();
        for (id, lchild) in local_only {
            let path = self.tree.path(lchild);
            if self.excluded(&path, &self.tree[lchild]) {
                continue;
            }
            let modified = self.tree[lchild].last_modified();
            match rnode.deleted_at(&id) {
                Some(deleted) if deleted >= modified => {
                    self.tree.remove_child(local_idx, &id, deleted);
                    self.changed = true;
                    self.note(path, "deleted on remote");
                }
                Some(_) => {
                    self.conflict(path, "kept, local edit newer than remote delete".to_string());
                    self.remote_lacks = true;
                }
                None => {
                    self.note(path, "kept, not present on remote");
                    self.remote_lacks = true;
                }
            }
        }

        self.union_tombstones(remote_idx, local_idx)
    }

    fn union_tombstones(&mut self, remote_idx: NodeIdx, local_idx: NodeIdx) -> Result<()> {
        let remote = self.remote;
        let rnode = &remote.tree()[remote_idx];

        for (id, deleted) in rnode.deleted_children() {
            let local_node = &self.tree[local_idx];
            if local_node.has_child(id) {
                continue;
            }
            match local_node.deleted_at(id) {
                Some(local_deleted) if local_deleted >= *deleted => {}
                _ => {
                    self.tree.set_tombstone(local_idx, *id, *deleted)?;
                    self.changed = true;
                }
            }
        }

        let remote_behind = self.tree[local_idx]
            .deleted_children()
            .iter()
            .any(|(id, deleted)| rnode.deleted_at(id).map_or(true, |r| r < *deleted));
        if remote_behind {
            self.remote_lacks = true;
        }
        Ok(())
    }

    /// Compare the content of two matched nodes and keep the winner's.
    fn merge_content(&mut self, remote_idx: NodeIdx, local_idx: NodeIdx) -> Result<()> {
        let remote = self.remote;
        let rnode = &remote.tree()[remote_idx];
        let lnode = &self.tree[local_idx];
        let path = self.tree.path(local_idx);

        let rvalue = plaintext_of(remote, rnode).map_err(|e| e.context(format!("merging {}", path)))?;
        let lvalue =
            plaintext_of(self.local, lnode).map_err(|e| e.context(format!("merging {}", path)))?;

        let theirs = (rnode.name(), rvalue.as_deref().map(Vec::as_slice));
        let ours = (lnode.name(), lvalue.as_deref().map(Vec::as_slice));
        if theirs == ours {
            // Same content: both copies settle on the later timestamp
            let (remote_modified, local_modified) = (rnode.last_modified(), lnode.last_modified());
            match remote_modified.cmp(&local_modified) {
                Ordering::Greater => {
                    if let Some(node) = self.tree.get_mut(local_idx) {
                        node.set_last_modified(remote_modified);
                    }
                    self.changed = true;
                }
                Ordering::Less => self.remote_lacks = true,
                Ordering::Equal => {}
            }
            self.note(path, "unchanged");
            return Ok(());
        }

        let remote_wins = match rnode.last_modified().cmp(&lnode.last_modified()) {
            Ordering::Greater => {
                self.note(path, "updated from remote");
                true
            }
            Ordering::Less => {
                self.note(path, "kept, local newer");
                self.remote_lacks = true;
                false
            }
            Ordering::Equal => {
                let remote_wins = theirs > ours;
                let kept = if remote_wins { "remote" } else { "local" };
                self.conflict(
                    path,
                    format!("same timestamp, different content, {} copy kept", kept),
                );
                if !remote_wins {
                    self.remote_lacks = true;
                }
                remote_wins
            }
        };

        if remote_wins {
            let value = rnode
                .value()
                .map(|v| Database::reencrypt(v, remote.memory_params(), self.local.memory_params()))
                .transpose()?;
            let name = rnode.name().map(str::to_string);
            let modified = rnode.last_modified();
            if let Some(node) = self.tree.get_mut(local_idx) {
                node.overwrite(name, value, modified);
            }
            self.changed = true;
        }
        Ok(())
    }

    /// Copy a remote subtree under `parent`, re-encrypting every value and
    /// skipping excluded descendants.
    fn adopt(&mut self, parent: NodeIdx, remote_idx: NodeIdx) -> Result<NodeIdx> {
        let remote = self.remote;
        let rtree = remote.tree();
        let rnode = &rtree[remote_idx];

        let value = rnode
            .value()
            .map(|v| Database::reencrypt(v, remote.memory_params(), self.local.memory_params()))
            .transpose()
            .map_err(|e| e.context(format!("merging {}", rtree.path(remote_idx))))?;
        let copy = DatabaseNode::with_id(
            rnode.id(),
            rnode.name().map(str::to_string),
            value,
            rnode.last_modified(),
        );
        let idx = self.tree.add_child(parent, copy)?;
        self.changed = true;

        for (_, child) in rnode.children() {
            if !self.excluded(&rtree.path(child), &rtree[child]) {
                self.adopt(idx, child)?;
            }
        }
        for (id, deleted) in rnode.deleted_children() {
            self.tree.set_tombstone(idx, *id, *deleted)?;
        }
        Ok(idx)
    }
}

fn plaintext_of(db: &Database, node: &DatabaseNode) -> Result<Option<Zeroizing<Vec<u8>>>> {
    node.value()
        .map(|v| db.decrypt(v).map(Zeroizing::new))
        .transpose()
}
