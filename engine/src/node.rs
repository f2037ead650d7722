//! The node tree.
//!
//! Nodes live in an arena owned by [`NodeTree`] and refer to each other by
//! [`NodeIdx`]. A node owns its children through its `children` map; the
//! `parent` index is a back-pointer used for path computation only.
//!
//! Traversal order is depth-first pre-order with siblings visited in
//! ascending id order.

use crate::{value::EncryptedValue, Error, NodeId, Result, Timestamp};
use std::collections::BTreeMap;
use std::ops::Index;
use uuid::Uuid;

/// Handle to a node inside a [`NodeTree`].
///
/// Handles are invalidated when their node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(usize);

/// A node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseNode {
    id: NodeId,
    name: Option<String>,
    parent: Option<NodeIdx>,
    children: BTreeMap<NodeId, NodeIdx>,
    value: Option<EncryptedValue>,
    last_modified: Timestamp,
    deleted_children: BTreeMap<NodeId, Timestamp>,
}

impl DatabaseNode {
    /// Create a detached node with a fresh random id.
    pub fn new(name: impl Into<String>, value: Option<EncryptedValue>, modified: Timestamp) -> Self {
        Self::with_id(Uuid::new_v4(), Some(name.into()), value, modified)
    }

    /// Create a detached node with a known id.
    pub fn with_id(
        id: NodeId,
        name: Option<String>,
        value: Option<EncryptedValue>,
        modified: Timestamp,
    ) -> Self {
        Self {
            id,
            name,
            parent: None,
            children: BTreeMap::new(),
            value,
            last_modified: modified,
            deleted_children: BTreeMap::new(),
        }
    }

    /// Create an unnamed root node.
    pub fn root() -> Self {
        Self::with_id(Uuid::new_v4(), None, None, 0)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<NodeIdx> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn value(&self) -> Option<&EncryptedValue> {
        self.value.as_ref()
    }

    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    /// Live children, in ascending id order.
    pub fn children(&self) -> impl Iterator<Item = (NodeId, NodeIdx)> + '_ {
        self.children.iter().map(|(id, idx)| (*id, *idx))
    }

    pub fn child(&self, id: &NodeId) -> Option<NodeIdx> {
        self.children.get(id).copied()
    }

    pub fn has_child(&self, id: &NodeId) -> bool {
        self.children.contains_key(id)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Tombstones: ids of deleted children with their deletion time.
    pub fn deleted_children(&self) -> &BTreeMap<NodeId, Timestamp> {
        &self.deleted_children
    }

    pub fn deleted_at(&self, id: &NodeId) -> Option<Timestamp> {
        self.deleted_children.get(id).copied()
    }

    /// Replace the value; the node's timestamp follows the value's.
    pub fn set_value(&mut self, value: Option<EncryptedValue>, modified: Timestamp) {
        self.value = value;
        self.last_modified = modified;
    }

    pub fn rename(&mut self, name: impl Into<String>, modified: Timestamp) {
        self.name = Some(name.into());
        self.last_modified = modified;
    }

    /// Take over another copy's name, value and timestamp.
    pub(crate) fn overwrite(
        &mut self,
        name: Option<String>,
        value: Option<EncryptedValue>,
        modified: Timestamp,
    ) {
        self.name = name;
        self.value = value;
        self.last_modified = modified;
    }

    /// Move the timestamp without touching name or value.
    pub(crate) fn set_last_modified(&mut self, modified: Timestamp) {
        self.last_modified = modified;
    }

    /// Record a tombstone on a detached node, as when loading persisted data.
    ///
    /// Fails if `id` is a live child.
    pub fn add_tombstone(&mut self, id: NodeId, deleted: Timestamp) -> Result<()> {
        if self.children.contains_key(&id) {
            return Err(Error::StructuralInvariant(format!(
                "{} is both a live child and tombstoned",
                id
            )));
        }
        self.deleted_children.insert(id, deleted);
        Ok(())
    }

    fn clear_tombstone(&mut self, id: &NodeId) -> Option<Timestamp> {
        self.deleted_children.remove(id)
    }
}

/// Arena holding one tree of [`DatabaseNode`]s.
#[derive(Debug, Clone)]
pub struct NodeTree {
    slots: Vec<Option<DatabaseNode>>,
    free: Vec<usize>,
    root: NodeIdx,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// A tree holding only an empty root.
    pub fn new() -> Self {
        Self::with_root(DatabaseNode::root())
    }

    /// A tree whose root is `root`. The root must be detached.
    pub fn with_root(mut root: DatabaseNode) -> Self {
        root.parent = None;
        root.children.clear();
        Self {
            slots: vec![Some(root)],
            free: Vec::new(),
            root: NodeIdx(0),
        }
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    /// The node behind `idx`, or `None` for a stale handle. Indexing with
    /// `tree[idx]` panics instead.
    pub fn get(&self, idx: NodeIdx) -> Option<&DatabaseNode> {
        self.slots.get(idx.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: NodeIdx) -> Option<&mut DatabaseNode> {
        self.slots.get_mut(idx.0).and_then(|s| s.as_mut())
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// A tree always has its root, so it is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn node(&self, idx: NodeIdx) -> Result<&DatabaseNode> {
        self.get(idx)
            .ok_or_else(|| Error::StructuralInvariant(format!("stale node handle {:?}", idx)))
    }

    fn node_mut(&mut self, idx: NodeIdx) -> Result<&mut DatabaseNode> {
        self.get_mut(idx)
            .ok_or_else(|| Error::StructuralInvariant(format!("stale node handle {:?}", idx)))
    }

    fn alloc(&mut self, node: DatabaseNode) -> NodeIdx {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeIdx(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeIdx(self.slots.len() - 1)
            }
        }
    }

    /// Attach a detached node under `parent`.
    ///
    /// Rejects an id that is already a live child of `parent`. A tombstone for
    /// the same id is cleared, since a child is never both live and deleted.
    pub fn add_child(&mut self, parent: NodeIdx, mut node: DatabaseNode) -> Result<NodeIdx> {
        if !node.children.is_empty() {
            return Err(Error::StructuralInvariant(
                "only detached nodes without children can be attached".to_string(),
            ));
        }
        let id = node.id;
        if self.node(parent)?.has_child(&id) {
            return Err(Error::DuplicateId(id));
        }

        node.parent = Some(parent);
        let idx = self.alloc(node);

        let parent_node = self.node_mut(parent)?;
        parent_node.clear_tombstone(&id);
        parent_node.children.insert(id, idx);
        Ok(idx)
    }

    /// Delete the live child `id` of `parent`, leaving a tombstone stamped
    /// `deleted`. Does nothing and returns `false` if there is no such child.
    pub fn remove_child(&mut self, parent: NodeIdx, id: &NodeId, deleted: Timestamp) -> bool {
        let Some(parent_node) = self.get_mut(parent) else {
            return false;
        };
        let Some(child) = parent_node.children.remove(id) else {
            return false;
        };
        parent_node.deleted_children.insert(*id, deleted);
        self.release(child);
        true
    }

    /// Set or overwrite the tombstone for `id` under `parent`.
    pub fn set_tombstone(&mut self, parent: NodeIdx, id: NodeId, deleted: Timestamp) -> Result<()> {
        self.node_mut(parent)?.add_tombstone(id, deleted)
    }

    /// Free a detached subtree's slots.
    fn release(&mut self, idx: NodeIdx) {
        let mut stack = vec![idx];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.slots.get_mut(next.0).and_then(|s| s.take()) {
                stack.extend(node.children.values().copied());
                self.free.push(next.0);
            }
        }
    }

    /// First direct child of `parent` named `name`. Names are not unique.
    pub fn child_by_name(&self, parent: NodeIdx, name: &str) -> Option<NodeIdx> {
        let parent = self.get(parent)?;
        parent
            .children
            .values()
            .copied()
            .find(|idx| self.get(*idx).and_then(|n| n.name()) == Some(name))
    }

    /// Follow a chain of names from the root.
    pub fn find_path(&self, names: &[&str]) -> Option<NodeIdx> {
        names
            .iter()
            .try_fold(self.root, |idx, name| self.child_by_name(idx, name))
    }

    /// Slash-separated names from the root down to `idx`. The root itself is `/`.
    pub fn path(&self, idx: NodeIdx) -> String {
        let mut names = Vec::new();
        let mut current = self.get(idx);
        while let Some(node) = current {
            let Some(parent) = node.parent else {
                break;
            };
            names.push(match node.name() {
                Some(name) => name.to_string(),
                None => node.id.to_string(),
            });
            current = self.get(parent);
        }

        if names.is_empty() {
            return "/".to_string();
        }
        names.iter().rev().fold(String::new(), |mut acc, name| {
            acc.push('/');
            acc.push_str(name);
            acc
        })
    }

    /// Path of a (possibly not yet existing) child named `name` under `parent`.
    pub fn child_path(&self, parent: NodeIdx, name: Option<&str>, id: &NodeId) -> String {
        let base = self.path(parent);
        let name = name.map(str::to_string).unwrap_or_else(|| id.to_string());
        if base == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", base, name)
        }
    }

    /// Every node of the subtree at `from`, depth-first pre-order.
    pub fn walk(&self, from: NodeIdx) -> Vec<NodeIdx> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(idx) = stack.pop() {
            let Some(node) = self.get(idx) else {
                continue;
            };
            out.push(idx);
            stack.extend(node.children.values().rev().copied());
        }
        out
    }
}

/// # Panics
///
/// Panics if `idx` is stale, i.e. its node has been removed. Use
/// [`NodeTree::get`] when a handle may have outlived its node.
impl Index<NodeIdx> for NodeTree {
    type Output = DatabaseNode;

    fn index(&self, idx: NodeIdx) -> &DatabaseNode {
        match self.get(idx) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", idx),
        }
    }
}
