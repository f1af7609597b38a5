//! In-memory materialized tree for one sketch aggregate.
//!
//! The tree is stored as an arena: [`Tree::nodes`] maps node id to
//! [`TreeNode`], and nodes reference their parent and children by id. This
//! keeps every node in exactly one place (the index invariant of the data
//! model) while making detach/reattach and ancestor walks cheap. `BTreeMap`s
//! and ordered child lists make replays of the same log produce equal,
//! identically serialized trees.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP methods a node can carry request/response data for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Patch,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Get => "get",
            Method::Put => "put",
            Method::Post => "post",
            Method::Delete => "delete",
            Method::Patch => "patch",
        };
        f.write_str(name)
    }
}

/// One node of a sketch tree.
///
/// `full_path` is not independently authoritative: it is recomputed from the
/// root via accumulated names whenever a name changes or the node moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Unique node id within the aggregate.
    pub id: String,
    /// Display name; contributes one path segment.
    pub name: String,
    /// Derived absolute path (`"/"` for the root).
    pub full_path: String,
    /// Parent node id; `None` only for the root.
    pub parent: Option<String>,
    /// Child node ids in insertion order.
    pub children: Vec<String>,
    /// Per-method request/response data, merged field-by-field over time.
    pub operations: BTreeMap<Method, Value>,
}

impl TreeNode {
    /// Create a node with no parent, children, or operation data.
    pub fn new(id: impl Into<String>, name: impl Into<String>, full_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            full_path: full_path.into(),
            parent: None,
            children: Vec::new(),
            operations: BTreeMap::new(),
        }
    }
}

/// The materialized projection state for one aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    /// Id of the root node, if one has been added yet.
    pub root: Option<String>,
    /// Index of every live node, keyed by id.
    pub nodes: BTreeMap<String, TreeNode>,
    /// Removed subtree roots, retained for auditability.
    pub deleted: BTreeMap<String, TreeNode>,
    /// Sequence number of the last event folded into this snapshot.
    pub last_applied: u64,
}

impl Tree {
    /// Look up a live node by id.
    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Returns the root node, if any.
    pub fn root_node(&self) -> Option<&TreeNode> {
        self.root.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// Returns `true` if `id` is a live node.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no node has been added yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk `node`'s ancestor chain up to the root, returning `true` if
    /// `ancestor` appears on it. A node is not its own ancestor.
    pub fn is_ancestor(&self, ancestor: &str, node: &str) -> bool {
        let mut current = self.nodes.get(node).and_then(|n| n.parent.as_deref());
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(id).and_then(|n| n.parent.as_deref());
        }
        false
    }

    /// Ids of `id` and every descendant, in depth-first order.
    ///
    /// Returns an empty vector if `id` is not a live node.
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        if !self.nodes.contains_key(id) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut stack = vec![id.to_owned()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                // Reverse so children pop in insertion order.
                stack.extend(node.children.iter().rev().cloned());
            }
            out.push(current);
        }
        out
    }
}

/// Join a parent path and a child name into the child's full path.
///
/// The root's `"/"` contributes no extra separator: a child of the root
/// named `a` gets `/a`, and its child `b` gets `/a/b`.
pub(crate) fn child_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{name}")
    } else {
        format!("{parent_path}/{name}")
    }
}

/// Recursively merge `patch` into `target`.
///
/// Object values merge key-by-key; any other value (including `null`)
/// overwrites. Unspecified fields keep their prior values, which gives
/// `node_updated_data` its merge-not-replace semantics.
pub(crate) fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                merge_json(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, _) => *slot = patch.clone(),
    }
}
