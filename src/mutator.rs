//! The pure event → tree transition function.
//!
//! [`apply`] takes one event and one tree snapshot and produces a new
//! snapshot or a [`MutateError`]. It is stateless and never touches the
//! input: callers hold the old snapshot untouched on failure, which is what
//! lets the applier skip a structurally invalid event without corrupting
//! the projection.

use crate::error::MutateError;
use crate::event::{Event, EventKind, NewNode};
use crate::tree::{Method, Tree, TreeNode, child_path, merge_json};

/// Apply a single event to a tree snapshot, producing the next snapshot.
///
/// Deterministic: the same event applied to the same snapshot always yields
/// the same tree, which is what makes replay idempotent. `last_applied` is
/// left for the caller to stamp; the mutator only performs the structural
/// change.
///
/// # Errors
///
/// Returns a [`MutateError`] when the event's precondition fails; the input
/// tree is unaffected.
pub fn apply(tree: &Tree, event: &Event) -> Result<Tree, MutateError> {
    let mut next = tree.clone();
    match &event.kind {
        EventKind::NodeAdded { node, parent_id } => {
            add_node(&mut next, node, parent_id.as_deref())?;
        }
        EventKind::NodeUpdatedFields { node_id, name } => {
            update_fields(&mut next, node_id, name.as_deref())?;
        }
        EventKind::NodeUpdatedData {
            node_id,
            method,
            data,
        } => {
            update_data(&mut next, node_id, *method, data)?;
        }
        EventKind::NodeMoved {
            source_id,
            target_id,
        } => {
            move_node(&mut next, source_id.as_deref(), target_id.as_deref())?;
        }
        EventKind::NodeDeleted { node_id } => {
            delete_node(&mut next, node_id.as_deref())?;
        }
    }
    Ok(next)
}

/// Insert a new node under `parent_id`, or at the root when absent.
///
/// The first parentless add becomes the root (path `"/"` regardless of
/// name); later parentless adds attach as children of the root.
fn add_node(tree: &mut Tree, new_node: &NewNode, parent_id: Option<&str>) -> Result<(), MutateError> {
    if tree.nodes.contains_key(&new_node.id) {
        return Err(MutateError::DuplicateNode(new_node.id.clone()));
    }

    let effective_parent = match parent_id {
        Some(pid) => {
            if !tree.nodes.contains_key(pid) {
                return Err(MutateError::UnknownParent(pid.to_owned()));
            }
            Some(pid.to_owned())
        }
        None => tree.root.clone(),
    };

    let mut node = TreeNode::new(new_node.id.clone(), new_node.name.clone(), "/");
    node.operations = new_node.operations.clone();

    match effective_parent {
        Some(pid) => {
            // Compute the child path before taking the mutable borrow.
            let parent_path = tree
                .nodes
                .get(&pid)
                .map(|p| p.full_path.clone())
                .ok_or_else(|| MutateError::UnknownParent(pid.clone()))?;
            node.full_path = child_path(&parent_path, &new_node.name);
            node.parent = Some(pid.clone());
            if let Some(parent) = tree.nodes.get_mut(&pid) {
                parent.children.push(new_node.id.clone());
            }
        }
        None => {
            tree.root = Some(new_node.id.clone());
        }
    }

    tree.nodes.insert(new_node.id.clone(), node);
    Ok(())
}

/// Rename a node, cascading the path recomputation through its subtree.
fn update_fields(tree: &mut Tree, node_id: &str, name: Option<&str>) -> Result<(), MutateError> {
    if !tree.nodes.contains_key(node_id) {
        return Err(MutateError::UnknownNode(node_id.to_owned()));
    }

    if let Some(new_name) = name {
        if tree.root.as_deref() == Some(node_id) {
            return Err(MutateError::RootRenameForbidden);
        }
        if let Some(node) = tree.nodes.get_mut(node_id) {
            node.name = new_name.to_owned();
        }
        recompute_paths(tree, node_id);
    }

    Ok(())
}

/// Merge `data` into the node's entry for `method`.
fn update_data(
    tree: &mut Tree,
    node_id: &str,
    method: Method,
    data: &serde_json::Value,
) -> Result<(), MutateError> {
    let node = tree
        .nodes
        .get_mut(node_id)
        .ok_or_else(|| MutateError::UnknownNode(node_id.to_owned()))?;
    let slot = node
        .operations
        .entry(method)
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    merge_json(slot, data);
    Ok(())
}

/// Detach `source` from its parent and reattach it under `target` (or the
/// root when `target` is absent), then recompute the subtree's paths.
fn move_node(
    tree: &mut Tree,
    source_id: Option<&str>,
    target_id: Option<&str>,
) -> Result<(), MutateError> {
    let source = source_id.ok_or(MutateError::MissingSourceOrTarget)?;
    if tree.root.as_deref() == Some(source) {
        return Err(MutateError::RootMoveForbidden);
    }
    if !tree.nodes.contains_key(source) {
        return Err(MutateError::MissingSourceOrTarget);
    }

    // Resolve the new parent: an explicit target, or the root for "move to
    // top level".
    let new_parent = match target_id {
        Some(target) => {
            if !tree.nodes.contains_key(target) {
                return Err(MutateError::MissingSourceOrTarget);
            }
            // Walking target's ancestor chain and comparing to source
            // catches every cycle, including target == source.
            if target == source || tree.is_ancestor(source, target) {
                return Err(MutateError::CircularMove {
                    source: source.to_owned(),
                    target: target.to_owned(),
                });
            }
            target.to_owned()
        }
        None => tree
            .root
            .clone()
            .ok_or(MutateError::MissingSourceOrTarget)?,
    };

    // Detach from the old parent's child list.
    let old_parent = tree.nodes.get(source).and_then(|n| n.parent.clone());
    if let Some(pid) = old_parent
        && let Some(parent) = tree.nodes.get_mut(&pid)
    {
        parent.children.retain(|c| c != source);
    }

    // Reattach under the new parent.
    if let Some(parent) = tree.nodes.get_mut(&new_parent) {
        parent.children.push(source.to_owned());
    }
    if let Some(node) = tree.nodes.get_mut(source) {
        node.parent = Some(new_parent);
    }

    recompute_paths(tree, source);
    Ok(())
}

/// Remove a node and its entire subtree, retaining the subtree root in the
/// deleted index.
fn delete_node(tree: &mut Tree, node_id: Option<&str>) -> Result<(), MutateError> {
    let id = node_id.ok_or(MutateError::MissingNodeId)?;
    if tree.root.as_deref() == Some(id) {
        return Err(MutateError::RootDeleteForbidden);
    }
    if !tree.nodes.contains_key(id) {
        return Err(MutateError::UnknownNode(id.to_owned()));
    }

    let parent = tree.nodes.get(id).and_then(|n| n.parent.clone());
    if let Some(pid) = parent
        && let Some(parent_node) = tree.nodes.get_mut(&pid)
    {
        parent_node.children.retain(|c| c != id);
    }

    let subtree = tree.subtree_ids(id);
    let mut removed_root = None;
    for node_id in subtree {
        if let Some(node) = tree.nodes.remove(&node_id) {
            if node_id == id {
                removed_root = Some(node);
            }
        }
    }
    if let Some(node) = removed_root {
        tree.deleted.insert(id.to_owned(), node);
    }

    Ok(())
}

/// Recompute `full_path` for `start` and every descendant by re-deriving
/// from the (unchanged) parent path downward.
fn recompute_paths(tree: &mut Tree, start: &str) {
    let mut stack = vec![start.to_owned()];
    while let Some(id) = stack.pop() {
        let derived = match tree.nodes.get(&id) {
            Some(node) => match node.parent.as_deref() {
                Some(pid) => tree
                    .nodes
                    .get(pid)
                    .map(|p| child_path(&p.full_path, &node.name)),
                // The root's path is fixed.
                None => Some("/".to_owned()),
            },
            None => None,
        };
        if let Some(path) = derived
            && let Some(node) = tree.nodes.get_mut(&id)
        {
            node.full_path = path;
            stack.extend(node.children.iter().cloned());
        }
    }
}
