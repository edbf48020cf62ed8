use std::collections::HashMap;
use std::fmt;

use generational_arena::{Arena, Index};
use tracing::instrument;

use crate::domain::entities::{AttributeNode, NodeId};
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::path;

/// Subtree node in the arena.
#[derive(Debug)]
pub struct TreeNode {
    /// The attribute node payload
    pub data: AttributeNode,
    /// Index of parent node in the arena, None for the subtree root
    pub parent: Option<Index>,
    /// Indices of child nodes in the arena
    pub children: Vec<Index>,
}

impl fmt::Display for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.data.materialized_path, self.data.node_type)
    }
}

/// Index-addressed copy of one subtree of the attribute hierarchy.
///
/// Structural edits (reparent, rename, cascade delete) load the affected
/// subtree once, recompute it here and write it back as one batch.
#[derive(Debug)]
pub struct TreeArena {
    arena: Arena<TreeNode>,
    root: Option<Index>,
    by_id: HashMap<NodeId, Index>,
}

impl Default for TreeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeArena {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            root: None,
            by_id: HashMap::new(),
        }
    }

    /// Link `root` and its descendants by `parent_id`.
    ///
    /// Every descendant's parent must be `root` or another descendant.
    pub fn from_subtree(root: AttributeNode, mut descendants: Vec<AttributeNode>) -> DomainResult<Self> {
        let mut tree = Self::new();
        tree.insert_node(root, None);

        descendants.sort_by(|a, b| (a.depth, &a.materialized_path).cmp(&(b.depth, &b.materialized_path)));
        for node in descendants {
            let parent_id = node.parent_id.ok_or_else(|| DomainError::BrokenParentLink {
                node: node.id.to_string(),
                parent: "<none>".into(),
            })?;
            let parent = tree.index_of(parent_id).ok_or_else(|| DomainError::BrokenParentLink {
                node: node.id.to_string(),
                parent: parent_id.to_string(),
            })?;
            tree.insert_node(node, Some(parent));
        }
        Ok(tree)
    }

    #[instrument(level = "trace", skip(self, data))]
    pub fn insert_node(&mut self, data: AttributeNode, parent: Option<Index>) -> Index {
        let id = data.id;
        let node = TreeNode {
            data,
            parent,
            children: Vec::new(),
        };
        let node_idx = self.arena.insert(node);
        self.by_id.insert(id, node_idx);

        if let Some(parent_idx) = parent {
            if let Some(parent) = self.arena.get_mut(parent_idx) {
                parent.children.push(node_idx);
            }
        } else {
            self.root = Some(node_idx);
        }

        node_idx
    }

    #[instrument(level = "trace", skip(self))]
    pub fn get_node(&self, idx: Index) -> Option<&TreeNode> {
        self.arena.get(idx)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn get_node_mut(&mut self, idx: Index) -> Option<&mut TreeNode> {
        self.arena.get_mut(idx)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn root(&self) -> Option<Index> {
        self.root
    }

    pub fn index_of(&self, id: NodeId) -> Option<Index> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[instrument(level = "trace", skip(self))]
    pub fn iter(&self) -> TreeIterator {
        TreeIterator::new(self)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn iter_postorder(&self) -> PostOrderIterator {
        PostOrderIterator::new(self)
    }

    /// Place the subtree root under a parent at `parent` (path, depth), or at
    /// the top level for None, and recompute every path and depth below it.
    ///
    /// Parents are visited before children, so each node derives its path
    /// from an already updated parent.
    #[instrument(level = "debug", skip(self))]
    pub fn relocate(&mut self, parent: Option<(&str, u32)>) {
        let order: Vec<Index> = self.iter().map(|(idx, _)| idx).collect();
        for idx in order {
            let anchor = match self.get_node(idx).and_then(|n| n.parent) {
                Some(parent_idx) => self
                    .get_node(parent_idx)
                    .map(|p| (p.data.materialized_path.clone(), p.data.depth)),
                None => parent.map(|(p, d)| (p.to_string(), d)),
            };
            if let Some(node) = self.get_node_mut(idx) {
                match anchor {
                    Some((parent_path, parent_depth)) => {
                        node.data.materialized_path = path::child_path(Some(&parent_path), &node.data.name);
                        node.data.depth = parent_depth + 1;
                    }
                    None => {
                        node.data.materialized_path = path::child_path(None, &node.data.name);
                        node.data.depth = 0;
                    }
                }
            }
        }
    }

    /// Payloads in pre-order (parents first).
    pub fn nodes_preorder(&self) -> Vec<AttributeNode> {
        self.iter().map(|(_, node)| node.data.clone()).collect()
    }

    /// Ids in post-order (children first), the safe order for deletes.
    pub fn ids_postorder(&self) -> Vec<NodeId> {
        self.iter_postorder().map(|(_, node)| node.data.id).collect()
    }
}

pub struct TreeIterator<'a> {
    arena: &'a TreeArena,
    stack: Vec<Index>,
}

impl<'a> TreeIterator<'a> {
    fn new(arena: &'a TreeArena) -> Self {
        let mut stack = Vec::new();
        if let Some(root) = arena.root() {
            stack.push(root);
        }
        Self { arena, stack }
    }
}

impl<'a> Iterator for TreeIterator<'a> {
    type Item = (Index, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(current_idx) = self.stack.pop() {
            if let Some(node) = self.arena.get_node(current_idx) {
                // reverse push keeps siblings in insertion order
                for &child in node.children.iter().rev() {
                    self.stack.push(child);
                }
                return Some((current_idx, node));
            }
        }
        None
    }
}

pub struct PostOrderIterator<'a> {
    arena: &'a TreeArena,
    stack: Vec<(Index, bool)>,
}

impl<'a> PostOrderIterator<'a> {
    fn new(arena: &'a TreeArena) -> Self {
        let mut stack = Vec::new();
        if let Some(root) = arena.root() {
            stack.push((root, false));
        }
        Self { arena, stack }
    }
}

impl<'a> Iterator for PostOrderIterator<'a> {
    type Item = (Index, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((current_idx, visited)) = self.stack.pop() {
            if let Some(node) = self.arena.get_node(current_idx) {
                if !visited {
                    self.stack.push((current_idx, true));
                    for &child in node.children.iter().rev() {
                        self.stack.push((child, false));
                    }
                } else {
                    return Some((current_idx, node));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{DeclaredTypes, NodeType};
    use uuid::Uuid;

    fn node(name: &str, parent: Option<&AttributeNode>) -> AttributeNode {
        let (path, depth) = match parent {
            Some(p) => (path::child_path(Some(&p.materialized_path), name), p.depth + 1),
            None => (path::child_path(None, name), 0),
        };
        AttributeNode {
            id: Uuid::new_v4(),
            manufacturing_type_id: Uuid::nil(),
            parent_id: parent.map(|p| p.id),
            name: name.into(),
            node_type: NodeType::Attribute,
            data_type: None,
            materialized_path: path,
            depth,
            display_condition: None,
            validation_rules: None,
            price_impact: None,
            weight_impact: None,
            technical_impact: None,
            declared_types: DeclaredTypes::default(),
            required: false,
            description: None,
            sort_order: 0,
        }
    }

    fn sample() -> (AttributeNode, Vec<AttributeNode>) {
        let root = node("Frame", None);
        let material = node("Material", Some(&root));
        let wood = node("Wood", Some(&material));
        let color = node("Color", Some(&root));
        (root, vec![wood, color, material])
    }

    #[test]
    fn given_unordered_descendants_when_building_then_links_all() {
        let (root, descendants) = sample();
        let tree = TreeArena::from_subtree(root, descendants).unwrap();
        assert_eq!(tree.len(), 4);

        let paths: Vec<_> = tree.iter().map(|(_, n)| n.data.materialized_path.clone()).collect();
        assert_eq!(paths[0], "frame");
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn given_orphan_descendant_when_building_then_broken_link() {
        let (root, _) = sample();
        let stray = node("Stray", Some(&node("Elsewhere", None)));
        let err = TreeArena::from_subtree(root, vec![stray]).unwrap_err();
        assert!(matches!(err, DomainError::BrokenParentLink { .. }));
    }

    #[test]
    fn given_subtree_when_relocating_then_paths_and_depths_follow() {
        let (root, descendants) = sample();
        let mut tree = TreeArena::from_subtree(root, descendants).unwrap();

        tree.relocate(Some(("window.parts", 1)));

        let nodes = tree.nodes_preorder();
        let wood = nodes.iter().find(|n| n.name == "Wood").unwrap();
        assert_eq!(wood.materialized_path, "window.parts.frame.material.wood");
        assert_eq!(wood.depth, 4);
        assert!(nodes.iter().all(|n| n.materialized_path.starts_with("window.parts.frame")));
    }

    #[test]
    fn given_subtree_when_listing_postorder_then_children_before_parents() {
        let (root, descendants) = sample();
        let root_id = root.id;
        let tree = TreeArena::from_subtree(root, descendants).unwrap();

        let ids = tree.ids_postorder();

        assert_eq!(ids.last(), Some(&root_id));
        let nodes = tree.nodes_preorder();
        let material = nodes.iter().find(|n| n.name == "Material").unwrap();
        let wood = nodes.iter().find(|n| n.name == "Wood").unwrap();
        let pos = |id| ids.iter().position(|x| *x == id).unwrap();
        assert!(pos(wood.id) < pos(material.id));
    }
}
