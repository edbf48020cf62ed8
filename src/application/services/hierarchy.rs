//! Hierarchy service
//!
//! The only writer of `materialized_path` and `depth`. Structural edits load
//! the affected subtree with one prefix query, recompute it in a
//! [`TreeArena`] and write it back as one atomic batch.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::application::ApplicationResult;
use crate::domain::path;
use crate::domain::{
    build_tree, AttributeNode, DomainError, ManufacturingType, NodeDraft, NodeId, NodeSpec, NodeTree,
    TreeArena,
};
use crate::infrastructure::traits::{Catalog, NodeRepository, NodeWrite};

/// Service for building and restructuring attribute hierarchies.
pub struct HierarchyService {
    nodes: Arc<dyn NodeRepository>,
    catalog: Arc<dyn Catalog>,
}

impl HierarchyService {
    pub fn new(nodes: Arc<dyn NodeRepository>, catalog: Arc<dyn Catalog>) -> Self {
        Self { nodes, catalog }
    }

    pub fn get_node(&self, id: NodeId) -> ApplicationResult<AttributeNode> {
        self.nodes
            .get_node(id)?
            .ok_or_else(|| DomainError::not_found("node", id).into())
    }

    fn manufacturing_type(&self, id: Uuid) -> ApplicationResult<ManufacturingType> {
        self.catalog
            .get_manufacturing_type(id)?
            .ok_or_else(|| DomainError::not_found("manufacturing type", id).into())
    }

    /// Load a prospective parent and check it belongs to the manufacturing type.
    fn parent_in(&self, manufacturing_type_id: Uuid, parent: Option<NodeId>, child: &str) -> ApplicationResult<Option<AttributeNode>> {
        let Some(parent_id) = parent else {
            return Ok(None);
        };
        let parent = self
            .nodes
            .get_node(parent_id)?
            .ok_or_else(|| DomainError::not_found("parent", parent_id))?;
        if parent.manufacturing_type_id != manufacturing_type_id {
            return Err(DomainError::ForeignParent {
                node: child.to_string(),
                parent: parent_id,
            }
            .into());
        }
        Ok(Some(parent))
    }

    /// Sanitized names already used under `parent`, ignoring `except`.
    fn sibling_keys(
        &self,
        manufacturing_type_id: Uuid,
        parent: Option<NodeId>,
        except: Option<NodeId>,
    ) -> ApplicationResult<HashSet<String>> {
        let siblings = match parent {
            Some(id) => self.nodes.get_children(id)?,
            None => self
                .nodes
                .get_by_manufacturing_type(manufacturing_type_id)?
                .into_iter()
                .filter(AttributeNode::is_root)
                .collect(),
        };
        Ok(siblings
            .into_iter()
            .filter(|n| Some(n.id) != except)
            .map(|n| n.key().to_string())
            .collect())
    }

    /// Create one node under `parent` (None for a root).
    #[instrument(level = "debug", skip(self, draft), fields(name = %draft.name))]
    pub fn create_node(
        &self,
        manufacturing_type_id: Uuid,
        parent: Option<NodeId>,
        draft: NodeDraft,
    ) -> ApplicationResult<AttributeNode> {
        draft.validate()?;
        self.manufacturing_type(manufacturing_type_id)?;
        let parent = self.parent_in(manufacturing_type_id, parent, &draft.name)?;

        let key = path::sanitize(&draft.name);
        if self
            .sibling_keys(manufacturing_type_id, parent.as_ref().map(|p| p.id), None)?
            .contains(&key)
        {
            return Err(DomainError::DuplicateSibling { name: key }.into());
        }

        let node = draft.into_node(Uuid::new_v4(), manufacturing_type_id, parent.as_ref());
        debug!("create_node: path={}, depth={}", node.materialized_path, node.depth);
        self.nodes.create(node.clone())?;
        Ok(node)
    }

    /// Move `node_id` under `new_parent` (None moves it to the top level).
    ///
    /// The node and all its descendants get new paths and depths in one batch.
    #[instrument(level = "debug", skip(self))]
    pub fn reparent(&self, node_id: NodeId, new_parent: Option<NodeId>) -> ApplicationResult<AttributeNode> {
        let node = self.get_node(node_id)?;
        if let Some(target) = new_parent {
            if target == node_id {
                return Err(DomainError::CycleDetected {
                    node: node_id,
                    new_parent: target,
                }
                .into());
            }
        }
        let parent = self.parent_in(node.manufacturing_type_id, new_parent, &node.name)?;
        if let Some(p) = &parent {
            if path::is_descendant_of(&p.materialized_path, &node.materialized_path) {
                return Err(DomainError::CycleDetected {
                    node: node_id,
                    new_parent: p.id,
                }
                .into());
            }
        }
        if node.parent_id == new_parent {
            debug!("reparent: {} already under {:?}", node.materialized_path, new_parent);
            return Ok(node);
        }
        if self
            .sibling_keys(node.manufacturing_type_id, new_parent, Some(node_id))?
            .contains(node.key())
        {
            return Err(DomainError::DuplicateSibling {
                name: node.key().to_string(),
            }
            .into());
        }

        let mut moved = node;
        moved.parent_id = new_parent;
        self.rewrite_subtree(moved, parent.as_ref())
    }

    /// Edit a node's content. A rename cascades to the subtree like a move.
    #[instrument(level = "debug", skip(self, draft))]
    pub fn update_node(&self, node_id: NodeId, draft: NodeDraft) -> ApplicationResult<AttributeNode> {
        draft.validate()?;
        let node = self.get_node(node_id)?;
        let renamed = path::sanitize(&draft.name) != node.key();

        if !renamed {
            let mut updated = node;
            draft.apply_to(&mut updated);
            self.nodes.update(updated.clone())?;
            return Ok(updated);
        }

        let key = path::sanitize(&draft.name);
        if self
            .sibling_keys(node.manufacturing_type_id, node.parent_id, Some(node_id))?
            .contains(&key)
        {
            return Err(DomainError::DuplicateSibling { name: key }.into());
        }
        let parent = match node.parent_id {
            Some(id) => Some(self.get_node(id)?),
            None => None,
        };
        let mut updated = node;
        draft.apply_to(&mut updated);
        self.rewrite_subtree(updated, parent.as_ref())
    }

    /// Recompute paths and depths for `root` (edited, path still the stored
    /// one) and everything below it, then write the subtree in one commit.
    fn rewrite_subtree(&self, root: AttributeNode, parent: Option<&AttributeNode>) -> ApplicationResult<AttributeNode> {
        let old_path = root.materialized_path.clone();
        let descendants = self.nodes.find_by_path_prefix(root.manufacturing_type_id, &old_path)?;
        let mut tree = TreeArena::from_subtree(root, descendants)?;
        tree.relocate(parent.map(|p| (p.materialized_path.as_str(), p.depth)));

        let nodes = tree.nodes_preorder();
        let updated_root = nodes
            .first()
            .cloned()
            .ok_or_else(|| DomainError::not_found("node", "<subtree root>"))?;
        debug!(
            "rewrite_subtree: {} -> {} ({} nodes)",
            old_path,
            updated_root.materialized_path,
            nodes.len()
        );
        self.nodes
            .commit(nodes.into_iter().map(NodeWrite::Update).collect())?;
        Ok(updated_root)
    }

    /// Delete a node. With `cascade` the whole subtree goes, children first.
    ///
    /// Returns the number of deleted nodes.
    #[instrument(level = "debug", skip(self))]
    pub fn delete(&self, node_id: NodeId, cascade: bool) -> ApplicationResult<usize> {
        let node = self.get_node(node_id)?;
        let children = self.nodes.get_children(node_id)?;
        if !children.is_empty() && !cascade {
            return Err(DomainError::HasChildren {
                id: node_id,
                count: children.len(),
            }
            .into());
        }

        let descendants = self
            .nodes
            .find_by_path_prefix(node.manufacturing_type_id, &node.materialized_path)?;
        let tree = TreeArena::from_subtree(node, descendants)?;
        let ids = tree.ids_postorder();
        let count = ids.len();
        self.nodes
            .commit(ids.into_iter().map(NodeWrite::Delete).collect())?;
        debug!("delete: removed {} nodes", count);
        Ok(count)
    }

    /// Create whole nested trees under `parent` in one transaction.
    ///
    /// Any invalid node anywhere aborts the batch with nothing written.
    #[instrument(level = "debug", skip(self, specs), fields(roots = specs.len()))]
    pub fn batch_create_from_nested(
        &self,
        manufacturing_type_id: Uuid,
        specs: &[NodeSpec],
        parent: Option<NodeId>,
    ) -> ApplicationResult<Vec<AttributeNode>> {
        self.manufacturing_type(manufacturing_type_id)?;
        let parent_label = specs.first().map(|s| s.name.as_str()).unwrap_or_default();
        let parent = self.parent_in(manufacturing_type_id, parent, parent_label)?;

        let mut taken = self.sibling_keys(manufacturing_type_id, parent.as_ref().map(|p| p.id), None)?;
        let mut created = Vec::new();
        for spec in specs {
            plan_nested(manufacturing_type_id, spec, parent.as_ref(), &mut taken, &mut created)?;
        }

        debug!("batch_create_from_nested: {} nodes", created.len());
        self.nodes
            .commit(created.iter().cloned().map(NodeWrite::Create).collect())?;
        Ok(created)
    }

    /// Nested export of one subtree.
    pub fn export_nested(&self, root_id: NodeId) -> ApplicationResult<NodeSpec> {
        let tree = self.subtree(root_id)?;
        Ok(NodeSpec::from_tree(&tree))
    }

    /// Nested export of every root of the manufacturing type.
    pub fn export_manufacturing_type(&self, manufacturing_type_id: Uuid) -> ApplicationResult<Vec<NodeSpec>> {
        Ok(self
            .build_tree(manufacturing_type_id)?
            .iter()
            .map(NodeSpec::from_tree)
            .collect())
    }

    /// The full forest of a manufacturing type.
    pub fn build_tree(&self, manufacturing_type_id: Uuid) -> ApplicationResult<Vec<NodeTree>> {
        self.manufacturing_type(manufacturing_type_id)?;
        let nodes = self.nodes.get_by_manufacturing_type(manufacturing_type_id)?;
        Ok(build_tree(nodes)?)
    }

    /// One node with everything below it.
    pub fn subtree(&self, root_id: NodeId) -> ApplicationResult<NodeTree> {
        let mut root = self.get_node(root_id)?;
        let mut nodes = self
            .nodes
            .find_by_path_prefix(root.manufacturing_type_id, &root.materialized_path)?;
        // detach so the root is a root of the partial set
        root.parent_id = None;
        nodes.push(root);
        build_tree(nodes)?
            .into_iter()
            .next()
            .ok_or_else(|| DomainError::not_found("node", root_id).into())
    }

    /// All nodes below `node_id`, ordered by path.
    pub fn get_descendants(&self, node_id: NodeId) -> ApplicationResult<Vec<AttributeNode>> {
        let node = self.get_node(node_id)?;
        let mut found = self
            .nodes
            .find_by_path_prefix(node.manufacturing_type_id, &node.materialized_path)?;
        found.sort_by(|a, b| a.materialized_path.cmp(&b.materialized_path));
        Ok(found)
    }

    /// All ancestors of `node_id`, root first, derived from its path.
    pub fn get_ancestors(&self, node_id: NodeId) -> ApplicationResult<Vec<AttributeNode>> {
        let node = self.get_node(node_id)?;
        let wanted = path::ancestor_paths(&node.materialized_path);
        let mut found: Vec<AttributeNode> = self
            .nodes
            .get_by_manufacturing_type(node.manufacturing_type_id)?
            .into_iter()
            .filter(|n| wanted.contains(&n.materialized_path))
            .collect();
        found.sort_by_key(|n| n.depth);
        Ok(found)
    }
}

/// Convert a nested spec into nodes, depth first, without touching storage.
fn plan_nested(
    manufacturing_type_id: Uuid,
    spec: &NodeSpec,
    parent: Option<&AttributeNode>,
    taken: &mut HashSet<String>,
    out: &mut Vec<AttributeNode>,
) -> ApplicationResult<()> {
    let draft = spec.to_draft()?;
    let key = path::sanitize(&draft.name);
    if !taken.insert(key.clone()) {
        return Err(DomainError::DuplicateSibling { name: key }.into());
    }

    let node = draft.into_node(Uuid::new_v4(), manufacturing_type_id, parent);
    let mut child_keys = HashSet::new();
    out.push(node.clone());
    for child in &spec.children {
        plan_nested(manufacturing_type_id, child, Some(&node), &mut child_keys, out)?;
    }
    Ok(())
}
