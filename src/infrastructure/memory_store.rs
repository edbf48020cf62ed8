//! In-process store implementing every storage trait.
//!
//! Node batches are staged on a copy of the node table and swapped in only
//! when every write and every integrity check succeeded.

use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::path;
use crate::domain::{
    AttributeNode, Configuration, ConfigurationSnapshot, DomainError, ManufacturingType, NodeId,
};
use crate::infrastructure::traits::{Catalog, ConfigurationRepository, NodeRepository, NodeWrite};

/// Complete store content; also the on-disk format of the JSON store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImage {
    #[serde(default)]
    pub manufacturing_types: BTreeMap<Uuid, ManufacturingType>,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, AttributeNode>,
    #[serde(default)]
    pub configurations: BTreeMap<Uuid, Configuration>,
    #[serde(default)]
    pub snapshots: BTreeMap<Uuid, ConfigurationSnapshot>,
}

impl StoreImage {
    /// Version and reference checks for a configuration write. Returns the
    /// copy to store, version bumped; nothing is written yet.
    fn stage_configuration(
        &self,
        mut config: Configuration,
        expected_version: u64,
    ) -> ApplicationResult<Configuration> {
        let actual = self.configurations.get(&config.id).map(|c| c.version).unwrap_or(0);
        if actual != expected_version {
            return Err(DomainError::ConcurrentModification {
                id: config.id,
                expected: expected_version,
                actual,
            }
            .into());
        }
        if let Some(missing) = config
            .selections
            .iter()
            .find(|s| !self.nodes.contains_key(&s.node_id))
        {
            return Err(DomainError::not_found("node", missing.node_id).into());
        }
        config.version = actual + 1;
        Ok(config)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreImage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: StoreImage) -> Self {
        Self {
            state: RwLock::new(image),
        }
    }

    /// Copy of the full content.
    pub fn image(&self) -> ApplicationResult<StoreImage> {
        Ok(self.read()?.clone())
    }

    /// Replace the full content.
    pub fn restore(&self, image: StoreImage) -> ApplicationResult<()> {
        *self.write()? = image;
        Ok(())
    }

    fn read(&self) -> ApplicationResult<RwLockReadGuard<'_, StoreImage>> {
        self.state
            .read()
            .map_err(|_| ApplicationError::Storage("store lock poisoned".into()))
    }

    fn write(&self) -> ApplicationResult<RwLockWriteGuard<'_, StoreImage>> {
        self.state
            .write()
            .map_err(|_| ApplicationError::Storage("store lock poisoned".into()))
    }
}

/// Apply one write to the staged node table.
fn stage(staged: &mut BTreeMap<NodeId, AttributeNode>, write: NodeWrite) -> ApplicationResult<()> {
    match write {
        NodeWrite::Create(node) => {
            if staged.contains_key(&node.id) {
                return Err(ApplicationError::Storage(format!("node {} already exists", node.id)));
            }
            staged.insert(node.id, node);
        }
        NodeWrite::Update(node) => {
            if !staged.contains_key(&node.id) {
                return Err(DomainError::not_found("node", node.id).into());
            }
            staged.insert(node.id, node);
        }
        NodeWrite::Delete(id) => {
            if staged.remove(&id).is_none() {
                return Err(DomainError::not_found("node", id).into());
            }
        }
    }
    Ok(())
}

/// Integrity checks on the staged table after a batch.
fn check_integrity(
    staged: &BTreeMap<NodeId, AttributeNode>,
    touched: &HashSet<NodeId>,
    configurations: &BTreeMap<Uuid, Configuration>,
) -> ApplicationResult<()> {
    for node in staged.values().filter(|n| touched.contains(&n.id)) {
        if let Some(parent_id) = node.parent_id {
            let parent = staged.get(&parent_id).ok_or_else(|| DomainError::BrokenParentLink {
                node: node.id.to_string(),
                parent: parent_id.to_string(),
            })?;
            if parent.manufacturing_type_id != node.manufacturing_type_id {
                return Err(DomainError::ForeignParent {
                    node: node.name.clone(),
                    parent: parent_id,
                }
                .into());
            }
        }
    }

    // children of a deleted node would be left dangling
    for node in staged.values() {
        if let Some(parent_id) = node.parent_id {
            if touched.contains(&parent_id) && !staged.contains_key(&parent_id) {
                return Err(DomainError::HasChildren {
                    id: parent_id,
                    count: 1,
                }
                .into());
            }
        }
    }

    // the table was consistent before the batch, so any clash involves a touched node
    let mut seen: HashSet<(Uuid, &str)> = HashSet::new();
    for node in staged.values() {
        if !seen.insert((node.manufacturing_type_id, node.materialized_path.as_str())) {
            return Err(DomainError::DuplicateSibling {
                name: path::leaf_segment(&node.materialized_path).to_string(),
            }
            .into());
        }
    }

    for id in touched.iter().filter(|id| !staged.contains_key(id)) {
        if let Some(config) = configurations
            .values()
            .find(|c| c.selections.iter().any(|s| s.node_id == *id))
        {
            return Err(DomainError::NodeInUse {
                id: *id,
                configuration: config.id,
            }
            .into());
        }
    }
    Ok(())
}

impl NodeRepository for MemoryStore {
    fn get_node(&self, id: NodeId) -> ApplicationResult<Option<AttributeNode>> {
        Ok(self.read()?.nodes.get(&id).cloned())
    }

    fn get_children(&self, parent_id: NodeId) -> ApplicationResult<Vec<AttributeNode>> {
        Ok(self
            .read()?
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    fn get_by_manufacturing_type(&self, manufacturing_type_id: Uuid) -> ApplicationResult<Vec<AttributeNode>> {
        Ok(self
            .read()?
            .nodes
            .values()
            .filter(|n| n.manufacturing_type_id == manufacturing_type_id)
            .cloned()
            .collect())
    }

    fn find_by_path_prefix(
        &self,
        manufacturing_type_id: Uuid,
        prefix: &str,
    ) -> ApplicationResult<Vec<AttributeNode>> {
        Ok(self
            .read()?
            .nodes
            .values()
            .filter(|n| {
                n.manufacturing_type_id == manufacturing_type_id
                    && path::is_descendant_of(&n.materialized_path, prefix)
            })
            .cloned()
            .collect())
    }

    fn commit(&self, writes: Vec<NodeWrite>) -> ApplicationResult<()> {
        let mut state = self.write()?;
        let mut staged = state.nodes.clone();
        let touched: HashSet<NodeId> = writes.iter().map(NodeWrite::node_id).collect();
        let count = writes.len();

        for write in writes {
            stage(&mut staged, write)?;
        }
        check_integrity(&staged, &touched, &state.configurations)?;

        state.nodes = staged;
        debug!("commit: applied {} node writes", count);
        Ok(())
    }
}

impl Catalog for MemoryStore {
    fn get_manufacturing_type(&self, id: Uuid) -> ApplicationResult<Option<ManufacturingType>> {
        Ok(self.read()?.manufacturing_types.get(&id).cloned())
    }

    fn put_manufacturing_type(&self, manufacturing_type: ManufacturingType) -> ApplicationResult<()> {
        self.write()?
            .manufacturing_types
            .insert(manufacturing_type.id, manufacturing_type);
        Ok(())
    }

    fn list_manufacturing_types(&self) -> ApplicationResult<Vec<ManufacturingType>> {
        Ok(self.read()?.manufacturing_types.values().cloned().collect())
    }
}

impl ConfigurationRepository for MemoryStore {
    fn get_configuration(&self, id: Uuid) -> ApplicationResult<Option<Configuration>> {
        Ok(self.read()?.configurations.get(&id).cloned())
    }

    fn save_configuration(
        &self,
        config: Configuration,
        expected_version: u64,
    ) -> ApplicationResult<Configuration> {
        let mut state = self.write()?;
        let stored = state.stage_configuration(config, expected_version)?;
        state.configurations.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn freeze(
        &self,
        config: Configuration,
        expected_version: u64,
        snapshot: ConfigurationSnapshot,
    ) -> ApplicationResult<Configuration> {
        let mut state = self.write()?;
        if state
            .snapshots
            .values()
            .any(|s| s.id == snapshot.id || s.configuration_id == config.id)
        {
            return Err(DomainError::Snapshotted(config.id).into());
        }
        let stored = state.stage_configuration(config, expected_version)?;
        debug!("freeze: configuration={} snapshot={}", stored.id, snapshot.id);
        state.configurations.insert(stored.id, stored.clone());
        state.snapshots.insert(snapshot.id, snapshot);
        Ok(stored)
    }

    fn get_snapshot(&self, id: Uuid) -> ApplicationResult<Option<ConfigurationSnapshot>> {
        Ok(self.read()?.snapshots.get(&id).cloned())
    }
}
