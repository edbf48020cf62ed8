//! Storage and I/O boundary traits
//!
//! Services depend on these traits, so tests can swap in in-memory or
//! failure-injecting implementations.

use std::io::{self, Write};
use std::path::Path;

use uuid::Uuid;

use crate::application::ApplicationResult;
use crate::domain::{AttributeNode, Configuration, ConfigurationSnapshot, ManufacturingType, NodeId};

/// One step of an atomic node batch.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeWrite {
    Create(AttributeNode),
    Update(AttributeNode),
    Delete(NodeId),
}

impl NodeWrite {
    pub fn node_id(&self) -> NodeId {
        match self {
            NodeWrite::Create(n) | NodeWrite::Update(n) => n.id,
            NodeWrite::Delete(id) => *id,
        }
    }
}

/// Persistence collaborator for attribute nodes.
pub trait NodeRepository: Send + Sync {
    fn get_node(&self, id: NodeId) -> ApplicationResult<Option<AttributeNode>>;

    /// Direct children, any order.
    fn get_children(&self, parent_id: NodeId) -> ApplicationResult<Vec<AttributeNode>>;

    /// Every node of the manufacturing type, any order.
    fn get_by_manufacturing_type(&self, manufacturing_type_id: Uuid) -> ApplicationResult<Vec<AttributeNode>>;

    /// Nodes strictly below `prefix` (segment-aware prefix match).
    fn find_by_path_prefix(
        &self,
        manufacturing_type_id: Uuid,
        prefix: &str,
    ) -> ApplicationResult<Vec<AttributeNode>>;

    /// Apply all writes or none.
    fn commit(&self, writes: Vec<NodeWrite>) -> ApplicationResult<()>;

    fn create(&self, node: AttributeNode) -> ApplicationResult<()> {
        self.commit(vec![NodeWrite::Create(node)])
    }

    fn update(&self, node: AttributeNode) -> ApplicationResult<()> {
        self.commit(vec![NodeWrite::Update(node)])
    }

    fn delete(&self, id: NodeId) -> ApplicationResult<()> {
        self.commit(vec![NodeWrite::Delete(id)])
    }
}

/// Catalog collaborator supplying manufacturing types.
pub trait Catalog: Send + Sync {
    fn get_manufacturing_type(&self, id: Uuid) -> ApplicationResult<Option<ManufacturingType>>;

    fn put_manufacturing_type(&self, manufacturing_type: ManufacturingType) -> ApplicationResult<()>;

    fn list_manufacturing_types(&self) -> ApplicationResult<Vec<ManufacturingType>>;
}

/// Storage for configurations and their snapshots.
pub trait ConfigurationRepository: Send + Sync {
    fn get_configuration(&self, id: Uuid) -> ApplicationResult<Option<Configuration>>;

    /// Store `config` if the stored version still equals `expected_version`
    /// (0 for a configuration not stored yet). Returns the stored copy with
    /// its bumped version.
    fn save_configuration(
        &self,
        config: Configuration,
        expected_version: u64,
    ) -> ApplicationResult<Configuration>;

    /// Store `config` and its `snapshot` together, or neither.
    ///
    /// Same version check as `save_configuration`. Fails with `Snapshotted`
    /// if a snapshot of this configuration already exists.
    fn freeze(
        &self,
        config: Configuration,
        expected_version: u64,
        snapshot: ConfigurationSnapshot,
    ) -> ApplicationResult<Configuration>;

    fn get_snapshot(&self, id: Uuid) -> ApplicationResult<Option<ConfigurationSnapshot>>;
}

/// Filesystem abstraction for testability.
pub trait FileSystem: Send + Sync {
    /// Read file contents to string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Replace the file's content so readers see either the old or the new
    /// content, never a partial write.
    fn write_atomic(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Check if path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Create parent directories if needed.
    fn ensure_parent(&self, path: &Path) -> io::Result<()>;
}

// ============================================================
// REAL IMPLEMENTATIONS
// ============================================================

/// Real filesystem implementation.
#[derive(Debug, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_atomic(&self, path: &Path, content: &str) -> io::Result<()> {
        self.ensure_parent(path)?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
                std::fs::create_dir_all(parent)
            }
            _ => Ok(()),
        }
    }
}
