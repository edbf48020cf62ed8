//! File-backed store: a [`MemoryStore`] persisted as one JSON document.
//!
//! Every successful mutation rewrites the document atomically. If the write
//! fails the in-memory state is rolled back, so memory and disk never diverge.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::{AttributeNode, Configuration, ConfigurationSnapshot, ManufacturingType, NodeId};
use crate::infrastructure::error::{InfraError, InfraResult};
use crate::infrastructure::memory_store::{MemoryStore, StoreImage};
use crate::infrastructure::traits::{
    Catalog, ConfigurationRepository, FileSystem, NodeRepository, NodeWrite,
};

pub struct JsonFileStore {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    memory: MemoryStore,
    // serializes mutate-then-persist sequences
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store.
    #[instrument(level = "debug", skip(fs))]
    pub fn open(path: &Path, fs: Arc<dyn FileSystem>) -> InfraResult<Self> {
        let image = if fs.exists(path) {
            let content = fs
                .read_to_string(path)
                .map_err(|e| InfraError::io(format!("read store {}", path.display()), e))?;
            serde_json::from_str::<StoreImage>(&content).map_err(|e| InfraError::Format {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            debug!("open: no store at {}, starting empty", path.display());
            StoreImage::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            fs,
            memory: MemoryStore::from_image(image),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> ApplicationResult<()> {
        let image = self.memory.image()?;
        let content = serde_json::to_string_pretty(&image).map_err(|e| ApplicationError::OperationFailed {
            context: "serialize store".into(),
            source: Box::new(e),
        })?;
        self.fs
            .write_atomic(&self.path, &content)
            .map_err(|e| ApplicationError::OperationFailed {
                context: format!("write store {}", self.path.display()),
                source: Box::new(e),
            })
    }

    /// Run a mutation and persist it, restoring the previous state on failure.
    fn mutate<T>(&self, op: impl FnOnce(&MemoryStore) -> ApplicationResult<T>) -> ApplicationResult<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ApplicationError::Storage("store write lock poisoned".into()))?;
        let before = self.memory.image()?;
        let value = op(&self.memory)?;
        if let Err(e) = self.persist() {
            self.memory.restore(before)?;
            return Err(e);
        }
        Ok(value)
    }
}

impl NodeRepository for JsonFileStore {
    fn get_node(&self, id: NodeId) -> ApplicationResult<Option<AttributeNode>> {
        self.memory.get_node(id)
    }

    fn get_children(&self, parent_id: NodeId) -> ApplicationResult<Vec<AttributeNode>> {
        self.memory.get_children(parent_id)
    }

    fn get_by_manufacturing_type(&self, manufacturing_type_id: Uuid) -> ApplicationResult<Vec<AttributeNode>> {
        self.memory.get_by_manufacturing_type(manufacturing_type_id)
    }

    fn find_by_path_prefix(
        &self,
        manufacturing_type_id: Uuid,
        prefix: &str,
    ) -> ApplicationResult<Vec<AttributeNode>> {
        self.memory.find_by_path_prefix(manufacturing_type_id, prefix)
    }

    fn commit(&self, writes: Vec<NodeWrite>) -> ApplicationResult<()> {
        self.mutate(|m| m.commit(writes))
    }
}

impl Catalog for JsonFileStore {
    fn get_manufacturing_type(&self, id: Uuid) -> ApplicationResult<Option<ManufacturingType>> {
        self.memory.get_manufacturing_type(id)
    }

    fn put_manufacturing_type(&self, manufacturing_type: ManufacturingType) -> ApplicationResult<()> {
        self.mutate(|m| m.put_manufacturing_type(manufacturing_type))
    }

    fn list_manufacturing_types(&self) -> ApplicationResult<Vec<ManufacturingType>> {
        self.memory.list_manufacturing_types()
    }
}

impl ConfigurationRepository for JsonFileStore {
    fn get_configuration(&self, id: Uuid) -> ApplicationResult<Option<Configuration>> {
        self.memory.get_configuration(id)
    }

    fn save_configuration(
        &self,
        config: Configuration,
        expected_version: u64,
    ) -> ApplicationResult<Configuration> {
        self.mutate(|m| m.save_configuration(config, expected_version))
    }

    fn freeze(
        &self,
        config: Configuration,
        expected_version: u64,
        snapshot: ConfigurationSnapshot,
    ) -> ApplicationResult<Configuration> {
        self.mutate(|m| m.freeze(config, expected_version, snapshot))
    }

    fn get_snapshot(&self, id: Uuid) -> ApplicationResult<Option<ConfigurationSnapshot>> {
        self.memory.get_snapshot(id)
    }
}
