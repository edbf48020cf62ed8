//! Service container for dependency injection
//!
//! Wires up all services with their dependencies.

use std::sync::Arc;

use tracing::debug;

use crate::application::services::{ConfigurationService, HierarchyService};
use crate::config::Settings;
use crate::domain::PricingAggregator;
use crate::infrastructure::error::InfraResult;
use crate::infrastructure::json_store::JsonFileStore;
use crate::infrastructure::traits::{
    Catalog, ConfigurationRepository, FileSystem, NodeRepository, RealFileSystem,
};

/// Container holding all application services.
pub struct ServiceContainer {
    /// Application settings
    pub settings: Arc<Settings>,

    /// Manufacturing types
    pub catalog: Arc<dyn Catalog>,

    /// Attribute tree editing and import/export
    pub hierarchy: HierarchyService,

    /// Pricing and snapshots
    pub configurations: ConfigurationService,
}

impl ServiceContainer {
    /// Open the JSON store at `settings.data_file` on the real filesystem.
    pub fn new(settings: Settings) -> InfraResult<Self> {
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
        let store = Arc::new(JsonFileStore::open(&settings.data_file, fs)?);
        debug!("new: store={}", store.path().display());
        Ok(Self::with_store(settings, store))
    }

    /// Use one object for every storage trait.
    pub fn with_store<S>(settings: Settings, store: Arc<S>) -> Self
    where
        S: NodeRepository + Catalog + ConfigurationRepository + 'static,
    {
        Self::with_deps(settings, store.clone(), store.clone(), store)
    }

    /// Create a service container with custom dependencies (for testing).
    pub fn with_deps(
        settings: Settings,
        nodes: Arc<dyn NodeRepository>,
        catalog: Arc<dyn Catalog>,
        configs: Arc<dyn ConfigurationRepository>,
    ) -> Self {
        let aggregator = PricingAggregator::new(settings.pricing_options());
        let hierarchy = HierarchyService::new(nodes.clone(), catalog.clone());
        let configurations = ConfigurationService::new(
            nodes,
            catalog.clone(),
            configs,
            aggregator,
            settings.pricing.cache_capacity,
        );

        Self {
            settings: Arc::new(settings),
            catalog,
            hierarchy,
            configurations,
        }
    }
}
