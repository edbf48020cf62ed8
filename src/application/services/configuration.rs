//! Configuration service
//!
//! Prices selection sets and freezes them into quote snapshots. Writers are
//! serialized with the configuration `version`: a replace based on a stale
//! version fails with a retryable conflict instead of overwriting.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::application::ApplicationResult;
use crate::domain::pricing::index_nodes;
use crate::domain::{
    Configuration, ConfigurationSnapshot, ConfigurationState, DomainError, EvaluationCache,
    ManufacturingType, PricingAggregator, SelectionInput,
};
use crate::infrastructure::traits::{Catalog, ConfigurationRepository, NodeRepository};

pub struct ConfigurationService {
    nodes: Arc<dyn NodeRepository>,
    catalog: Arc<dyn Catalog>,
    configs: Arc<dyn ConfigurationRepository>,
    aggregator: PricingAggregator,
    cache_capacity: usize,
}

impl ConfigurationService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        catalog: Arc<dyn Catalog>,
        configs: Arc<dyn ConfigurationRepository>,
        aggregator: PricingAggregator,
        cache_capacity: usize,
    ) -> Self {
        Self {
            nodes,
            catalog,
            configs,
            aggregator,
            cache_capacity,
        }
    }

    pub fn get(&self, id: Uuid) -> ApplicationResult<Configuration> {
        self.configs
            .get_configuration(id)?
            .ok_or_else(|| DomainError::not_found("configuration", id).into())
    }

    pub fn get_snapshot(&self, id: Uuid) -> ApplicationResult<ConfigurationSnapshot> {
        self.configs
            .get_snapshot(id)?
            .ok_or_else(|| DomainError::not_found("snapshot", id).into())
    }

    fn manufacturing_type(&self, id: Uuid) -> ApplicationResult<ManufacturingType> {
        self.catalog
            .get_manufacturing_type(id)?
            .ok_or_else(|| DomainError::not_found("manufacturing type", id).into())
    }

    /// Start an empty configuration priced at the manufacturing-type bases.
    #[instrument(level = "debug", skip(self, inputs))]
    pub fn create(
        &self,
        manufacturing_type_id: Uuid,
        inputs: BTreeMap<String, Value>,
    ) -> ApplicationResult<Configuration> {
        let manufacturing_type = self.manufacturing_type(manufacturing_type_id)?;
        let mut config = Configuration::new(&manufacturing_type);
        config.inputs = inputs;
        self.price_into(&manufacturing_type, &mut config, &[])?;
        self.configs.save_configuration(config, 0)
    }

    /// Replace the whole selection set and reprice.
    ///
    /// `inputs` replaces the free inputs when given. Fails with a retryable
    /// conflict if `expected_version` is not the stored version.
    #[instrument(level = "debug", skip(self, inputs, selections), fields(selections = selections.len()))]
    pub fn replace_selections(
        &self,
        config_id: Uuid,
        expected_version: u64,
        inputs: Option<BTreeMap<String, Value>>,
        selections: Vec<SelectionInput>,
    ) -> ApplicationResult<Configuration> {
        let mut config = self.get(config_id)?;
        if config.is_snapshotted() {
            return Err(DomainError::Snapshotted(config_id).into());
        }
        if config.version != expected_version {
            return Err(DomainError::ConcurrentModification {
                id: config_id,
                expected: expected_version,
                actual: config.version,
            }
            .into());
        }

        let manufacturing_type = self.manufacturing_type(config.manufacturing_type_id)?;
        if let Some(inputs) = inputs {
            config.inputs = inputs;
        }
        self.price_into(&manufacturing_type, &mut config, &selections)?;
        let saved = self.configs.save_configuration(config, expected_version)?;
        debug!(
            "replace_selections: version={}, total_price={}",
            saved.version, saved.total_price
        );
        Ok(saved)
    }

    /// Reprice the stored selections against the current tree.
    pub fn recompute(&self, config_id: Uuid) -> ApplicationResult<Configuration> {
        let config = self.get(config_id)?;
        let selections = config
            .selections
            .iter()
            .map(|s| SelectionInput::new(s.node_id, s.value.clone()))
            .collect();
        self.replace_selections(config_id, config.version, None, selections)
    }

    /// Price without storing; used for previews.
    pub fn quote(
        &self,
        manufacturing_type_id: Uuid,
        inputs: BTreeMap<String, Value>,
        selections: &[SelectionInput],
    ) -> ApplicationResult<Configuration> {
        let manufacturing_type = self.manufacturing_type(manufacturing_type_id)?;
        let mut config = Configuration::new(&manufacturing_type);
        config.inputs = inputs;
        self.price_into(&manufacturing_type, &mut config, selections)?;
        Ok(config)
    }

    /// Freeze a complete configuration into a quote snapshot.
    ///
    /// A configuration is snapshotted once; afterwards it no longer changes.
    #[instrument(level = "debug", skip(self))]
    pub fn snapshot(&self, config_id: Uuid, quote_ref: Option<String>) -> ApplicationResult<ConfigurationSnapshot> {
        let mut config = self.get(config_id)?;
        match config.state {
            ConfigurationState::Complete => {}
            ConfigurationState::Snapshotted => return Err(DomainError::Snapshotted(config_id).into()),
            ConfigurationState::Empty | ConfigurationState::Partial => {
                return Err(DomainError::InvalidValue {
                    field: "state".into(),
                    message: format!(
                        "configuration is not complete; missing: {}",
                        config.missing_required.join(", ")
                    ),
                }
                .into())
            }
        }

        let snapshot = ConfigurationSnapshot::capture(&config, quote_ref)?;
        let version = config.version;
        config.state = ConfigurationState::Snapshotted;
        self.configs.freeze(config, version, snapshot.clone())?;
        info!(
            "snapshot: configuration={} snapshot={} total_price={}",
            config_id, snapshot.id, snapshot.total_price
        );
        Ok(snapshot)
    }

    fn price_into(
        &self,
        manufacturing_type: &ManufacturingType,
        config: &mut Configuration,
        selections: &[SelectionInput],
    ) -> ApplicationResult<()> {
        let nodes = index_nodes(self.nodes.get_by_manufacturing_type(manufacturing_type.id)?);
        // one cache per request
        let mut cache = EvaluationCache::new(self.cache_capacity);
        let priced = self
            .aggregator
            .price(manufacturing_type, &nodes, &config.inputs, selections, &mut cache)?;
        priced.apply_to(config);
        Ok(())
    }
}
