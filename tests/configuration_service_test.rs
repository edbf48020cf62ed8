//! Tests for ConfigurationService: pricing scenarios, concurrency, snapshots

use std::collections::BTreeMap;
use std::sync::Arc;

use rstest::{fixture, rstest};
use serde_json::{json, Value};

use pricetree::application::services::{ConfigurationService, HierarchyService};
use pricetree::application::ApplicationError;
use pricetree::domain::{
    AttributeNode, ConfigurationState, DomainError, ErrorKind, Formula, Impact, ManufacturingType, NodeDraft,
    NodeSpec, NodeType, PricingAggregator, SelectionInput,
};
use pricetree::infrastructure::traits::Catalog;
use pricetree::infrastructure::MemoryStore;
use pricetree::util::testing;

struct Fixture {
    hierarchy: HierarchyService,
    configurations: ConfigurationService,
    mt: ManufacturingType,
}

#[fixture]
fn fx() -> Fixture {
    testing::init_test_setup();
    let store = Arc::new(MemoryStore::new());
    let mt = ManufacturingType::new("Casement Window", 200.0, 12.0);
    store.put_manufacturing_type(mt.clone()).unwrap();
    Fixture {
        hierarchy: HierarchyService::new(store.clone(), store.clone()),
        configurations: ConfigurationService::new(
            store.clone(),
            store.clone(),
            store,
            PricingAggregator::default(),
            64,
        ),
        mt,
    }
}

impl Fixture {
    fn import(&self, spec: Value) -> Vec<AttributeNode> {
        let spec: NodeSpec = serde_json::from_value(spec).unwrap();
        self.hierarchy
            .batch_create_from_nested(self.mt.id, &[spec], None)
            .unwrap()
    }

    fn option(&self, name: &str, impact: Impact) -> AttributeNode {
        self.hierarchy
            .create_node(
                self.mt.id,
                None,
                NodeDraft::new(name, NodeType::Option).with_price(impact),
            )
            .unwrap()
    }
}

fn by_name<'a>(nodes: &'a [AttributeNode], name: &str) -> &'a AttributeNode {
    nodes.iter().find(|n| n.name == name).unwrap()
}

fn frame_material() -> Value {
    json!({
        "name": "Frame Material",
        "node_type": "category",
        "children": [{
            "name": "Material Type",
            "node_type": "attribute",
            "data_type": "selection",
            "required": true,
            "children": [
                {"name": "Wood", "node_type": "option",
                 "price_impact_type": "fixed", "price_impact_value": 120.0},
                {"name": "Aluminum", "node_type": "option",
                 "price_impact_type": "fixed", "price_impact_value": 50.0}
            ]
        }]
    })
}

#[rstest]
fn given_fixed_and_percentage_options_when_pricing_then_275(fx: Fixture) {
    // Arrange
    let handle = fx.option("Handle", Impact::Fixed(50.0));
    let premium = fx.option("Premium Finish", Impact::Percentage(10.0));
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();

    // Act
    let priced = fx
        .configurations
        .replace_selections(
            config.id,
            config.version,
            None,
            vec![SelectionInput::option(premium.id), SelectionInput::option(handle.id)],
        )
        .unwrap();

    // Assert
    assert_eq!(priced.total_price, 275.00);
    assert_eq!(priced.price_breakdown.len(), 3);
    let premium_line = priced.selections.iter().find(|s| s.node_id == premium.id).unwrap();
    assert_eq!(premium_line.price_impact, 25.0);
}

#[rstest]
fn given_wood_then_aluminum_when_replacing_selections_then_no_residual_impact(fx: Fixture) {
    // Arrange
    let nodes = fx.import(frame_material());
    let wood = by_name(&nodes, "Wood");
    let aluminum = by_name(&nodes, "Aluminum");
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();

    // Act
    let with_wood = fx
        .configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(wood.id)])
        .unwrap();
    let with_aluminum = fx
        .configurations
        .replace_selections(
            config.id,
            with_wood.version,
            None,
            vec![SelectionInput::option(aluminum.id)],
        )
        .unwrap();

    // Assert
    assert_eq!(with_wood.total_price, 320.0);
    assert_eq!(with_wood.state, ConfigurationState::Complete);
    assert_eq!(with_aluminum.total_price, 250.0);
    assert_eq!(with_aluminum.selections.len(), 1);
    assert!(with_aluminum
        .price_breakdown
        .iter()
        .all(|line| line.node_id != Some(wood.id)));
}

#[rstest]
fn given_option_selected_when_pricing_then_parent_attribute_visible_to_rules(fx: Fixture) {
    // Arrange: the stain only shows for wood frames
    let mut spec = frame_material();
    spec["children"].as_array_mut().unwrap().push(json!({
        "name": "Aluminum Stain",
        "node_type": "option",
        "price_impact_type": "fixed",
        "price_impact_value": 30.0,
        "display_condition": {"op": "equals", "field": "material_type", "value": "wood"}
    }));
    let nodes = fx.import(spec);
    let aluminum = by_name(&nodes, "Aluminum");
    let wood = by_name(&nodes, "Wood");
    let stain = by_name(&nodes, "Aluminum Stain");

    // Act
    let with_wood = fx
        .configurations
        .quote(
            fx.mt.id,
            BTreeMap::new(),
            &[SelectionInput::option(wood.id), SelectionInput::option(stain.id)],
        )
        .unwrap();
    let with_aluminum = fx
        .configurations
        .quote(
            fx.mt.id,
            BTreeMap::new(),
            &[SelectionInput::option(aluminum.id), SelectionInput::option(stain.id)],
        )
        .unwrap();

    // Assert
    assert_eq!(with_wood.total_price, 350.0);
    assert_eq!(with_aluminum.total_price, 250.0);
    assert!(!with_aluminum.selections[1].counted);
}

#[rstest]
fn given_area_formula_when_pricing_then_uses_inputs(fx: Fixture) {
    let glass = fx
        .hierarchy
        .create_node(
            fx.mt.id,
            None,
            NodeDraft::new("Triple Glazing", NodeType::Option)
                .with_price(Impact::Formula(Formula::parse("width * height / 1000000 * 85").unwrap())),
        )
        .unwrap();
    let inputs: BTreeMap<String, Value> = [("width".to_string(), json!(1200)), ("height".to_string(), json!(1000))]
        .into_iter()
        .collect();

    let priced = fx
        .configurations
        .quote(fx.mt.id, inputs, &[SelectionInput::option(glass.id)])
        .unwrap();

    assert_eq!(priced.total_price, 302.0);
}

#[rstest]
fn given_stale_version_when_replacing_then_retryable_conflict(fx: Fixture) {
    // Arrange
    let handle = fx.option("Handle", Impact::Fixed(50.0));
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();
    fx.configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(handle.id)])
        .unwrap();

    // Act: second writer still holds the original version
    let err = fx
        .configurations
        .replace_selections(config.id, config.version, None, vec![])
        .unwrap_err();

    // Assert
    assert!(err.is_retryable());
    assert_eq!(err.kind(), Some(ErrorKind::Conflict));
    assert_eq!(fx.configurations.get(config.id).unwrap().total_price, 250.0);
}

#[rstest]
fn given_missing_formula_input_when_replacing_then_error_and_nothing_saved(fx: Fixture) {
    let glass = fx
        .hierarchy
        .create_node(
            fx.mt.id,
            None,
            NodeDraft::new("Glass", NodeType::Option)
                .with_price(Impact::Formula(Formula::parse("width * 0.1").unwrap())),
        )
        .unwrap();
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();

    let err = fx
        .configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(glass.id)])
        .unwrap_err();

    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::MissingVariable(_))
    ));
    assert_eq!(fx.configurations.get(config.id).unwrap().version, config.version);
}

#[rstest]
fn given_complete_configuration_when_snapshotting_then_frozen_copy(fx: Fixture) {
    // Arrange
    let nodes = fx.import(frame_material());
    let wood = by_name(&nodes, "Wood");
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();
    let priced = fx
        .configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(wood.id)])
        .unwrap();

    // Act
    let snapshot = fx
        .configurations
        .snapshot(config.id, Some("Q-1001".into()))
        .unwrap();

    // Assert
    assert_eq!(snapshot.total_price, 320.0);
    assert_eq!(snapshot.selections, priced.selections);
    assert_eq!(snapshot.quote_ref.as_deref(), Some("Q-1001"));
    assert!(snapshot.verify());
    assert_eq!(fx.configurations.get_snapshot(snapshot.id).unwrap(), snapshot);

    let stored = fx.configurations.get(config.id).unwrap();
    assert_eq!(stored.state, ConfigurationState::Snapshotted);
    let err = fx
        .configurations
        .replace_selections(config.id, stored.version, None, vec![])
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::Snapshotted(_))));
}

#[rstest]
fn given_partial_configuration_when_snapshotting_then_rejected(fx: Fixture) {
    let nodes = fx.import(frame_material());
    let extra = fx.option("Extra", Impact::Fixed(5.0));
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();
    let partial = fx
        .configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(extra.id)])
        .unwrap();

    let err = fx.configurations.snapshot(config.id, None).unwrap_err();

    assert_eq!(partial.state, ConfigurationState::Partial);
    assert_eq!(
        partial.missing_required,
        vec![by_name(&nodes, "Material Type").materialized_path.clone()]
    );
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
}

#[rstest]
fn given_snapshot_when_node_impact_changes_then_snapshot_unaffected(fx: Fixture) {
    // Arrange
    let nodes = fx.import(frame_material());
    let wood = by_name(&nodes, "Wood").clone();
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();
    fx.configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(wood.id)])
        .unwrap();
    let snapshot = fx.configurations.snapshot(config.id, None).unwrap();

    // Act
    let draft = NodeDraft::from(&wood).with_price(Impact::Fixed(999.0));
    fx.hierarchy.update_node(wood.id, draft).unwrap();

    // Assert
    assert_eq!(fx.configurations.get_snapshot(snapshot.id).unwrap().total_price, 320.0);
}

#[rstest]
fn given_changed_impact_when_recomputing_then_new_total(fx: Fixture) {
    let handle = fx.option("Handle", Impact::Fixed(50.0));
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();
    fx.configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(handle.id)])
        .unwrap();

    let draft = NodeDraft::from(&handle).with_price(Impact::Fixed(80.0));
    fx.hierarchy.update_node(handle.id, draft).unwrap();
    let recomputed = fx.configurations.recompute(config.id).unwrap();

    assert_eq!(recomputed.total_price, 280.0);
}

#[rstest]
fn given_selected_node_when_deleting_then_node_in_use(fx: Fixture) {
    let handle = fx.option("Handle", Impact::Fixed(50.0));
    let config = fx.configurations.create(fx.mt.id, BTreeMap::new()).unwrap();
    fx.configurations
        .replace_selections(config.id, config.version, None, vec![SelectionInput::option(handle.id)])
        .unwrap();

    let err = fx.hierarchy.delete(handle.id, false).unwrap_err();

    assert!(matches!(err, ApplicationError::Domain(DomainError::NodeInUse { .. })));
}
