//! Tests for HierarchyService

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rstest::{fixture, rstest};
use serde_json::json;
use uuid::Uuid;

use pricetree::application::services::HierarchyService;
use pricetree::application::{ApplicationError, ApplicationResult};
use pricetree::domain::{
    AttributeNode, DomainError, ErrorKind, Impact, ManufacturingType, NodeDraft, NodeId, NodeSpec,
    NodeType,
};
use pricetree::infrastructure::traits::{Catalog, NodeRepository, NodeWrite};
use pricetree::infrastructure::MemoryStore;
use pricetree::util::testing;

/// Node repository whose commits fail on demand.
struct FaultyRepository {
    inner: Arc<MemoryStore>,
    fail_commits: AtomicBool,
}

impl NodeRepository for FaultyRepository {
    fn get_node(&self, id: NodeId) -> ApplicationResult<Option<AttributeNode>> {
        self.inner.get_node(id)
    }

    fn get_children(&self, parent_id: NodeId) -> ApplicationResult<Vec<AttributeNode>> {
        self.inner.get_children(parent_id)
    }

    fn get_by_manufacturing_type(&self, id: Uuid) -> ApplicationResult<Vec<AttributeNode>> {
        self.inner.get_by_manufacturing_type(id)
    }

    fn find_by_path_prefix(&self, id: Uuid, prefix: &str) -> ApplicationResult<Vec<AttributeNode>> {
        self.inner.find_by_path_prefix(id, prefix)
    }

    fn commit(&self, writes: Vec<NodeWrite>) -> ApplicationResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(ApplicationError::Storage("injected failure".into()));
        }
        self.inner.commit(writes)
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    service: HierarchyService,
    mt: ManufacturingType,
}

#[fixture]
fn fx() -> Fixture {
    testing::init_test_setup();
    let store = Arc::new(MemoryStore::new());
    let mt = ManufacturingType::new("Casement Window", 200.0, 12.0);
    store.put_manufacturing_type(mt.clone()).unwrap();
    let service = HierarchyService::new(store.clone(), store.clone());
    Fixture { store, service, mt }
}

impl Fixture {
    fn create(&self, name: &str, node_type: NodeType, parent: Option<NodeId>) -> AttributeNode {
        self.service
            .create_node(self.mt.id, parent, NodeDraft::new(name, node_type))
            .unwrap()
    }
}

/// Frame Material > Material Type > {Wood, Aluminum}
fn frame_material_spec() -> NodeSpec {
    serde_json::from_value(json!({
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
    }))
    .unwrap()
}

fn kind(err: &ApplicationError) -> Option<ErrorKind> {
    err.kind()
}

#[rstest]
fn given_root_and_child_when_creating_then_paths_and_depths_follow_parent(fx: Fixture) {
    // Arrange
    let root = fx.create("Frame Material", NodeType::Category, None);

    // Act
    let child = fx.create("Material Type", NodeType::Attribute, Some(root.id));

    // Assert
    assert_eq!(root.materialized_path, "frame_material");
    assert_eq!(root.depth, 0);
    assert_eq!(child.materialized_path, "frame_material.material_type");
    assert_eq!(child.depth, 1);
    assert_eq!(child.parent_id, Some(root.id));
}

#[rstest]
fn given_unknown_parent_when_creating_then_not_found(fx: Fixture) {
    let err = fx
        .service
        .create_node(fx.mt.id, Some(Uuid::new_v4()), NodeDraft::new("Color", NodeType::Attribute))
        .unwrap_err();

    assert_eq!(kind(&err), Some(ErrorKind::NotFound));
}

#[rstest]
fn given_unknown_manufacturing_type_when_creating_then_not_found(fx: Fixture) {
    let err = fx
        .service
        .create_node(Uuid::new_v4(), None, NodeDraft::new("Color", NodeType::Attribute))
        .unwrap_err();

    assert_eq!(kind(&err), Some(ErrorKind::NotFound));
}

#[rstest]
fn given_name_without_alphanumerics_when_creating_then_validation_error(fx: Fixture) {
    let err = fx
        .service
        .create_node(fx.mt.id, None, NodeDraft::new("  --  ", NodeType::Category))
        .unwrap_err();

    assert!(matches!(err, ApplicationError::Domain(DomainError::EmptyName(_))));
    assert_eq!(kind(&err), Some(ErrorKind::Validation));
}

#[rstest]
fn given_sibling_with_same_sanitized_name_when_creating_then_duplicate(fx: Fixture) {
    let root = fx.create("Frame", NodeType::Category, None);
    fx.create("Glass Type", NodeType::Attribute, Some(root.id));

    let err = fx
        .service
        .create_node(fx.mt.id, Some(root.id), NodeDraft::new("glass-type", NodeType::Attribute))
        .unwrap_err();

    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::DuplicateSibling { .. })
    ));
}

#[rstest]
fn given_parent_of_other_type_when_creating_then_rejected(fx: Fixture) {
    // Arrange
    let other = ManufacturingType::new("Door", 400.0, 30.0);
    fx.store.put_manufacturing_type(other.clone()).unwrap();
    let foreign = fx
        .service
        .create_node(other.id, None, NodeDraft::new("Panel", NodeType::Category))
        .unwrap();

    // Act
    let err = fx
        .service
        .create_node(fx.mt.id, Some(foreign.id), NodeDraft::new("Color", NodeType::Attribute))
        .unwrap_err();

    // Assert
    assert_eq!(kind(&err), Some(ErrorKind::Validation));
}

#[rstest]
fn given_subtree_when_reparenting_then_all_descendants_rewritten(fx: Fixture) {
    // Arrange
    let frame = fx.create("Frame", NodeType::Category, None);
    let options = fx.create("Options", NodeType::Category, None);
    let color = fx.create("Color", NodeType::Attribute, Some(frame.id));
    let white = fx.create("White", NodeType::Option, Some(color.id));

    // Act
    let moved = fx.service.reparent(color.id, Some(options.id)).unwrap();

    // Assert
    assert_eq!(moved.materialized_path, "options.color");
    assert_eq!(moved.depth, 1);
    let white = fx.service.get_node(white.id).unwrap();
    assert_eq!(white.materialized_path, "options.color.white");
    assert_eq!(white.depth, 2);
    assert!(fx.service.get_descendants(frame.id).unwrap().is_empty());
}

#[rstest]
fn given_node_when_moving_to_top_level_then_becomes_root(fx: Fixture) {
    let frame = fx.create("Frame", NodeType::Category, None);
    let color = fx.create("Color", NodeType::Attribute, Some(frame.id));
    let white = fx.create("White", NodeType::Option, Some(color.id));

    let moved = fx.service.reparent(color.id, None).unwrap();

    assert!(moved.is_root());
    assert_eq!(moved.materialized_path, "color");
    assert_eq!(moved.depth, 0);
    assert_eq!(fx.service.get_node(white.id).unwrap().depth, 1);
}

#[rstest]
fn given_descendant_as_new_parent_when_reparenting_then_cycle_detected(fx: Fixture) {
    // Arrange
    let a = fx.create("A", NodeType::Category, None);
    let b = fx.create("B", NodeType::Category, Some(a.id));
    let c = fx.create("C", NodeType::Category, Some(b.id));

    // Act
    let under_grandchild = fx.service.reparent(a.id, Some(c.id)).unwrap_err();
    let under_self = fx.service.reparent(a.id, Some(a.id)).unwrap_err();

    // Assert
    for err in [under_grandchild, under_self] {
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::CycleDetected { .. })
        ));
        assert_eq!(kind(&err), Some(ErrorKind::Validation));
    }
    assert_eq!(fx.service.get_node(c.id).unwrap().materialized_path, "a.b.c");
}

#[rstest]
fn given_failing_commit_when_reparenting_then_no_node_changed(fx: Fixture) {
    // Arrange
    let frame = fx.create("Frame", NodeType::Category, None);
    let options = fx.create("Options", NodeType::Category, None);
    let color = fx.create("Color", NodeType::Attribute, Some(frame.id));
    fx.create("White", NodeType::Option, Some(color.id));
    fx.create("Black", NodeType::Option, Some(color.id));
    let before = fx.store.image().unwrap();

    let faulty = Arc::new(FaultyRepository {
        inner: fx.store.clone(),
        fail_commits: AtomicBool::new(true),
    });
    let service = HierarchyService::new(faulty, fx.store.clone());

    // Act
    let result = service.reparent(color.id, Some(options.id));

    // Assert
    assert!(result.is_err());
    assert_eq!(fx.store.image().unwrap(), before);
}

#[rstest]
fn given_rename_when_updating_then_descendant_paths_follow(fx: Fixture) {
    let frame = fx.create("Frame", NodeType::Category, None);
    let color = fx.create("Color", NodeType::Attribute, Some(frame.id));
    let white = fx.create("White", NodeType::Option, Some(color.id));

    let mut draft = NodeDraft::from(&color);
    draft.name = "Frame Colour".into();
    let renamed = fx.service.update_node(color.id, draft).unwrap();

    assert_eq!(renamed.materialized_path, "frame.frame_colour");
    assert_eq!(
        fx.service.get_node(white.id).unwrap().materialized_path,
        "frame.frame_colour.white"
    );
}

#[rstest]
fn given_content_edit_when_updating_then_path_unchanged(fx: Fixture) {
    let frame = fx.create("Frame", NodeType::Category, None);

    let draft = NodeDraft::from(&frame).with_price(Impact::Fixed(15.0));
    let updated = fx.service.update_node(frame.id, draft).unwrap();

    assert_eq!(updated.materialized_path, "frame");
    assert_eq!(updated.price_impact, Some(Impact::Fixed(15.0)));
}

#[rstest]
fn given_node_with_children_when_deleting_without_cascade_then_rejected(fx: Fixture) {
    let frame = fx.create("Frame", NodeType::Category, None);
    fx.create("Color", NodeType::Attribute, Some(frame.id));

    let err = fx.service.delete(frame.id, false).unwrap_err();

    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::HasChildren { count: 1, .. })
    ));
    assert!(fx.service.get_node(frame.id).is_ok());
}

#[rstest]
fn given_subtree_when_deleting_with_cascade_then_all_removed(fx: Fixture) {
    // Arrange
    let frame = fx.create("Frame", NodeType::Category, None);
    let color = fx.create("Color", NodeType::Attribute, Some(frame.id));
    fx.create("White", NodeType::Option, Some(color.id));
    let keep = fx.create("Glass", NodeType::Category, None);

    // Act
    let removed = fx.service.delete(frame.id, true).unwrap();

    // Assert
    assert_eq!(removed, 3);
    let remaining = fx.store.get_by_manufacturing_type(fx.mt.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, keep.id);
}

#[rstest]
fn given_nested_spec_when_importing_then_tree_created(fx: Fixture) {
    // Act
    let created = fx
        .service
        .batch_create_from_nested(fx.mt.id, &[frame_material_spec()], None)
        .unwrap();

    // Assert
    assert_eq!(created.len(), 4);
    let paths: Vec<&str> = created.iter().map(|n| n.materialized_path.as_str()).collect();
    assert!(paths.contains(&"frame_material.material_type.wood"));
    assert!(paths.contains(&"frame_material.material_type.aluminum"));
    let wood = created.iter().find(|n| n.name == "Wood").unwrap();
    assert_eq!(wood.depth, 2);
    assert_eq!(wood.price_impact, Some(Impact::Fixed(120.0)));
}

#[rstest]
fn given_invalid_node_deep_in_spec_when_importing_then_nothing_written(fx: Fixture) {
    // Arrange: the last option has both a value and a formula
    let mut spec = frame_material_spec();
    let aluminum = &mut spec.children[0].children[1];
    aluminum.price_formula = Some("base_price * 0.1".into());

    // Act
    let err = fx
        .service
        .batch_create_from_nested(fx.mt.id, &[spec], None)
        .unwrap_err();

    // Assert
    assert_eq!(kind(&err), Some(ErrorKind::Validation));
    assert!(fx.store.get_by_manufacturing_type(fx.mt.id).unwrap().is_empty());
}

#[rstest]
fn given_unsafe_formula_in_spec_when_importing_then_rejected(fx: Fixture) {
    let mut spec = NodeSpec::new("Glass", NodeType::Option);
    spec.price_formula = Some("__import__('os')".into());

    let err = fx
        .service
        .batch_create_from_nested(fx.mt.id, &[spec], None)
        .unwrap_err();

    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::UnsafeFormula { .. })
    ));
}

#[rstest]
fn given_imported_tree_when_exporting_then_round_trips(fx: Fixture) {
    // Arrange
    let mut spec = frame_material_spec();
    let finishes: Vec<NodeSpec> = serde_json::from_value(json!([
        {"name": "Oak Veneer", "node_type": "option",
         "price_impact_value": 40.0,
         "weight_impact_type": "fixed", "weight_impact": 2.5,
         "technical_property_type": "u_value",
         "technical_impact_type": "fixed", "technical_impact_value": 1.1},
        {"name": "Thermal Break", "node_type": "option",
         "price_impact_type": "percentage", "price_impact_value": 8.0,
         "weight_impact_type": "formula", "weight_formula": "width * 0.002",
         "technical_property_type": "u_value",
         "technical_impact_type": "percentage", "technical_impact_value": -5.0},
        {"name": "Pine", "node_type": "option",
         "price_formula": "width * 0.01",
         "weight_impact": 1.0,
         "technical_property_type": "u_value", "technical_impact_formula": "width / 1000"}
    ]))
    .unwrap();
    spec.children[0].children.extend(finishes);
    let created = fx
        .service
        .batch_create_from_nested(fx.mt.id, &[spec.clone()], None)
        .unwrap();

    // Act
    let exported = fx.service.export_nested(created[0].id).unwrap();
    let by_type = fx.service.export_manufacturing_type(fx.mt.id).unwrap();

    // Assert: siblings come back ordered by name
    let mut expected = spec;
    expected.children[0].children.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(exported, expected);
    assert_eq!(by_type, vec![expected]);
}

#[rstest]
fn given_deep_node_when_querying_ancestors_then_root_first(fx: Fixture) {
    let created = fx
        .service
        .batch_create_from_nested(fx.mt.id, &[frame_material_spec()], None)
        .unwrap();
    let wood = created.iter().find(|n| n.name == "Wood").unwrap();

    let ancestors = fx.service.get_ancestors(wood.id).unwrap();

    let names: Vec<&str> = ancestors.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["Frame Material", "Material Type"]);
}

#[rstest]
fn given_forest_when_building_tree_then_children_nested(fx: Fixture) {
    fx.service
        .batch_create_from_nested(fx.mt.id, &[frame_material_spec()], None)
        .unwrap();
    fx.create("Glass", NodeType::Category, None);

    let forest = fx.service.build_tree(fx.mt.id).unwrap();

    assert_eq!(forest.len(), 2);
    let frame = forest.iter().find(|t| t.node.name == "Frame Material").unwrap();
    assert_eq!(frame.size(), 4);
    assert_eq!(frame.children[0].children.len(), 2);
}
