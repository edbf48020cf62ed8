//! Tree assembly and the nested import/export format.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::condition::RuleNode;
use crate::domain::entities::{
    AttributeNode, DataType, DeclaredTypes, Impact, ImpactType, NodeId, NodeType, TechnicalImpact,
    ValidationRules,
};
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::path;

/// A node with its children, siblings ordered by (sort_order, name).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTree {
    pub node: AttributeNode,
    pub children: Vec<NodeTree>,
}

impl NodeTree {
    pub fn leaf(node: AttributeNode) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this tree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(NodeTree::size).sum::<usize>()
    }
}

/// Assemble a forest from a flat node list.
///
/// Every non-root node's parent must be part of the input; a dangling
/// `parent_id` is an integrity error, never a silent extra root.
pub fn build_tree(nodes: Vec<AttributeNode>) -> DomainResult<Vec<NodeTree>> {
    let ids: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    let mut roots = Vec::new();
    let mut by_parent: HashMap<NodeId, Vec<AttributeNode>> = HashMap::new();

    for node in nodes {
        match node.parent_id {
            None => roots.push(node),
            Some(parent) if ids.contains(&parent) => by_parent.entry(parent).or_default().push(node),
            Some(parent) => {
                return Err(DomainError::BrokenParentLink {
                    node: node.id.to_string(),
                    parent: parent.to_string(),
                })
            }
        }
    }
    debug!("build_tree: roots={}, parents={}", roots.len(), by_parent.len());

    sort_siblings(&mut roots);
    let forest: Vec<NodeTree> = roots.into_iter().map(|r| attach(r, &mut by_parent)).collect();

    // anything left over sits on a parent cycle unreachable from a root
    if let Some((parent, stranded)) = by_parent.into_iter().next() {
        let node = stranded.first().map(|n| n.id.to_string()).unwrap_or_default();
        return Err(DomainError::BrokenParentLink {
            node,
            parent: parent.to_string(),
        });
    }
    Ok(forest)
}

fn attach(node: AttributeNode, by_parent: &mut HashMap<NodeId, Vec<AttributeNode>>) -> NodeTree {
    let mut children = by_parent.remove(&node.id).unwrap_or_default();
    sort_siblings(&mut children);
    NodeTree {
        children: children.into_iter().map(|c| attach(c, by_parent)).collect(),
        node,
    }
}

fn sort_siblings(nodes: &mut [AttributeNode]) {
    nodes.sort_by(|a, b| (a.sort_order, &a.name).cmp(&(b.sort_order, &b.name)));
}

/// Pre-order inverse of [`build_tree`].
pub fn flatten(forest: &[NodeTree]) -> Vec<AttributeNode> {
    let mut out = Vec::new();
    for tree in forest {
        flatten_into(tree, &mut out);
    }
    out
}

fn flatten_into(tree: &NodeTree, out: &mut Vec<AttributeNode>) {
    out.push(tree.node.clone());
    for child in &tree.children {
        flatten_into(child, out);
    }
}

// ============================================================================
// NODE CONTENT
// ============================================================================

/// The authorable content of a node: everything except identity and position.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDraft {
    pub name: String,
    pub node_type: NodeType,
    pub data_type: Option<DataType>,
    pub display_condition: Option<RuleNode>,
    pub validation_rules: Option<ValidationRules>,
    pub price_impact: Option<Impact>,
    pub weight_impact: Option<Impact>,
    pub technical_impact: Option<TechnicalImpact>,
    pub declared_types: DeclaredTypes,
    pub required: bool,
    pub description: Option<String>,
    pub sort_order: i32,
}

impl NodeDraft {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            node_type,
            data_type: None,
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

    pub fn with_price(mut self, impact: Impact) -> Self {
        self.price_impact = Some(impact);
        self
    }

    pub fn with_weight(mut self, impact: Impact) -> Self {
        self.weight_impact = Some(impact);
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn with_condition(mut self, rule: RuleNode) -> Self {
        self.display_condition = Some(rule);
        self
    }

    /// Authoring-time checks shared by create and update.
    pub fn validate(&self) -> DomainResult<()> {
        if !path::sanitize(&self.name).chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::EmptyName(self.name.clone()));
        }
        if let Some(rules) = &self.validation_rules {
            rules.check()?;
        }
        if let Some(rule) = &self.display_condition {
            if rule.has_unrecognized() {
                return Err(DomainError::MalformedRule(
                    "display condition uses an unknown operator".into(),
                ));
            }
        }
        if let Some(tech) = &self.technical_impact {
            if tech.property.trim().is_empty() {
                return Err(DomainError::InvalidImpact(
                    "technical impact requires a property name".into(),
                ));
            }
        }
        Ok(())
    }

    /// Place the draft in the tree.
    pub fn into_node(
        self,
        id: NodeId,
        manufacturing_type_id: uuid::Uuid,
        parent: Option<&AttributeNode>,
    ) -> AttributeNode {
        let (materialized_path, depth) = match parent {
            Some(p) => (path::child_path(Some(&p.materialized_path), &self.name), p.depth + 1),
            None => (path::child_path(None, &self.name), 0),
        };
        AttributeNode {
            id,
            manufacturing_type_id,
            parent_id: parent.map(|p| p.id),
            name: self.name,
            node_type: self.node_type,
            data_type: self.data_type,
            materialized_path,
            depth,
            display_condition: self.display_condition,
            validation_rules: self.validation_rules,
            price_impact: self.price_impact,
            weight_impact: self.weight_impact,
            technical_impact: self.technical_impact,
            declared_types: self.declared_types,
            required: self.required,
            description: self.description,
            sort_order: self.sort_order,
        }
    }

    /// Overwrite a node's content, keeping identity and position.
    pub fn apply_to(self, node: &mut AttributeNode) {
        node.name = self.name;
        node.node_type = self.node_type;
        node.data_type = self.data_type;
        node.display_condition = self.display_condition;
        node.validation_rules = self.validation_rules;
        node.price_impact = self.price_impact;
        node.weight_impact = self.weight_impact;
        node.technical_impact = self.technical_impact;
        node.declared_types = self.declared_types;
        node.required = self.required;
        node.description = self.description;
        node.sort_order = self.sort_order;
    }
}

impl From<&AttributeNode> for NodeDraft {
    fn from(node: &AttributeNode) -> Self {
        Self {
            name: node.name.clone(),
            node_type: node.node_type,
            data_type: node.data_type,
            display_condition: node.display_condition.clone(),
            validation_rules: node.validation_rules.clone(),
            price_impact: node.price_impact.clone(),
            weight_impact: node.weight_impact.clone(),
            technical_impact: node.technical_impact.clone(),
            declared_types: node.declared_types,
            required: node.required,
            description: node.description.clone(),
            sort_order: node.sort_order,
        }
    }
}

// ============================================================================
// NESTED IMPORT / EXPORT FORMAT
// ============================================================================

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// Nested, flat-field node description used by batch import and export.
///
/// ```json
/// {"name": "Frame Material", "node_type": "category", "children": [
///   {"name": "Material Type", "node_type": "attribute", "data_type": "selection",
///    "children": [
///      {"name": "Wood", "node_type": "option",
///       "price_impact_type": "fixed", "price_impact_value": 120.0}
///   ]}
/// ]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_impact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_impact_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_formula: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_impact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_impact: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_formula: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_impact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_impact_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_impact_formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_precision: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_condition: Option<RuleNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_rules: Option<ValidationRules>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sort_order: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

fn parse_impact_type(raw: Option<&str>) -> DomainResult<Option<ImpactType>> {
    raw.map(str::parse::<ImpactType>).transpose()
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            node_type: node_type.as_str().to_string(),
            ..Default::default()
        }
    }

    /// Check the flat fields and convert to a draft. Children are not touched.
    pub fn to_draft(&self) -> DomainResult<NodeDraft> {
        let node_type: NodeType = self.node_type.parse()?;
        let data_type = self.data_type.as_deref().map(str::parse::<DataType>).transpose()?;

        let price_impact = Impact::from_parts(
            "price",
            parse_impact_type(self.price_impact_type.as_deref())?,
            self.price_impact_value,
            self.price_formula.as_deref(),
        )?;
        let weight_impact = Impact::from_parts(
            "weight",
            parse_impact_type(self.weight_impact_type.as_deref())?,
            self.weight_impact,
            self.weight_formula.as_deref(),
        )?;
        let technical = Impact::from_parts(
            "technical",
            parse_impact_type(self.technical_impact_type.as_deref())?,
            self.technical_impact_value,
            self.technical_impact_formula.as_deref(),
        )?;
        let technical_impact = match (technical, &self.technical_property_type) {
            (Some(impact), Some(property)) => Some(TechnicalImpact {
                property: property.clone(),
                impact,
                precision: self.technical_precision,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(DomainError::InvalidImpact(
                    "technical impact requires technical_property_type".into(),
                ))
            }
            (None, Some(property)) => {
                return Err(DomainError::InvalidImpact(format!(
                    "technical property {property:?} has no impact value or formula"
                )))
            }
        };

        let draft = NodeDraft {
            name: self.name.clone(),
            node_type,
            data_type,
            display_condition: self.display_condition.clone(),
            validation_rules: self.validation_rules.clone(),
            price_impact,
            weight_impact,
            technical_impact,
            declared_types: DeclaredTypes {
                price: self.price_impact_type.is_some(),
                weight: self.weight_impact_type.is_some(),
                technical: self.technical_impact_type.is_some(),
            },
            required: self.required,
            description: self.description.clone(),
            sort_order: self.sort_order,
        };
        draft.validate()?;
        Ok(draft)
    }

    /// Export a built tree back into the nested format.
    ///
    /// An impact type is written when the author declared it, or when it is a
    /// percentage and so cannot be inferred from which of value/formula is set.
    pub fn from_tree(tree: &NodeTree) -> Self {
        let node = &tree.node;
        let mut spec = NodeSpec {
            name: node.name.clone(),
            node_type: node.node_type.as_str().to_string(),
            data_type: node.data_type.map(|d| d.as_str().to_string()),
            display_condition: node.display_condition.clone(),
            validation_rules: node.validation_rules.clone(),
            required: node.required,
            description: node.description.clone(),
            sort_order: node.sort_order,
            children: tree.children.iter().map(NodeSpec::from_tree).collect(),
            ..Default::default()
        };

        if let Some(impact) = &node.price_impact {
            spec.price_impact_type = written_type(impact, node.declared_types.price);
            spec.price_impact_value = impact.value();
            spec.price_formula = impact.formula().map(|f| f.source().to_string());
        }
        if let Some(impact) = &node.weight_impact {
            spec.weight_impact_type = written_type(impact, node.declared_types.weight);
            spec.weight_impact = impact.value();
            spec.weight_formula = impact.formula().map(|f| f.source().to_string());
        }
        if let Some(tech) = &node.technical_impact {
            spec.technical_property_type = Some(tech.property.clone());
            spec.technical_impact_type = written_type(&tech.impact, node.declared_types.technical);
            spec.technical_impact_value = tech.impact.value();
            spec.technical_impact_formula = tech.impact.formula().map(|f| f.source().to_string());
            spec.technical_precision = tech.precision;
        }
        spec
    }
}

fn written_type(impact: &Impact, declared: bool) -> Option<String> {
    let inferable = !matches!(impact, Impact::Percentage(_));
    (declared || !inferable).then(|| impact.impact_type().as_str().to_string())
}
