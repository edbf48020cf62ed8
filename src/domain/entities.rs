//! Domain entities: core data structures

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::condition::{self, RuleNode};
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::formula::Formula;
use crate::domain::path;

pub type NodeId = Uuid;

/// Role of a node in the attribute hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Category,
    Attribute,
    Option,
    Component,
    TechnicalSpec,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Category => "category",
            NodeType::Attribute => "attribute",
            NodeType::Option => "option",
            NodeType::Component => "component",
            NodeType::TechnicalSpec => "technical_spec",
        }
    }
}

impl FromStr for NodeType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "category" => Ok(NodeType::Category),
            "attribute" => Ok(NodeType::Attribute),
            "option" => Ok(NodeType::Option),
            "component" => Ok(NodeType::Component),
            "technical_spec" => Ok(NodeType::TechnicalSpec),
            other => Err(DomainError::InvalidNodeType(other.to_string())),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of value a selection on this node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Selection,
    MultiSelect,
    Dimension,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Selection => "selection",
            DataType::MultiSelect => "multi_select",
            DataType::Dimension => "dimension",
        }
    }

    /// Check that a raw selection value has the expected shape.
    ///
    /// Numbers and booleans accept their string spellings, the way form posts
    /// deliver them.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            DataType::String | DataType::Selection => {
                matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
            }
            DataType::Number | DataType::Dimension => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            DataType::Boolean => match value {
                Value::Bool(_) => true,
                Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "false"),
                Value::Number(n) => matches!(n.as_f64(), Some(v) if v == 0.0 || v == 1.0),
                _ => false,
            },
            DataType::MultiSelect => matches!(value, Value::Array(_)),
        }
    }
}

impl FromStr for DataType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(DataType::String),
            "number" => Ok(DataType::Number),
            "boolean" => Ok(DataType::Boolean),
            "selection" => Ok(DataType::Selection),
            "multi_select" => Ok(DataType::MultiSelect),
            "dimension" => Ok(DataType::Dimension),
            other => Err(DomainError::InvalidDataType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an impact value is applied to the running subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactType {
    Fixed,
    Percentage,
    Formula,
}

impl ImpactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactType::Fixed => "fixed",
            ImpactType::Percentage => "percentage",
            ImpactType::Formula => "formula",
        }
    }
}

impl FromStr for ImpactType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(ImpactType::Fixed),
            "percentage" => Ok(ImpactType::Percentage),
            "formula" => Ok(ImpactType::Formula),
            other => Err(DomainError::InvalidImpact(format!(
                "unknown impact type {other:?}"
            ))),
        }
    }
}

/// Contribution of a node to price, weight or a technical property.
///
/// Exactly one of value or formula exists, and it always matches the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Impact {
    Fixed(f64),
    /// Percent of the running subtotal (10.0 means +10%).
    Percentage(f64),
    Formula(Formula),
}

impl Impact {
    pub fn impact_type(&self) -> ImpactType {
        match self {
            Impact::Fixed(_) => ImpactType::Fixed,
            Impact::Percentage(_) => ImpactType::Percentage,
            Impact::Formula(_) => ImpactType::Formula,
        }
    }

    /// Assemble an impact from the flat `*_type` / `*_value` / `*_formula` fields.
    ///
    /// `label` names the impact in error messages ("price", "weight", ...).
    pub fn from_parts(
        label: &str,
        kind: Option<ImpactType>,
        value: Option<f64>,
        formula: Option<&str>,
    ) -> DomainResult<Option<Impact>> {
        let kind = match (kind, value, formula) {
            (None, None, None) => return Ok(None),
            (Some(k), _, _) => k,
            (None, Some(_), None) => ImpactType::Fixed,
            (None, None, Some(_)) => ImpactType::Formula,
            (None, Some(_), Some(_)) => {
                return Err(DomainError::InvalidImpact(format!(
                    "{label} impact has both a value and a formula"
                )))
            }
        };

        match (kind, value, formula) {
            (ImpactType::Fixed | ImpactType::Percentage, Some(v), None) => {
                if !v.is_finite() {
                    return Err(DomainError::InvalidImpact(format!(
                        "{label} impact value must be finite"
                    )));
                }
                Ok(Some(if kind == ImpactType::Fixed {
                    Impact::Fixed(v)
                } else {
                    Impact::Percentage(v)
                }))
            }
            (ImpactType::Formula, None, Some(f)) => Ok(Some(Impact::Formula(Formula::parse(f)?))),
            (ImpactType::Formula, _, _) => Err(DomainError::InvalidImpact(format!(
                "{label} impact of type formula requires a formula and no value"
            ))),
            (_, _, _) => Err(DomainError::InvalidImpact(format!(
                "{label} impact of type {} requires a value and no formula",
                kind.as_str()
            ))),
        }
    }

    /// The numeric value for fixed/percentage impacts.
    pub fn value(&self) -> Option<f64> {
        match self {
            Impact::Fixed(v) | Impact::Percentage(v) => Some(*v),
            Impact::Formula(_) => None,
        }
    }

    pub fn formula(&self) -> Option<&Formula> {
        match self {
            Impact::Formula(f) => Some(f),
            _ => None,
        }
    }
}

/// Contribution of a node to a named technical property (U-value, area, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalImpact {
    pub property: String,
    pub impact: Impact,
    /// Decimal places to keep; None keeps full precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

/// Constraints a selected value must satisfy.
///
/// Violations are reported as issues on the priced configuration; they do
/// not block pricing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Rule that must hold for the selection to be valid.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "condition::deserialize_lenient"
    )]
    pub rule: Option<RuleNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationRules {
    /// Reject patterns that do not compile. Runs at authoring time.
    pub fn check(&self) -> DomainResult<()> {
        if let Some(pattern) = &self.pattern {
            regex::Regex::new(pattern).map_err(|e| {
                DomainError::MalformedRule(format!("invalid pattern {pattern:?}: {e}"))
            })?;
        }
        if let Some(rule) = &self.rule {
            if rule.has_unrecognized() {
                return Err(DomainError::MalformedRule(
                    "validation rule uses an unknown operator".into(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(DomainError::MalformedRule(format!(
                    "min {min} is greater than max {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Impacts whose `*_type` field the author wrote out on import.
///
/// Export writes those types back and leaves inferred ones implicit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredTypes {
    #[serde(default)]
    pub price: bool,
    #[serde(default)]
    pub weight: bool,
    #[serde(default)]
    pub technical: bool,
}

impl DeclaredTypes {
    pub fn is_empty(&self) -> bool {
        !(self.price || self.weight || self.technical)
    }
}

/// A node in the attribute hierarchy.
///
/// `materialized_path` and `depth` are owned by the hierarchy service; no
/// other code writes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeNode {
    pub id: NodeId,
    pub manufacturing_type_id: Uuid,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub data_type: Option<DataType>,
    pub materialized_path: String,
    pub depth: u32,
    #[serde(default, deserialize_with = "condition::deserialize_lenient")]
    pub display_condition: Option<RuleNode>,
    #[serde(default)]
    pub validation_rules: Option<ValidationRules>,
    #[serde(default)]
    pub price_impact: Option<Impact>,
    #[serde(default)]
    pub weight_impact: Option<Impact>,
    #[serde(default)]
    pub technical_impact: Option<TechnicalImpact>,
    #[serde(default, skip_serializing_if = "DeclaredTypes::is_empty")]
    pub declared_types: DeclaredTypes,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

impl AttributeNode {
    /// The node's own path segment.
    pub fn key(&self) -> &str {
        path::leaf_segment(&self.materialized_path)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Product family supplied by the catalog (e.g. "Casement Window").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManufacturingType {
    pub id: Uuid,
    pub name: String,
    pub base_price: f64,
    pub base_weight: f64,
    #[serde(default)]
    pub base_technical_data: BTreeMap<String, f64>,
}

impl ManufacturingType {
    pub fn new(name: impl Into<String>, base_price: f64, base_weight: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            base_price,
            base_weight,
            base_technical_data: BTreeMap::new(),
        }
    }
}

/// A value chosen for one node, as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionInput {
    pub node_id: NodeId,
    #[serde(default = "selected_marker")]
    pub value: Value,
}

fn selected_marker() -> Value {
    Value::Bool(true)
}

impl SelectionInput {
    pub fn new(node_id: NodeId, value: impl Into<Value>) -> Self {
        Self {
            node_id,
            value: value.into(),
        }
    }

    /// Select an option node (value `true`).
    pub fn option(node_id: NodeId) -> Self {
        Self::new(node_id, true)
    }
}

/// A priced selection inside a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub node_id: NodeId,
    pub value: Value,
    /// Denormalized for audit; the node may later move or be renamed.
    pub path: String,
    /// False when the node was hidden and so excluded from every total.
    pub counted: bool,
    pub price_impact: f64,
    pub weight_impact: f64,
    #[serde(default)]
    pub technical_impact: BTreeMap<String, f64>,
}

/// Lifecycle of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationState {
    Empty,
    /// Required, visible attributes are still unselected.
    Partial,
    Complete,
    Snapshotted,
}

/// What a breakdown line measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakdownKind {
    Base,
    Fixed,
    Percentage,
    Formula,
}

impl From<ImpactType> for BreakdownKind {
    fn from(kind: ImpactType) -> Self {
        match kind {
            ImpactType::Fixed => BreakdownKind::Fixed,
            ImpactType::Percentage => BreakdownKind::Percentage,
            ImpactType::Formula => BreakdownKind::Formula,
        }
    }
}

/// One contribution to a total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownLine {
    /// None for the manufacturing-type base line.
    pub node_id: Option<NodeId>,
    pub path: String,
    pub kind: BreakdownKind,
    pub delta: f64,
}

/// A selection that violates its node's validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub node_id: NodeId,
    pub path: String,
    pub message: String,
}

/// A user's in-progress product configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: Uuid,
    pub manufacturing_type_id: Uuid,
    /// Bumped on every successful save; used to reject concurrent writers.
    pub version: u64,
    /// Free inputs such as `width`, `height`, `quantity`.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub selections: Vec<Selection>,
    pub state: ConfigurationState,
    pub total_price: f64,
    pub calculated_weight: f64,
    #[serde(default)]
    pub calculated_technical_data: BTreeMap<String, f64>,
    #[serde(default)]
    pub price_breakdown: Vec<BreakdownLine>,
    #[serde(default)]
    pub weight_breakdown: Vec<BreakdownLine>,
    #[serde(default)]
    pub technical_breakdown: BTreeMap<String, Vec<BreakdownLine>>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub missing_required: Vec<String>,
}

impl Configuration {
    pub fn new(manufacturing_type: &ManufacturingType) -> Self {
        Self {
            id: Uuid::new_v4(),
            manufacturing_type_id: manufacturing_type.id,
            version: 0,
            inputs: BTreeMap::new(),
            selections: Vec::new(),
            state: ConfigurationState::Empty,
            total_price: manufacturing_type.base_price,
            calculated_weight: manufacturing_type.base_weight,
            calculated_technical_data: manufacturing_type.base_technical_data.clone(),
            price_breakdown: Vec::new(),
            weight_breakdown: Vec::new(),
            technical_breakdown: BTreeMap::new(),
            issues: Vec::new(),
            missing_required: Vec::new(),
        }
    }

    pub fn is_snapshotted(&self) -> bool {
        self.state == ConfigurationState::Snapshotted
    }
}

/// Immutable copy of a priced configuration taken at quote generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSnapshot {
    pub id: Uuid,
    pub configuration_id: Uuid,
    pub manufacturing_type_id: Uuid,
    /// Opaque correlation id supplied by the quoting system.
    #[serde(default)]
    pub quote_ref: Option<String>,
    pub selections: Vec<Selection>,
    pub price_breakdown: Vec<BreakdownLine>,
    pub weight_breakdown: Vec<BreakdownLine>,
    pub technical_snapshot: BTreeMap<String, f64>,
    pub total_price: f64,
    pub calculated_weight: f64,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 over the priced content.
    pub checksum: String,
}
