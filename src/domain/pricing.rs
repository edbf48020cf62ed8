//! Pricing aggregation: selections in, totals and breakdowns out.
//!
//! Every recompute starts from the manufacturing-type bases and runs three
//! passes over the counted selections, each ordered by (sort_order, path):
//! fixed impacts, then percentages of the running subtotal, then formulas
//! that see the running subtotal as `base_price` (`base_weight` for weight,
//! `base_value` for technical properties). Price, weight and every technical
//! property are aggregated independently with that same ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::condition::EvaluationCache;
use crate::domain::context::{as_number, ConfigurationContext};
use crate::domain::entities::{
    AttributeNode, BreakdownKind, BreakdownLine, Configuration, ConfigurationState, Impact,
    ManufacturingType, NodeId, NodeType, Selection, SelectionInput, ValidationIssue, ValidationRules,
};
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::formula::round_to;
use crate::domain::path;

/// Knobs for one aggregation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingOptions {
    /// Decimal places for price and weight.
    pub decimals: u32,
    /// Whether conditions with unknown operators count as satisfied.
    pub fail_open: bool,
}

impl Default for PricingOptions {
    fn default() -> Self {
        Self {
            decimals: 2,
            fail_open: true,
        }
    }
}

/// Decides node visibility: a node is visible when its own display condition
/// holds and every ancestor is visible.
pub struct VisibilityResolver<'a> {
    nodes: &'a HashMap<NodeId, AttributeNode>,
    ctx: &'a ConfigurationContext,
    fail_open: bool,
    memo: HashMap<NodeId, bool>,
}

impl<'a> VisibilityResolver<'a> {
    pub fn new(nodes: &'a HashMap<NodeId, AttributeNode>, ctx: &'a ConfigurationContext, fail_open: bool) -> Self {
        Self {
            nodes,
            ctx,
            fail_open,
            memo: HashMap::new(),
        }
    }

    pub fn is_visible(&mut self, id: NodeId, cache: &mut EvaluationCache) -> bool {
        // walk up until a known answer, the root or a gap in the node set
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            if self.memo.contains_key(&cid) || chain.len() > self.nodes.len() {
                break;
            }
            let Some(node) = self.nodes.get(&cid) else {
                break;
            };
            chain.push(cid);
            current = node.parent_id;
        }

        let mut visible = current.and_then(|c| self.memo.get(&c).copied()).unwrap_or(true);
        for cid in chain.into_iter().rev() {
            if visible {
                visible = self.own_condition_holds(cid, cache);
            }
            self.memo.insert(cid, visible);
        }
        self.memo.get(&id).copied().unwrap_or(true)
    }

    fn own_condition_holds(&self, id: NodeId, cache: &mut EvaluationCache) -> bool {
        let Some(rule) = self.nodes.get(&id).and_then(|n| n.display_condition.as_ref()) else {
            return true;
        };
        if !self.fail_open && rule.has_unrecognized() {
            debug!("own_condition_holds: hiding {} (unknown operator, fail-closed)", id);
            return false;
        }
        rule.evaluate_cached(self.ctx, cache)
    }
}

/// Result of one aggregation run.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedConfiguration {
    pub selections: Vec<Selection>,
    pub state: ConfigurationState,
    pub total_price: f64,
    pub calculated_weight: f64,
    pub calculated_technical_data: BTreeMap<String, f64>,
    pub price_breakdown: Vec<BreakdownLine>,
    pub weight_breakdown: Vec<BreakdownLine>,
    pub technical_breakdown: BTreeMap<String, Vec<BreakdownLine>>,
    pub issues: Vec<ValidationIssue>,
    pub missing_required: Vec<String>,
}

impl PricedConfiguration {
    /// Replace the configuration's computed content wholesale.
    pub fn apply_to(self, config: &mut Configuration) {
        config.selections = self.selections;
        config.state = self.state;
        config.total_price = self.total_price;
        config.calculated_weight = self.calculated_weight;
        config.calculated_technical_data = self.calculated_technical_data;
        config.price_breakdown = self.price_breakdown;
        config.weight_breakdown = self.weight_breakdown;
        config.technical_breakdown = self.technical_breakdown;
        config.issues = self.issues;
        config.missing_required = self.missing_required;
    }
}

/// A validated selection paired with its node.
struct Entry<'a> {
    input: &'a SelectionInput,
    node: &'a AttributeNode,
    counted: bool,
}

/// Outcome of one three-pass aggregation.
struct PassTotals {
    total: f64,
    lines: Vec<BreakdownLine>,
    deltas: HashMap<NodeId, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct PricingAggregator {
    options: PricingOptions,
}

impl PricingAggregator {
    pub fn new(options: PricingOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> PricingOptions {
        self.options
    }

    /// Price a full selection set.
    ///
    /// `nodes` must hold every node of the manufacturing type. The result
    /// depends only on the arguments, so repeating a call yields the same
    /// totals.
    #[instrument(level = "debug", skip_all, fields(manufacturing_type = %manufacturing_type.id, selections = selections.len()))]
    pub fn price(
        &self,
        manufacturing_type: &ManufacturingType,
        nodes: &HashMap<NodeId, AttributeNode>,
        inputs: &BTreeMap<String, Value>,
        selections: &[SelectionInput],
        cache: &mut EvaluationCache,
    ) -> DomainResult<PricedConfiguration> {
        self.check_selections(manufacturing_type, nodes, selections)?;

        let ctx = ConfigurationContext::build(manufacturing_type, inputs, selections, nodes);
        let mut visibility = VisibilityResolver::new(nodes, &ctx, self.options.fail_open);

        let mut entries = Vec::with_capacity(selections.len());
        for input in selections {
            let Some(node) = nodes.get(&input.node_id) else {
                continue;
            };
            let counted = visibility.is_visible(node.id, cache);
            if !counted {
                debug!("price: dropping hidden selection {}", node.materialized_path);
            }
            entries.push(Entry { input, node, counted });
        }

        let mut ordered: Vec<&Entry> = entries.iter().filter(|e| e.counted).collect();
        ordered.sort_by(|a, b| {
            (a.node.sort_order, &a.node.materialized_path).cmp(&(b.node.sort_order, &b.node.materialized_path))
        });

        let decimals = Some(self.options.decimals);
        let price = run_passes(
            manufacturing_type.base_price,
            &ordered,
            |n| n.price_impact.as_ref().map(|i| (i, decimals)),
            "base_price",
            &ctx,
        )?;
        let weight = run_passes(
            manufacturing_type.base_weight,
            &ordered,
            |n| n.weight_impact.as_ref().map(|i| (i, decimals)),
            "base_weight",
            &ctx,
        )?;

        let mut properties: BTreeSet<String> = manufacturing_type.base_technical_data.keys().cloned().collect();
        properties.extend(
            ordered
                .iter()
                .filter_map(|e| e.node.technical_impact.as_ref().map(|t| t.property.clone())),
        );
        let mut technical = BTreeMap::new();
        for property in properties {
            let base = manufacturing_type.base_technical_data.get(&property).copied().unwrap_or(0.0);
            let totals = run_passes(
                base,
                &ordered,
                |n| {
                    n.technical_impact
                        .as_ref()
                        .filter(|t| t.property == property)
                        .map(|t| (&t.impact, t.precision))
                },
                "base_value",
                &ctx,
            )?;
            technical.insert(property, totals);
        }

        let issues = self.collect_issues(&ordered, &ctx, cache);
        let missing_required = missing_required(nodes, &entries, &mut visibility, cache);

        let selections_out = entries
            .iter()
            .map(|e| Selection {
                node_id: e.node.id,
                value: e.input.value.clone(),
                path: e.node.materialized_path.clone(),
                counted: e.counted,
                price_impact: price.deltas.get(&e.node.id).copied().unwrap_or(0.0),
                weight_impact: weight.deltas.get(&e.node.id).copied().unwrap_or(0.0),
                technical_impact: technical
                    .iter()
                    .filter_map(|(prop, t)| t.deltas.get(&e.node.id).map(|d| (prop.clone(), *d)))
                    .collect(),
            })
            .collect();

        let state = if selections.is_empty() {
            ConfigurationState::Empty
        } else if missing_required.is_empty() {
            ConfigurationState::Complete
        } else {
            ConfigurationState::Partial
        };

        let total_price = round_to(price.total, self.options.decimals);
        let calculated_weight = round_to(weight.total, self.options.decimals);
        debug!(
            "price: total_price={}, weight={}, state={:?}",
            total_price, calculated_weight, state
        );

        let mut calculated_technical_data = BTreeMap::new();
        let mut technical_breakdown = BTreeMap::new();
        for (property, totals) in technical {
            calculated_technical_data.insert(property.clone(), totals.total);
            technical_breakdown.insert(property, totals.lines);
        }

        Ok(PricedConfiguration {
            selections: selections_out,
            state,
            total_price,
            calculated_weight,
            calculated_technical_data,
            price_breakdown: price.lines,
            weight_breakdown: weight.lines,
            technical_breakdown,
            issues,
            missing_required,
        })
    }

    fn check_selections(
        &self,
        manufacturing_type: &ManufacturingType,
        nodes: &HashMap<NodeId, AttributeNode>,
        selections: &[SelectionInput],
    ) -> DomainResult<()> {
        let mut seen = HashSet::new();
        for selection in selections {
            let node = nodes
                .get(&selection.node_id)
                .ok_or_else(|| DomainError::not_found("node", selection.node_id))?;
            if node.manufacturing_type_id != manufacturing_type.id {
                return Err(DomainError::InvalidValue {
                    field: node.materialized_path.clone(),
                    message: "node belongs to another manufacturing type".into(),
                });
            }
            if !seen.insert(selection.node_id) {
                return Err(DomainError::InvalidValue {
                    field: node.materialized_path.clone(),
                    message: "node selected more than once".into(),
                });
            }
            if let Some(data_type) = node.data_type {
                if !data_type.accepts(&selection.value) {
                    return Err(DomainError::InvalidValue {
                        field: node.materialized_path.clone(),
                        message: format!("expected {data_type}, got {}", selection.value),
                    });
                }
            }
        }
        Ok(())
    }

    fn collect_issues(
        &self,
        ordered: &[&Entry],
        ctx: &ConfigurationContext,
        cache: &mut EvaluationCache,
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for entry in ordered {
            let Some(rules) = &entry.node.validation_rules else {
                continue;
            };
            let problems = rule_violations(rules, &entry.input.value, ctx, self.options.fail_open, cache);
            if problems.is_empty() {
                continue;
            }
            let messages = match &rules.message {
                Some(custom) => vec![custom.clone()],
                None => problems,
            };
            issues.extend(messages.into_iter().map(|message| ValidationIssue {
                node_id: entry.node.id,
                path: entry.node.materialized_path.clone(),
                message,
            }));
        }
        issues
    }
}

fn run_passes<'n>(
    base: f64,
    ordered: &[&Entry<'n>],
    pick: impl Fn(&'n AttributeNode) -> Option<(&'n Impact, Option<u32>)>,
    base_var: &str,
    ctx: &ConfigurationContext,
) -> DomainResult<PassTotals> {
    let mut running = base;
    let mut lines = vec![BreakdownLine {
        node_id: None,
        path: "base".into(),
        kind: BreakdownKind::Base,
        delta: base,
    }];
    let mut deltas = HashMap::new();
    let mut formula_ctx: Option<ConfigurationContext> = None;

    for pass in [BreakdownKind::Fixed, BreakdownKind::Percentage, BreakdownKind::Formula] {
        for entry in ordered {
            let Some((impact, precision)) = pick(entry.node) else {
                continue;
            };
            let delta = match (pass, impact) {
                (BreakdownKind::Fixed, Impact::Fixed(v)) => *v,
                (BreakdownKind::Percentage, Impact::Percentage(p)) => running * p / 100.0,
                (BreakdownKind::Formula, Impact::Formula(formula)) => {
                    let fctx = formula_ctx.get_or_insert_with(|| ctx.clone());
                    fctx.insert(base_var, running);
                    let raw = formula.evaluate(fctx)?;
                    precision.map(|d| round_to(raw, d)).unwrap_or(raw)
                }
                _ => continue,
            };
            running += delta;
            *deltas.entry(entry.node.id).or_insert(0.0) += delta;
            lines.push(BreakdownLine {
                node_id: Some(entry.node.id),
                path: entry.node.materialized_path.clone(),
                kind: pass,
                delta,
            });
        }
    }

    Ok(PassTotals {
        total: running,
        lines,
        deltas,
    })
}

/// Messages for every rule the value breaks; empty when valid.
///
/// The `rule` sees the configuration context plus the value under `value`.
fn rule_violations(
    rules: &ValidationRules,
    value: &Value,
    ctx: &ConfigurationContext,
    fail_open: bool,
    cache: &mut EvaluationCache,
) -> Vec<String> {
    let mut out = Vec::new();

    if rules.min.is_some() || rules.max.is_some() {
        match as_number(value) {
            Some(n) => {
                if let Some(min) = rules.min.filter(|min| n < *min) {
                    out.push(format!("value {n} is below the minimum {min}"));
                }
                if let Some(max) = rules.max.filter(|max| n > *max) {
                    out.push(format!("value {n} is above the maximum {max}"));
                }
            }
            None => out.push(format!("value {value} is not numeric")),
        }
    }

    let length = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    };
    if let Some(len) = length {
        if let Some(min) = rules.min_length.filter(|min| len < *min) {
            out.push(format!("length {len} is below the minimum {min}"));
        }
        if let Some(max) = rules.max_length.filter(|max| len > *max) {
            out.push(format!("length {len} is above the maximum {max}"));
        }
    }

    if let Some(pattern) = &rules.pattern {
        let text = match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        // stored patterns were checked at authoring; a bad one is skipped
        if let (Some(text), Ok(re)) = (text, Regex::new(pattern)) {
            if !re.is_match(&text) {
                out.push(format!("value {text:?} does not match {pattern}"));
            }
        }
    }

    if let Some(rule) = &rules.rule {
        let hidden_by_policy = !fail_open && rule.has_unrecognized();
        let scoped = ctx.clone().with("value", value.clone());
        if hidden_by_policy || !rule.evaluate_cached(&scoped, cache) {
            out.push("value violates the validation rule".into());
        }
    }

    out
}

/// Paths of required, visible attribute/category nodes with nothing selected
/// on themselves or below them.
fn missing_required(
    nodes: &HashMap<NodeId, AttributeNode>,
    entries: &[Entry],
    visibility: &mut VisibilityResolver,
    cache: &mut EvaluationCache,
) -> Vec<String> {
    let counted_paths: Vec<&str> = entries
        .iter()
        .filter(|e| e.counted)
        .map(|e| e.node.materialized_path.as_str())
        .collect();

    let mut missing: Vec<String> = nodes
        .values()
        .filter(|n| n.required && matches!(n.node_type, NodeType::Attribute | NodeType::Category))
        .filter(|n| {
            !counted_paths
                .iter()
                .any(|p| *p == n.materialized_path || path::is_descendant_of(p, &n.materialized_path))
        })
        .filter(|n| visibility.is_visible(n.id, cache))
        .map(|n| n.materialized_path.clone())
        .collect();
    missing.sort();
    missing
}

/// Index a flat node list by id.
pub fn index_nodes(nodes: Vec<AttributeNode>) -> HashMap<NodeId, AttributeNode> {
    nodes.into_iter().map(|n| (n.id, n)).collect()
}
