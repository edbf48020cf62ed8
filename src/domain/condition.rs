//! Declarative condition rules (field visibility and validation).
//!
//! JSON form:
//! ```json
//! {"op": "and", "operands": [
//!     {"op": "equals", "field": "material_type", "value": "wood"},
//!     {"op": "greater_than", "field": "width", "value": 1000}
//! ]}
//! ```
//!
//! Authoring goes through [`RuleNode::parse`], which rejects unknown
//! operators. Rules read back from storage may go through
//! [`RuleNode::parse_lenient`], which keeps unknown operators so that
//! evaluation can fail open on them.

use std::collections::{HashMap, VecDeque};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::context::{as_number, is_truthy, ConfigurationContext};
use crate::domain::error::{DomainError, DomainResult};

/// Tolerance for numeric equality.
const FLOAT_EPSILON: f64 = 1e-9;

/// Boolean combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl LogicalOp {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "and" => Some(LogicalOp::And),
            "or" => Some(LogicalOp::Or),
            "not" => Some(LogicalOp::Not),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
            LogicalOp::Not => "not",
        }
    }
}

/// Leaf comparison operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Contains,
    StartsWith,
    EndsWith,
    MatchesPattern,
    In,
    NotIn,
    AnyOf,
    AllOf,
    Exists,
    NotExists,
    IsEmpty,
    IsNotEmpty,
    /// Only produced by lenient parsing; evaluates as satisfied.
    Unrecognized(String),
}

impl Operator {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "greater_than" => Operator::GreaterThan,
            "less_than" => Operator::LessThan,
            "greater_equal" => Operator::GreaterEqual,
            "less_equal" => Operator::LessEqual,
            "contains" => Operator::Contains,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "matches_pattern" => Operator::MatchesPattern,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "any_of" => Operator::AnyOf,
            "all_of" => Operator::AllOf,
            "exists" => Operator::Exists,
            "not_exists" => Operator::NotExists,
            "is_empty" => Operator::IsEmpty,
            "is_not_empty" => Operator::IsNotEmpty,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::GreaterEqual => "greater_equal",
            Operator::LessEqual => "less_equal",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::MatchesPattern => "matches_pattern",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::AnyOf => "any_of",
            Operator::AllOf => "all_of",
            Operator::Exists => "exists",
            Operator::NotExists => "not_exists",
            Operator::IsEmpty => "is_empty",
            Operator::IsNotEmpty => "is_not_empty",
            Operator::Unrecognized(name) => name,
        }
    }
}

/// A condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum RuleNode {
    Logical {
        op: LogicalOp,
        operands: Vec<RuleNode>,
    },
    Leaf {
        op: Operator,
        field: String,
        value: Value,
    },
}

impl RuleNode {
    pub fn leaf(op: Operator, field: impl Into<String>, value: impl Into<Value>) -> Self {
        RuleNode::Leaf {
            op,
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn and(operands: Vec<RuleNode>) -> Self {
        RuleNode::Logical {
            op: LogicalOp::And,
            operands,
        }
    }

    pub fn or(operands: Vec<RuleNode>) -> Self {
        RuleNode::Logical {
            op: LogicalOp::Or,
            operands,
        }
    }

    pub fn negate(operand: RuleNode) -> Self {
        RuleNode::Logical {
            op: LogicalOp::Not,
            operands: vec![operand],
        }
    }

    /// Strict parse for authoring: unknown operators and malformed nodes are errors.
    pub fn parse(value: &Value) -> DomainResult<Self> {
        parse_node(value, true)
    }

    /// Lenient parse for stored rules: unknown operators survive as
    /// [`Operator::Unrecognized`] and structural problems become
    /// unrecognized leaves.
    pub fn parse_lenient(value: &Value) -> Self {
        match parse_node(value, false) {
            Ok(rule) => rule,
            Err(e) => {
                warn!("parse_lenient: keeping malformed rule as unrecognized: {}", e);
                RuleNode::Leaf {
                    op: Operator::Unrecognized("malformed".into()),
                    field: String::new(),
                    value: value.clone(),
                }
            }
        }
    }

    /// Evaluate the rule. Never fails.
    ///
    /// A rule holding any operator the evaluator does not know is satisfied as
    /// a whole, so wrapping it in `not` or `and` cannot turn it into a denial.
    pub fn evaluate(&self, ctx: &ConfigurationContext) -> bool {
        if self.has_unrecognized() {
            warn!("evaluate: rule has an unknown operator, treating as satisfied");
            return true;
        }
        self.eval_known(ctx)
    }

    fn eval_known(&self, ctx: &ConfigurationContext) -> bool {
        match self {
            RuleNode::Logical { op, operands } => match op {
                LogicalOp::And => operands.iter().all(|r| r.eval_known(ctx)),
                LogicalOp::Or => operands.iter().any(|r| r.eval_known(ctx)),
                LogicalOp::Not => operands.first().map_or(true, |single| !single.eval_known(ctx)),
            },
            RuleNode::Leaf { op, field, value } => evaluate_leaf(op, ctx.get(field), value),
        }
    }

    /// Evaluate through a caller-owned cache.
    pub fn evaluate_cached(&self, ctx: &ConfigurationContext, cache: &mut EvaluationCache) -> bool {
        let key = (self.canonical(), ctx.canonical());
        if let Some(result) = cache.get(&key) {
            return result;
        }
        let result = self.evaluate(ctx);
        cache.insert(key, result);
        result
    }

    /// Canonical JSON text of the rule. Equal text means equal rule.
    pub fn canonical(&self) -> String {
        Value::from(self.clone()).to_string()
    }

    /// True if lenient parsing kept an operator it did not know, or a `not`
    /// does not have exactly one operand.
    pub fn has_unrecognized(&self) -> bool {
        match self {
            RuleNode::Logical { op: LogicalOp::Not, operands } if operands.len() != 1 => true,
            RuleNode::Logical { operands, .. } => operands.iter().any(RuleNode::has_unrecognized),
            RuleNode::Leaf { op, .. } => matches!(op, Operator::Unrecognized(_)),
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Bounded LRU cache of rule results, owned by the caller.
///
/// Keys are the canonical texts of the rule and the context, so a hit always
/// returns what a fresh evaluation would.
type CacheKey = (String, String);

#[derive(Debug)]
pub struct EvaluationCache {
    entries: HashMap<CacheKey, bool>,
    lru: VecDeque<CacheKey>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl EvaluationCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.clone());
    }

    fn get(&mut self, key: &CacheKey) -> Option<bool> {
        match self.entries.get(key).copied() {
            Some(result) => {
                self.hits += 1;
                self.touch(key);
                Some(result)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, key: CacheKey, result: bool) {
        self.touch(&key);
        self.entries.insert(key, result);
        while self.lru.len() > self.capacity {
            if let Some(oldest) = self.lru.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn ctx() -> ConfigurationContext {
        ConfigurationContext::new()
            .with("quantity", 1)
            .with("greeting", "Hello")
            .with("width", "1200")
            .with("color", "")
            .with("features", json!(["tilt", "turn", "lock"]))
            .with("frame", json!({"material": "wood", "depth": 70}))
            .with("tempered", true)
    }

    fn check(op: &str, field: &str, value: Value) -> bool {
        RuleNode::parse(&json!({"op": op, "field": field, "value": value}))
            .unwrap()
            .evaluate(&ctx())
    }

    #[rstest]
    #[case("equals", "quantity", json!("1"), true)]
    #[case("equals", "width", json!(1200), true)]
    #[case("equals", "tempered", json!("true"), true)]
    #[case("equals", "tempered", json!(1), true)]
    #[case("equals", "greeting", json!("hello"), false)]
    #[case("equals", "missing", json!(null), true)]
    #[case("not_equals", "quantity", json!(2), true)]
    #[case("greater_than", "width", json!(1000), true)]
    #[case("greater_than", "missing", json!(-1), true)]
    #[case("less_than", "greeting", json!(1), true)]
    #[case("greater_equal", "frame.depth", json!(70), true)]
    #[case("less_equal", "frame.depth", json!("69"), false)]
    #[case("contains", "greeting", json!("ell"), true)]
    #[case("contains", "greeting", json!("ELL"), true)]
    #[case("contains", "features", json!("TURN"), true)]
    #[case("contains", "missing", json!("x"), false)]
    #[case("starts_with", "frame.material", json!("WO"), true)]
    #[case("ends_with", "greeting", json!("LO"), true)]
    #[case("matches_pattern", "greeting", json!("^H.l+o$"), true)]
    #[case("matches_pattern", "greeting", json!("([a-z"), false)]
    #[case("matches_pattern", "missing", json!(".*"), false)]
    #[case("in", "quantity", json!([1, 2, 3]), true)]
    #[case("in", "missing", json!([null]), false)]
    #[case("not_in", "frame.material", json!(["pvc", "aluminum"]), true)]
    #[case("any_of", "features", json!(["lock", "vent"]), true)]
    #[case("any_of", "features", json!(["vent"]), false)]
    #[case("all_of", "features", json!(["tilt", "lock"]), true)]
    #[case("all_of", "features", json!(["tilt", "vent"]), false)]
    #[case("exists", "greeting", json!(null), true)]
    #[case("exists", "color", json!(null), false)]
    #[case("not_exists", "frame.missing.deeper", json!(null), true)]
    #[case("is_empty", "color", json!(null), true)]
    #[case("is_empty", "missing", json!(null), true)]
    #[case("is_not_empty", "features", json!(null), true)]
    fn given_leaf_rule_when_evaluating_then_follows_operator_semantics(
        #[case] op: &str,
        #[case] field: &str,
        #[case] value: Value,
        #[case] expected: bool,
    ) {
        assert_eq!(check(op, field, value.clone()), expected, "{op} {field} {value}");
    }

    #[test]
    fn given_empty_operands_when_evaluating_then_and_true_or_false() {
        assert!(RuleNode::and(vec![]).evaluate(&ctx()));
        assert!(!RuleNode::or(vec![]).evaluate(&ctx()));
    }

    #[test]
    fn given_nested_logic_when_evaluating_then_combines() {
        let rule = RuleNode::parse(&json!({
            "op": "and",
            "operands": [
                {"op": "equals", "field": "frame.material", "value": "wood"},
                {"op": "not", "operands": [
                    {"op": "greater_than", "field": "width", "value": 2000}
                ]},
                {"op": "or", "operands": [
                    {"op": "is_empty", "field": "features"},
                    {"op": "contains", "field": "features", "value": "lock"}
                ]}
            ]
        }))
        .unwrap();
        assert!(rule.evaluate(&ctx()));
    }

    #[rstest]
    #[case(json!({"op": "sounds_like", "field": "x", "value": 1}))]
    #[case(json!({"op": "not", "operands": []}))]
    #[case(json!({"op": "and"}))]
    #[case(json!({"op": "equals", "value": 1}))]
    #[case(json!({"op": "in", "field": "x", "value": 1}))]
    #[case(json!(["equals"]))]
    fn given_malformed_rule_when_authoring_then_rejected(#[case] raw: Value) {
        let err = RuleNode::parse(&raw).unwrap_err();
        assert!(matches!(err, DomainError::MalformedRule(_)), "{raw}");
    }

    #[test]
    fn given_unknown_operator_when_evaluating_stored_rule_then_fails_open() {
        let rule = RuleNode::parse_lenient(&json!({"op": "sounds_like", "field": "x", "value": 1}));
        assert!(matches!(
            rule,
            RuleNode::Leaf {
                op: Operator::Unrecognized(_),
                ..
            }
        ));
        assert!(rule.evaluate(&ctx()));
    }

    #[test]
    fn given_structurally_broken_stored_rule_when_evaluating_then_fails_open() {
        let rule = RuleNode::parse_lenient(&json!({"op": "or", "operands": "oops"}));
        assert!(rule.evaluate(&ctx()));
    }

    #[rstest]
    #[case(json!({"op": "not", "operands": [
        {"op": "sounds_like", "field": "x", "value": 1}
    ]}))]
    #[case(json!({"op": "and", "operands": [
        {"op": "equals", "field": "quantity", "value": 1},
        {"op": "not", "operands": [{"op": "sounds_like", "field": "x", "value": 1}]}
    ]}))]
    #[case(json!({"op": "not", "operands": [
        {"op": "or", "operands": [{"op": "sounds_like", "field": "x", "value": 1}]}
    ]}))]
    #[case(json!({"op": "and", "operands": [
        {"op": "exists", "field": "width"},
        {"op": "not", "operands": []}
    ]}))]
    fn given_unknown_operator_under_negation_when_evaluating_then_whole_rule_satisfied(#[case] raw: Value) {
        // Arrange
        let rule = RuleNode::parse_lenient(&raw);

        // Act
        let plain = rule.evaluate(&ctx());
        let cached = rule.evaluate_cached(&ctx(), &mut EvaluationCache::default());

        // Assert
        assert!(rule.has_unrecognized(), "{raw}");
        assert!(plain, "{raw}");
        assert!(cached, "{raw}");
    }

    #[test]
    fn given_known_rule_under_negation_when_evaluating_then_still_negates() {
        let rule = RuleNode::parse_lenient(&json!({"op": "not", "operands": [
            {"op": "equals", "field": "quantity", "value": 1}
        ]}));
        assert!(!rule.has_unrecognized());
        assert!(!rule.evaluate(&ctx()));
    }

    #[test]
    fn given_rule_when_round_tripping_json_then_identical() {
        let raw = json!({"op": "or", "operands": [
            {"op": "exists", "field": "width"},
            {"op": "in", "field": "color", "value": ["red", "blue"]}
        ]});
        let rule: RuleNode = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&rule).unwrap(), raw);
    }

    #[test]
    fn given_cache_when_evaluating_twice_then_second_is_hit_with_same_result() {
        let rule = RuleNode::leaf(Operator::Equals, "quantity", 1);
        let mut cache = EvaluationCache::new(8);

        let first = rule.evaluate_cached(&ctx(), &mut cache);
        let second = rule.evaluate_cached(&ctx(), &mut cache);

        assert_eq!(first, second);
        assert!(first);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn given_changed_context_when_evaluating_cached_then_not_stale() {
        let rule = RuleNode::leaf(Operator::Equals, "quantity", 1);
        let mut cache = EvaluationCache::new(8);

        assert!(rule.evaluate_cached(&ctx(), &mut cache));
        assert!(!rule.evaluate_cached(&ctx().with("quantity", 5), &mut cache));
    }

    #[test]
    fn given_full_cache_when_inserting_then_evicts_least_recent() {
        let mut cache = EvaluationCache::new(2);
        let rules: Vec<_> = (0..3)
            .map(|i| RuleNode::leaf(Operator::Equals, "quantity", i))
            .collect();
        for rule in &rules {
            rule.evaluate_cached(&ctx(), &mut cache);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn given_many_distinct_rules_and_contexts_when_cached_then_each_matches_fresh_evaluation() {
        // Arrange
        let values = [json!(1), json!("1"), json!(1.5), json!(true), json!(null), json!([1])];
        let contexts: Vec<_> = values
            .iter()
            .map(|v| ConfigurationContext::new().with("quantity", v.clone()))
            .collect();
        let mut rules = Vec::new();
        for op in [Operator::Equals, Operator::NotEquals, Operator::GreaterThan, Operator::Exists] {
            for v in &values {
                rules.push(RuleNode::leaf(op.clone(), "quantity", v.clone()));
            }
        }
        let mut cache = EvaluationCache::new(4096);

        // Act / Assert: every pair twice, so the second round reads only cached entries
        for _ in 0..2 {
            for rule in &rules {
                for ctx in &contexts {
                    assert_eq!(rule.evaluate_cached(ctx, &mut cache), rule.evaluate(ctx), "{rule:?} {ctx:?}");
                }
            }
        }
        assert_eq!(cache.len(), rules.len() * contexts.len());
    }
}
