// Condition trees for payload-driven routing decisions

//! # Condition Evaluation
//!
//! Conditions decide two things in the router:
//! - whether an inbound routing entry re-classifies an event (entity/action override)
//! - whether an outbound rule fires at all
//!
//! A condition is a tree. Inner nodes are `all` (AND) and `any` (OR); leaves
//! compare a value found at a path in the canonical payload against a
//! constant:
//!
//! ```json
//! { "all": [
//!     { "left": "type", "operator": "=", "right": "driver" },
//!     { "any": [
//!         { "left": "address.city", "operator": "in", "right": ["Curitiba", "Londrina"] },
//!         { "left": "tags", "operator": "contains", "right": "vip" }
//!     ]}
//! ]}
//! ```
//!
//! Stored documents may also hold a bare array (an implicit `all`) or an empty
//! object, which means "no condition".
//!
//! ## Two Evaluation Modes
//!
//! - [`ConditionNode::evaluate`] is total: it never fails, type mismatches and
//!   missing paths simply do not match, and configuration errors (a regex that
//!   does not compile, an `in` without an array) are logged and evaluate to
//!   `false`.
//! - [`ConditionNode::try_evaluate`] is strict and reports those situations as
//!   [`EvaluationError`] so callers with an `onError: fail` policy can abort.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive Sum Types
//! `ConditionNode` holds `Vec<ConditionNode>` in two variants. A `Vec` already
//! stores its elements on the heap, so no `Box` is needed to give the enum a
//! known size.
//!
//! ### Custom Serde Conversions
//! The JSON shape of a condition is "whichever keys are present", which does
//! not map onto serde's tagged enums. `#[serde(try_from = "Value")]` lets us
//! deserialize into a `serde_json::Value` first and then convert by hand,
//! returning an error for unknown shapes and operators.
//!
//! ### Short-Circuiting Iterators
//! `Iterator::all` and `Iterator::any` stop at the first decisive element,
//! giving AND/OR their usual short-circuit behaviour for free.

use std::fmt;

use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

use crate::RouterError;

lazy_static! {
    /// Compiled regex patterns keyed by their source text
    static ref REGEX_CACHE: DashMap<String, Regex> = DashMap::new();
}

/// Comparison operators available to condition leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "not_exists")]
    NotExists,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not_empty")]
    NotEmpty,
    #[serde(rename = "regex")]
    Regex,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Exists => "exists",
            Operator::NotExists => "not_exists",
            Operator::Empty => "empty",
            Operator::NotEmpty => "not_empty",
            Operator::Regex => "regex",
        }
    }

    /// Operators whose answer on an absent value is "yes, it is not there"
    fn holds_when_absent(self) -> bool {
        matches!(self, Operator::Ne | Operator::NotIn | Operator::NotContains)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Why a strict evaluation could not produce an answer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("path '{path}' is not present in the payload")]
    MissingPath { path: String },

    #[error("operator '{operator}' cannot be applied to the value at '{path}'")]
    TypeMismatch { path: String, operator: Operator },

    #[error("invalid regex pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("operator '{operator}' has an invalid right operand: {message}")]
    InvalidOperand { operator: Operator, message: String },
}

impl EvaluationError {
    /// Configuration errors come from the rule, not from the payload
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EvaluationError::InvalidPattern { .. } | EvaluationError::InvalidOperand { .. }
        )
    }
}

/// A single `left operator right` comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    /// Path into the canonical payload
    pub left: String,
    pub operator: Operator,
    /// Constant operand, ignored by presence/emptiness operators
    pub right: Value,
}

/// A boolean condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum ConditionNode {
    /// Logical AND. Empty is true.
    All(Vec<ConditionNode>),
    /// Logical OR. Empty is false.
    Any(Vec<ConditionNode>),
    Leaf(Comparison),
}

impl ConditionNode {
    pub fn all(nodes: Vec<ConditionNode>) -> Self {
        ConditionNode::All(nodes)
    }

    pub fn any(nodes: Vec<ConditionNode>) -> Self {
        ConditionNode::Any(nodes)
    }

    pub fn leaf(left: &str, operator: Operator, right: Value) -> Self {
        ConditionNode::Leaf(Comparison {
            left: left.to_string(),
            operator,
            right,
        })
    }

    /// Total evaluation: never fails, configuration errors are logged and
    /// count as "no match"
    pub fn evaluate(&self, payload: &Value) -> bool {
        match self {
            ConditionNode::All(nodes) => nodes.iter().all(|node| node.evaluate(payload)),
            ConditionNode::Any(nodes) => nodes.iter().any(|node| node.evaluate(payload)),
            ConditionNode::Leaf(comparison) => match comparison.compare(payload, false) {
                Ok(result) => result,
                Err(err) => {
                    error!(
                        path = %comparison.left,
                        operator = %comparison.operator,
                        "condition evaluated to false: {}",
                        err
                    );
                    false
                }
            },
        }
    }

    /// Strict evaluation: missing paths, type mismatches and configuration
    /// errors are returned to the caller
    pub fn try_evaluate(&self, payload: &Value) -> Result<bool, EvaluationError> {
        match self {
            ConditionNode::All(nodes) => {
                for node in nodes {
                    if !node.try_evaluate(payload)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionNode::Any(nodes) => {
                for node in nodes {
                    if node.try_evaluate(payload)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionNode::Leaf(comparison) => comparison.compare(payload, true),
        }
    }

    /// Check the parts of the tree that do not depend on a payload
    ///
    /// Catalogs call this at publish time so a broken regex or a malformed
    /// `in` operand is rejected before any event reaches it.
    pub fn validate(&self) -> Result<(), EvaluationError> {
        match self {
            ConditionNode::All(nodes) | ConditionNode::Any(nodes) => {
                nodes.iter().try_for_each(ConditionNode::validate)
            }
            ConditionNode::Leaf(comparison) => comparison.check_operand(),
        }
    }
}

impl Comparison {
    fn check_operand(&self) -> Result<(), EvaluationError> {
        match self.operator {
            Operator::In | Operator::NotIn if !self.right.is_array() => {
                Err(EvaluationError::InvalidOperand {
                    operator: self.operator,
                    message: "expected an array".to_string(),
                })
            }
            Operator::Regex => cached_regex(&self.right).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn compare(&self, payload: &Value, strict: bool) -> Result<bool, EvaluationError> {
        self.check_operand()?;

        let found = resolve_path(payload, &self.left);
        match self.operator {
            Operator::Exists => return Ok(found.is_some()),
            Operator::NotExists => return Ok(found.is_none()),
            Operator::Empty => return Ok(found.map_or(true, is_empty_value)),
            Operator::NotEmpty => return Ok(!found.map_or(true, is_empty_value)),
            _ => {}
        }

        let left = match found {
            Some(value) => value,
            None if strict => {
                return Err(EvaluationError::MissingPath {
                    path: self.left.clone(),
                })
            }
            None => return Ok(self.operator.holds_when_absent()),
        };

        let outcome = match self.operator {
            Operator::Eq => Some(loose_eq(left, &self.right)),
            Operator::Ne => Some(!loose_eq(left, &self.right)),
            Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
                match (as_number(left), as_number(&self.right)) {
                    (Some(a), Some(b)) => Some(match self.operator {
                        Operator::Gt => a > b,
                        Operator::Lt => a < b,
                        Operator::Gte => a >= b,
                        _ => a <= b,
                    }),
                    _ => None,
                }
            }
            Operator::In | Operator::NotIn => {
                let found = self
                    .right
                    .as_array()
                    .map_or(false, |items| items.iter().any(|item| loose_eq(left, item)));
                Some(if self.operator == Operator::In { found } else { !found })
            }
            Operator::Contains | Operator::NotContains => {
                let found = match left {
                    Value::String(text) => scalar_text(&self.right).map(|needle| text.contains(&needle)),
                    Value::Array(items) => Some(items.iter().any(|item| loose_eq(item, &self.right))),
                    _ => None,
                };
                found.map(|f| if self.operator == Operator::Contains { f } else { !f })
            }
            Operator::StartsWith => match (left.as_str(), scalar_text(&self.right)) {
                (Some(text), Some(prefix)) => Some(text.starts_with(&prefix)),
                _ => None,
            },
            Operator::EndsWith => match (left.as_str(), scalar_text(&self.right)) {
                (Some(text), Some(suffix)) => Some(text.ends_with(&suffix)),
                _ => None,
            },
            Operator::Regex => {
                let pattern = cached_regex(&self.right)?;
                scalar_text(left).map(|text| pattern.is_match(&text))
            }
            Operator::Exists | Operator::NotExists | Operator::Empty | Operator::NotEmpty => {
                unreachable!("presence operators return early")
            }
        };

        match outcome {
            Some(result) => Ok(result),
            None if strict => Err(EvaluationError::TypeMismatch {
                path: self.left.clone(),
                operator: self.operator,
            }),
            None => Ok(false),
        }
    }
}

fn cached_regex(right: &Value) -> Result<Regex, EvaluationError> {
    let source = match right.as_str() {
        Some(source) => source,
        None => {
            return Err(EvaluationError::InvalidPattern {
                pattern: right.to_string(),
                message: "pattern must be a string".to_string(),
            })
        }
    };
    if let Some(compiled) = REGEX_CACHE.get(source) {
        return Ok(compiled.clone());
    }
    let compiled = Regex::new(source).map_err(|err| EvaluationError::InvalidPattern {
        pattern: source.to_string(),
        message: err.to_string(),
    })?;
    REGEX_CACHE.insert(source.to_string(), compiled.clone());
    Ok(compiled)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Numbers, and strings that parse as finite numbers
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Text form of scalars; compound values have none
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// JSON equality where a number also equals its numeric string form
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x == y;
        }
    }
    false
}

enum Segment<'p> {
    Key(&'p str),
    Index(usize),
}

/// Resolve a path inside a JSON document
///
/// Accepted forms: `address.city`, `items[0].name`, `items.0.name`,
/// `$.address.city` and JSON pointers such as `/address/city`.
pub fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.starts_with('/') {
        return payload.pointer(path);
    }
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Some(payload);
    }

    let mut current = payload;
    for segment in parse_segments(path)? {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(fields)) => fields.get(key)?,
            (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            (Segment::Index(index), Value::Array(items)) => items.get(index)?,
            (Segment::Index(index), Value::Object(fields)) => fields.get(&index.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

fn parse_segments(path: &str) -> Option<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            segments.push(Segment::Key(name));
        } else if rest.is_empty() {
            return None;
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let index = rest.get(1..close)?.trim().parse::<usize>().ok()?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    Some(segments)
}

impl TryFrom<Value> for ConditionNode {
    type Error = RouterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(items) => Ok(ConditionNode::All(parse_children(items)?)),
            Value::Object(mut fields) => {
                if let Some(children) = fields.remove("all") {
                    return Ok(ConditionNode::All(parse_child_list("all", children)?));
                }
                if let Some(children) = fields.remove("any") {
                    return Ok(ConditionNode::Any(parse_child_list("any", children)?));
                }
                if fields.is_empty() {
                    return Ok(ConditionNode::All(Vec::new()));
                }
                let left = match fields.remove("left") {
                    Some(Value::String(left)) => left,
                    _ => {
                        return Err(RouterError::Configuration(
                            "condition leaf requires a string 'left' path".to_string(),
                        ))
                    }
                };
                let operator: Operator = fields
                    .remove("operator")
                    .ok_or_else(|| {
                        RouterError::Configuration(format!(
                            "condition on '{}' has no operator",
                            left
                        ))
                    })
                    .and_then(|raw| {
                        serde_json::from_value(raw.clone()).map_err(|_| {
                            RouterError::Configuration(format!("unknown operator {}", raw))
                        })
                    })?;
                let right = fields.remove("right").unwrap_or(Value::Null);
                Ok(ConditionNode::Leaf(Comparison {
                    left,
                    operator,
                    right,
                }))
            }
            other => Err(RouterError::Configuration(format!(
                "condition must be an object or array, got {}",
                other
            ))),
        }
    }
}

fn parse_child_list(kind: &str, children: Value) -> Result<Vec<ConditionNode>, RouterError> {
    match children {
        Value::Array(items) => parse_children(items),
        _ => Err(RouterError::Configuration(format!(
            "'{}' expects an array of conditions",
            kind
        ))),
    }
}

fn parse_children(items: Vec<Value>) -> Result<Vec<ConditionNode>, RouterError> {
    items.into_iter().map(ConditionNode::try_from).collect()
}

impl From<ConditionNode> for Value {
    fn from(node: ConditionNode) -> Self {
        let mut fields = Map::new();
        match node {
            ConditionNode::All(nodes) => {
                fields.insert("all".into(), Value::Array(nodes.into_iter().map(Value::from).collect()));
            }
            ConditionNode::Any(nodes) => {
                fields.insert("any".into(), Value::Array(nodes.into_iter().map(Value::from).collect()));
            }
            ConditionNode::Leaf(comparison) => {
                fields.insert("left".into(), Value::String(comparison.left));
                fields.insert("operator".into(), Value::String(comparison.operator.symbol().into()));
                fields.insert("right".into(), comparison.right);
            }
        }
        Value::Object(fields)
    }
}

/// Serde adapter for optional condition columns
///
/// `null`, a missing field and `{}` all mean "no condition".
pub mod optional {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use super::ConditionNode;

    pub fn serialize<S>(value: &Option<ConditionNode>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<ConditionNode>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match &raw {
            Value::Null => Ok(None),
            Value::Object(fields) if fields.is_empty() => Ok(None),
            _ => ConditionNode::try_from(raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
