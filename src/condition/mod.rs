//! Condition Representation Engine
//!
//! Typed condition trees over an ordered numeric row, their canonical JSON
//! form, and the conversions between source text, trees and predicates:
//! - `syntax`: tokenizer and expression parser for rule source text
//! - `parser`: source expression -> `ConditionNode`
//! - `compiler`: canonical JSON -> executable `Predicate`
//! - `indices`: which free variables are used as column positions

pub mod compiler;
mod error;
pub mod indices;
pub mod parser;
pub mod syntax;

pub use compiler::{compile, compile_node, Predicate};
pub use error::ConditionError;
pub use indices::{collect_index_variables, label_index_bindings, position_index_bindings};
pub use parser::{parse_condition, parse_expression, parse_rule_source, ConditionParser, ParsedRule};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the row parameter in canonical conditions (`x[0]`, `x[var0]`)
pub const ROW_NAME: &str = "x";

/// Values of the free variables of a rule, by name
pub type Bindings = BTreeMap<String, Scalar>;

/// A literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => json!(b),
            Scalar::Int(i) => json!(i),
            Scalar::Float(f) => json!(f),
            Scalar::Text(s) => json!(s),
        }
    }

    /// Numeric view: bools count as 0/1, text and null have none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Null | Scalar::Text(_) => None,
        }
    }

    /// Integral numeric view, used for column positions
    pub fn as_position(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<usize> for Scalar {
    fn from(v: usize) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

/// Float text as rule captions print it: shortest round-trip digits,
/// scientific below 1e-4 and from 1e16 on, with a signed two-digit exponent
fn float_text(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let scientific = format!("{:e}", v);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return format!("{:?}", v);
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if v != 0.0 && !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        format!("{:?}", v)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "None"),
            Scalar::Bool(true) => write!(f, "True"),
            Scalar::Bool(false) => write!(f, "False"),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(v) => f.write_str(&float_text(*v)),
            Scalar::Text(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
        }
    }
}

/// Arithmetic operators allowed inside operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    FloorDiv,
}

impl ArithOp {
    pub const ALL: [ArithOp; 7] = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Div,
        ArithOp::Mod,
        ArithOp::Pow,
        ArithOp::FloorDiv,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Pow => "**",
            ArithOp::FloorDiv => "//",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.symbol() == symbol)
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Comparator {
    pub const ALL: [Comparator; 6] = [
        Comparator::Gt,
        Comparator::Lt,
        Comparator::Ge,
        Comparator::Le,
        Comparator::Eq,
        Comparator::Ne,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.symbol() == symbol)
    }

    /// The operator that holds after swapping both sides
    pub fn mirrored(self) -> Self {
        match self {
            Comparator::Gt => Comparator::Lt,
            Comparator::Lt => Comparator::Gt,
            Comparator::Ge => Comparator::Le,
            Comparator::Le => Comparator::Ge,
            Comparator::Eq => Comparator::Eq,
            Comparator::Ne => Comparator::Ne,
        }
    }
}

/// Boolean connectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub fn keyword(self) -> &'static str {
        match self {
            BoolOp::And => "and",
            BoolOp::Or => "or",
        }
    }
}

/// One operand of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpression {
    Variable(String),
    Subscript {
        base: Box<ValueExpression>,
        index: Box<ValueExpression>,
    },
    Constant(Scalar),
    BinaryOp {
        op: ArithOp,
        left: Box<ValueExpression>,
        right: Box<ValueExpression>,
    },
    /// Source text of an operand outside the grammar. Serialized as a
    /// plain string, so it comes back as a `Variable`.
    Opaque(String),
}

impl ValueExpression {
    pub fn variable(name: impl Into<String>) -> Self {
        ValueExpression::Variable(name.into())
    }

    pub fn constant(value: impl Into<Scalar>) -> Self {
        ValueExpression::Constant(value.into())
    }

    pub fn subscript(base: ValueExpression, index: ValueExpression) -> Self {
        ValueExpression::Subscript { base: Box::new(base), index: Box::new(index) }
    }

    /// `x[index]`
    pub fn row_item(index: ValueExpression) -> Self {
        Self::subscript(Self::variable(ROW_NAME), index)
    }

    pub fn binary(op: ArithOp, left: ValueExpression, right: ValueExpression) -> Self {
        ValueExpression::BinaryOp { op, left: Box::new(left), right: Box::new(right) }
    }

    /// Names and subscripts are the sides a comparison is normalized around
    pub fn is_variable_bearing(&self) -> bool {
        matches!(self, ValueExpression::Variable(_) | ValueExpression::Subscript { .. })
    }

    pub fn to_canonical(&self) -> Value {
        match self {
            ValueExpression::Variable(name) | ValueExpression::Opaque(name) => json!(name),
            ValueExpression::Constant(scalar) => scalar.to_json(),
            ValueExpression::Subscript { base, index } => json!({
                "base": base.to_canonical(),
                "index": index.to_canonical(),
            }),
            ValueExpression::BinaryOp { op, left, right } => json!({
                "op": op.symbol(),
                "left": left.to_canonical(),
                "right": right.to_canonical(),
            }),
        }
    }

    pub fn from_canonical(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::String(name) => Ok(ValueExpression::Variable(name.clone())),
            Value::Object(map) => {
                if let (Some(base), Some(index)) = (map.get("base"), map.get("index")) {
                    return Ok(Self::subscript(Self::from_canonical(base)?, Self::from_canonical(index)?));
                }
                let (Some(op), Some(left), Some(right)) = (map.get("op"), map.get("left"), map.get("right")) else {
                    return Err(ConditionError::malformed(format!("not an operand: {}", value)));
                };
                let symbol = op
                    .as_str()
                    .ok_or_else(|| ConditionError::malformed(format!("operator must be a string: {}", op)))?;
                let op = ArithOp::from_symbol(symbol)
                    .ok_or_else(|| ConditionError::UnknownOperator(symbol.to_string()))?;
                Ok(Self::binary(op, Self::from_canonical(left)?, Self::from_canonical(right)?))
            }
            Value::Array(_) => Err(ConditionError::malformed(format!("not an operand: {}", value))),
            scalar => Ok(ValueExpression::Constant(Scalar::from_json(scalar).unwrap_or(Scalar::Null))),
        }
    }
}

impl fmt::Display for ValueExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpression::Variable(name) | ValueExpression::Opaque(name) => write!(f, "{}", name),
            ValueExpression::Constant(scalar) => write!(f, "{}", scalar),
            ValueExpression::Subscript { base, index } => write!(f, "{}[{}]", base, index),
            ValueExpression::BinaryOp { op, left, right } => {
                fmt_operand(f, left)?;
                write!(f, " {} ", op.symbol())?;
                fmt_operand(f, right)
            }
        }
    }
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, value: &ValueExpression) -> fmt::Result {
    match value {
        ValueExpression::BinaryOp { .. } => write!(f, "({})", value),
        _ => write!(f, "{}", value),
    }
}

/// A single pairwise test. `left` holds the variable-bearing side whenever
/// exactly one side is variable-bearing.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: ValueExpression,
    pub op: Comparator,
    pub right: ValueExpression,
}

impl Comparison {
    pub fn new(left: ValueExpression, op: Comparator, right: ValueExpression) -> Self {
        Self { left, op, right }
    }

    /// Builds the comparison with the variable-bearing side on the left,
    /// mirroring the operator when the sides are swapped.
    pub fn normalized(left: ValueExpression, op: Comparator, right: ValueExpression) -> Self {
        if right.is_variable_bearing() && !left.is_variable_bearing() {
            Self::new(right, op.mirrored(), left)
        } else {
            Self::new(left, op, right)
        }
    }

    pub fn to_canonical(&self) -> Value {
        json!({
            "left": self.left.to_canonical(),
            "op": self.op.symbol(),
            "right": self.right.to_canonical(),
        })
    }

    fn from_map(map: &Map<String, Value>) -> Result<Self, ConditionError> {
        let (Some(left), Some(op), Some(right)) = (map.get("left"), map.get("op"), map.get("right")) else {
            return Err(ConditionError::malformed(format!(
                "comparison needs 'left', 'op' and 'right': {}",
                Value::Object(map.clone())
            )));
        };
        let symbol = op
            .as_str()
            .ok_or_else(|| ConditionError::malformed(format!("operator must be a string: {}", op)))?;
        let op = Comparator::from_symbol(symbol)
            .ok_or_else(|| ConditionError::UnknownOperator(symbol.to_string()))?;
        Ok(Self::new(
            ValueExpression::from_canonical(left)?,
            op,
            ValueExpression::from_canonical(right)?,
        ))
    }

    fn from_canonical(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(ConditionError::malformed(format!("expected a comparison, got {}", other))),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op.symbol(), self.right)
    }
}

/// Canonical tree of a rule condition
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Comparison(Comparison),
    /// `a < b < c`: every item must hold
    ChainedComparison(Vec<Comparison>),
    BooleanCombination { op: BoolOp, children: Vec<ConditionNode> },
}

impl ConditionNode {
    pub fn comparison(left: ValueExpression, op: Comparator, right: ValueExpression) -> Self {
        ConditionNode::Comparison(Comparison::new(left, op, right))
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        ConditionNode::BooleanCombination { op: BoolOp::And, children }
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        ConditionNode::BooleanCombination { op: BoolOp::Or, children }
    }

    /// Serializes to the exchange format. Chains are written as the tagged
    /// `{"op": "chain", "values": [...]}` object.
    pub fn to_canonical(&self) -> Value {
        match self {
            ConditionNode::Comparison(cmp) => cmp.to_canonical(),
            ConditionNode::ChainedComparison(items) => json!({
                "op": "chain",
                "values": items.iter().map(Comparison::to_canonical).collect::<Vec<_>>(),
            }),
            ConditionNode::BooleanCombination { op, children } => json!({
                "op": op.keyword(),
                "values": children.iter().map(ConditionNode::to_canonical).collect::<Vec<_>>(),
            }),
        }
    }

    /// Reads the exchange format. A bare list is accepted as the legacy
    /// spelling of a chain; a single-item chain collapses to a comparison.
    pub fn from_canonical(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::Array(items) => Self::chain_from(items),
            Value::Object(map) => match map.get("op").and_then(Value::as_str) {
                Some(keyword @ ("and" | "or")) => {
                    let values = values_of(map, keyword)?;
                    if values.is_empty() {
                        return Err(ConditionError::malformed(format!("'{}' without operands", keyword)));
                    }
                    let children = values
                        .iter()
                        .map(Self::from_canonical)
                        .collect::<Result<Vec<_>, _>>()?;
                    let op = if keyword == "and" { BoolOp::And } else { BoolOp::Or };
                    Ok(ConditionNode::BooleanCombination { op, children })
                }
                Some("chain") => Self::chain_from(values_of(map, "chain")?),
                Some(_) => Ok(ConditionNode::Comparison(Comparison::from_map(map)?)),
                None => Err(ConditionError::malformed(format!("condition without 'op': {}", value))),
            },
            other => Err(ConditionError::malformed(format!("not a condition: {}", other))),
        }
    }

    fn chain_from(items: &[Value]) -> Result<Self, ConditionError> {
        let mut comparisons = items
            .iter()
            .map(Comparison::from_canonical)
            .collect::<Result<Vec<_>, _>>()?;
        match comparisons.len() {
            0 => Err(ConditionError::malformed("empty comparison chain")),
            1 => Ok(ConditionNode::Comparison(comparisons.remove(0))),
            _ => Ok(ConditionNode::ChainedComparison(comparisons)),
        }
    }
}

fn values_of<'a>(map: &'a Map<String, Value>, keyword: &str) -> Result<&'a Vec<Value>, ConditionError> {
    map.get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| ConditionError::malformed(format!("'{}' needs a 'values' list", keyword)))
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionNode::Comparison(cmp) => write!(f, "{}", cmp),
            ConditionNode::ChainedComparison(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " and ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            ConditionNode::BooleanCombination { op, children } => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.keyword())?;
                    }
                    let nested = match child {
                        ConditionNode::BooleanCombination { op: inner, .. } => inner != op,
                        ConditionNode::ChainedComparison(_) => *op == BoolOp::Or,
                        ConditionNode::Comparison(_) => false,
                    };
                    if nested {
                        write!(f, "({})", child)?;
                    } else {
                        write!(f, "{}", child)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl Serialize for ConditionNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_canonical().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConditionNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ConditionNode::from_canonical(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x_gt_5() -> ConditionNode {
        ConditionNode::comparison(ValueExpression::variable("x"), Comparator::Gt, ValueExpression::constant(5i64))
    }

    #[test]
    fn test_comparison_canonical_shape() {
        assert_eq!(x_gt_5().to_canonical(), json!({"left": "x", "op": ">", "right": 5}));
    }

    #[test]
    fn test_chain_is_tagged_and_bare_list_is_accepted() {
        let chain = ConditionNode::ChainedComparison(vec![
            Comparison::new(ValueExpression::variable("x"), Comparator::Gt, ValueExpression::constant(0i64)),
            Comparison::new(ValueExpression::variable("x"), Comparator::Lt, ValueExpression::constant(2i64)),
        ]);
        let canonical = chain.to_canonical();
        assert_eq!(canonical["op"], "chain");
        assert_eq!(ConditionNode::from_canonical(&canonical).unwrap(), chain);

        let legacy = json!([
            {"left": "x", "op": ">", "right": 0},
            {"left": "x", "op": "<", "right": 2}
        ]);
        assert_eq!(ConditionNode::from_canonical(&legacy).unwrap(), chain);
    }

    #[test]
    fn test_single_item_list_collapses() {
        let legacy = json!([{"left": "x", "op": ">", "right": 5}]);
        assert_eq!(ConditionNode::from_canonical(&legacy).unwrap(), x_gt_5());
    }

    #[test]
    fn test_nested_operands_survive_canonical_form() {
        let node = ConditionNode::and(vec![
            ConditionNode::comparison(
                ValueExpression::row_item(ValueExpression::variable("var0")),
                Comparator::Le,
                ValueExpression::variable("var1"),
            ),
            ConditionNode::comparison(
                ValueExpression::binary(ArithOp::FloorDiv, ValueExpression::variable("y"), ValueExpression::constant(2i64)),
                Comparator::Ne,
                ValueExpression::constant(1.5),
            ),
        ]);
        let value = node.to_canonical();
        assert_eq!(value["values"][0]["left"], json!({"base": "x", "index": "var0"}));
        assert_eq!(value["values"][1]["left"]["op"], "//");
        assert_eq!(ConditionNode::from_canonical(&value).unwrap(), node);
    }

    #[test]
    fn test_unknown_operators_are_rejected() {
        let err = ConditionNode::from_canonical(&json!({"left": "x", "op": "=~", "right": 1})).unwrap_err();
        assert_eq!(err, ConditionError::UnknownOperator("=~".into()));

        let err = ConditionNode::from_canonical(&json!({
            "left": {"op": "^", "left": "x", "right": 1}, "op": ">", "right": 1
        }))
        .unwrap_err();
        assert_eq!(err, ConditionError::UnknownOperator("^".into()));
    }

    #[test]
    fn test_malformed_conditions() {
        assert!(matches!(
            ConditionNode::from_canonical(&json!(5)),
            Err(ConditionError::MalformedCondition(_))
        ));
        assert!(matches!(
            ConditionNode::from_canonical(&json!({"op": "and", "values": []})),
            Err(ConditionError::MalformedCondition(_))
        ));
        assert!(matches!(
            ConditionNode::from_canonical(&json!([])),
            Err(ConditionError::MalformedCondition(_))
        ));
    }

    #[test]
    fn test_display_reads_like_source() {
        let node = ConditionNode::or(vec![
            ConditionNode::and(vec![x_gt_5(), x_gt_5()]),
            ConditionNode::comparison(
                ValueExpression::binary(
                    ArithOp::Mul,
                    ValueExpression::binary(ArithOp::Add, ValueExpression::variable("a"), ValueExpression::constant(1i64)),
                    ValueExpression::constant(2i64),
                ),
                Comparator::Eq,
                ValueExpression::constant(true),
            ),
        ]);
        assert_eq!(node.to_string(), "(x > 5 and x > 5) or (a + 1) * 2 == True");
    }

    #[test]
    fn test_float_text_matches_caption_style() {
        let cases = [
            (1e20, "1e+20"),
            (-1e20, "-1e+20"),
            (1e16, "1e+16"),
            (1.5e-5, "1.5e-05"),
            (2.5e-123, "2.5e-123"),
            (1e15, "1000000000000000.0"),
            (0.0001, "0.0001"),
            (5.0, "5.0"),
            (0.0, "0.0"),
            (1.234, "1.234"),
            (f64::INFINITY, "inf"),
            (f64::NAN, "nan"),
        ];
        for (value, text) in cases {
            assert_eq!(Scalar::Float(value).to_string(), text);
        }
    }

    #[test]
    fn test_scalar_untagged_serde() {
        let bindings: Bindings = serde_json::from_value(json!({"a": 1, "b": 2.5, "c": "petal", "d": null, "e": true})).unwrap();
        assert_eq!(bindings["a"], Scalar::Int(1));
        assert_eq!(bindings["b"], Scalar::Float(2.5));
        assert_eq!(bindings["c"], Scalar::Text("petal".into()));
        assert_eq!(bindings["d"], Scalar::Null);
        assert_eq!(bindings["e"], Scalar::Bool(true));
    }
}
