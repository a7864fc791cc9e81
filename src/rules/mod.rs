//! Rules: a condition, the values of its free variables, the compiled
//! predicate and the belief masses, always carried together.

pub mod bundle;
pub mod generate;
pub mod mass;

pub use bundle::{EncodedRule, RuleBundle};
pub use generate::RuleGenerator;
pub use mass::MassVector;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::condition::{
    compile_node, label_index_bindings, parse_rule_source, position_index_bindings, Bindings, Comparison,
    ConditionError, ConditionNode, Predicate, Scalar, ValueExpression, ROW_NAME,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("invalid masses {values:?}: {reason}")]
    InvalidMasses { values: Vec<f64>, reason: String },

    #[error("{rules} rules but {masses} mass vectors and {labels} labels")]
    LengthMismatch { rules: usize, masses: usize, labels: usize },

    #[error("mass vector has {found} slots, expected {expected}")]
    MassArity { expected: usize, found: usize },
}

/// How many rows a rule covers
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coverage {
    pub coverage: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone)]
pub struct Rule {
    condition: ConditionNode,
    bindings: Bindings,
    predicate: Predicate,
    caption: String,
    masses: Option<MassVector>,
}

impl Rule {
    /// Compiles the condition against the ordered columns. Without a
    /// caption, one is derived from the condition with its bound values
    /// filled in.
    pub fn compile(
        condition: ConditionNode,
        bindings: Bindings,
        columns: &[String],
        caption: Option<String>,
    ) -> Result<Self, RuleError> {
        let predicate = compile_node(&condition, columns, &bindings)?;
        let caption = caption.unwrap_or_else(|| describe(&condition, &bindings, columns));
        Ok(Self { condition, bindings, predicate, caption, masses: None })
    }

    /// Parses `x[0] > 5` or `lambda x, var0=1: x[var0] > 5`
    pub fn from_source(text: &str, columns: &[String]) -> Result<Self, RuleError> {
        let parsed = parse_rule_source(text)?;
        let bindings = position_index_bindings(&parsed.condition, &parsed.bindings, columns);
        Self::compile(parsed.condition, bindings, columns, None)
    }

    pub fn with_masses(mut self, masses: MassVector) -> Self {
        self.masses = Some(masses);
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    pub fn condition(&self) -> &ConditionNode {
        &self.condition
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    pub fn masses(&self) -> Option<&MassVector> {
        self.masses.as_ref()
    }

    pub fn matches(&self, row: &[f64]) -> bool {
        self.predicate.evaluate(row)
    }

    pub fn coverage(&self, rows: &[Vec<f64>]) -> Coverage {
        let covered = rows.iter().filter(|row| self.matches(row)).count();
        let total = rows.len();
        let percentage = if total == 0 {
            0.0
        } else {
            (covered as f64 / total as f64 * 10000.0).round() / 100.0
        };
        Coverage { coverage: covered, total, percentage }
    }

    pub fn to_canonical(&self) -> Value {
        self.condition.to_canonical()
    }

    /// Bindings with index positions replaced by column names
    pub fn labeled_bindings(&self, columns: &[String]) -> Bindings {
        label_index_bindings(&self.condition, &self.bindings, columns)
    }
}

/// Caption text: bound values are substituted, positional subscripts are
/// shown as column names.
fn describe(condition: &ConditionNode, bindings: &Bindings, columns: &[String]) -> String {
    readable(condition, bindings, columns).to_string()
}

fn readable(node: &ConditionNode, bindings: &Bindings, columns: &[String]) -> ConditionNode {
    let comparison = |cmp: &Comparison| {
        Comparison::new(substitute(&cmp.left, bindings, columns), cmp.op, substitute(&cmp.right, bindings, columns))
    };
    match node {
        ConditionNode::Comparison(cmp) => ConditionNode::Comparison(comparison(cmp)),
        ConditionNode::ChainedComparison(items) => ConditionNode::ChainedComparison(items.iter().map(comparison).collect()),
        ConditionNode::BooleanCombination { op, children } => ConditionNode::BooleanCombination {
            op: *op,
            children: children.iter().map(|c| readable(c, bindings, columns)).collect(),
        },
    }
}

fn substitute(value: &ValueExpression, bindings: &Bindings, columns: &[String]) -> ValueExpression {
    let column_at = |scalar: &Scalar| {
        scalar
            .as_position()
            .and_then(|p| usize::try_from(p).ok())
            .and_then(|p| columns.get(p).cloned())
    };
    match value {
        ValueExpression::Variable(name) => match bindings.get(name) {
            Some(Scalar::Text(text)) => ValueExpression::variable(text.as_str()),
            Some(scalar) => ValueExpression::Constant(scalar.clone()),
            None => value.clone(),
        },
        ValueExpression::Subscript { base, index } if matches!(base.as_ref(), ValueExpression::Variable(b) if b == ROW_NAME) => {
            let column = match index.as_ref() {
                ValueExpression::Constant(scalar) => column_at(scalar),
                ValueExpression::Variable(name) => match bindings.get(name) {
                    Some(Scalar::Text(text)) => Some(text.clone()),
                    Some(scalar) => column_at(scalar),
                    None => None,
                },
                _ => None,
            };
            column.map(ValueExpression::Variable).unwrap_or_else(|| value.clone())
        }
        ValueExpression::BinaryOp { op, left, right } => {
            ValueExpression::binary(*op, substitute(left, bindings, columns), substitute(right, bindings, columns))
        }
        ValueExpression::Subscript { .. } | ValueExpression::Constant(_) | ValueExpression::Opaque(_) => value.clone(),
    }
}
