use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::sync::Arc;

use super::{
    ArithOp, Bindings, BoolOp, Comparator, Comparison, ConditionError, ConditionNode, Scalar, ValueExpression,
    ROW_NAME,
};

lazy_static! {
    static ref ROW_ITEM: Regex = Regex::new(r"^x\[(\d+)\]$").expect("row item pattern");
}

/// Runtime value of an operand
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(f64),
    Text(String),
    Null,
}

impl From<&Scalar> for Value {
    fn from(scalar: &Scalar) -> Self {
        match scalar {
            Scalar::Text(s) => Value::Text(s.clone()),
            Scalar::Null => Value::Null,
            other => other.as_f64().map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug)]
enum Operand {
    Column(usize),
    Constant(Value),
    Arith {
        op: ArithOp,
        left: Box<Operand>,
        right: Box<Operand>,
    },
}

impl Operand {
    fn eval(&self, row: &[f64]) -> Value {
        match self {
            Operand::Column(i) => Value::Number(row.get(*i).copied().unwrap_or(f64::NAN)),
            Operand::Constant(value) => value.clone(),
            Operand::Arith { op, left, right } => apply(*op, &left.eval(row), &right.eval(row)),
        }
    }
}

fn floored_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

fn apply(op: ArithOp, left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (*a, *b);
            Value::Number(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Mod => floored_mod(a, b),
                ArithOp::Pow => a.powf(b),
                ArithOp::FloorDiv => (a / b).floor(),
            })
        }
        (Value::Text(a), Value::Text(b)) if op == ArithOp::Add => Value::Text(format!("{}{}", a, b)),
        _ => Value::Null,
    }
}

fn compare(op: Comparator, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => {
            return matches!(op, Comparator::Eq);
        }
        // mixed types are never equal and never ordered
        _ => return matches!(op, Comparator::Ne),
    };
    match (op, ordering) {
        (Comparator::Ne, None) => true,
        (_, None) => false,
        (Comparator::Gt, Some(o)) => o == Ordering::Greater,
        (Comparator::Lt, Some(o)) => o == Ordering::Less,
        (Comparator::Ge, Some(o)) => o != Ordering::Less,
        (Comparator::Le, Some(o)) => o != Ordering::Greater,
        (Comparator::Eq, Some(o)) => o == Ordering::Equal,
        (Comparator::Ne, Some(o)) => o != Ordering::Equal,
    }
}

#[derive(Debug)]
enum Compiled {
    All(Vec<Compiled>),
    Any(Vec<Compiled>),
    Compare {
        left: Operand,
        op: Comparator,
        right: Operand,
    },
}

impl Compiled {
    fn eval(&self, row: &[f64]) -> bool {
        match self {
            Compiled::All(items) => items.iter().all(|c| c.eval(row)),
            Compiled::Any(items) => items.iter().any(|c| c.eval(row)),
            Compiled::Compare { left, op, right } => compare(*op, &left.eval(row), &right.eval(row)),
        }
    }
}

/// Executable form of a condition over an ordered numeric row
#[derive(Debug, Clone)]
pub struct Predicate {
    root: Arc<Compiled>,
}

impl Predicate {
    pub fn evaluate(&self, row: &[f64]) -> bool {
        self.root.eval(row)
    }
}

/// Compiles canonical JSON against the ordered column names
pub fn compile(condition: &Json, columns: &[String], bindings: &Bindings) -> Result<Predicate, ConditionError> {
    compile_node(&ConditionNode::from_canonical(condition)?, columns, bindings)
}

pub fn compile_node(
    node: &ConditionNode,
    columns: &[String],
    bindings: &Bindings,
) -> Result<Predicate, ConditionError> {
    let scope = Scope { columns, bindings };
    Ok(Predicate { root: Arc::new(scope.node(node)?) })
}

struct Scope<'a> {
    columns: &'a [String],
    bindings: &'a Bindings,
}

impl Scope<'_> {
    fn node(&self, node: &ConditionNode) -> Result<Compiled, ConditionError> {
        match node {
            ConditionNode::Comparison(cmp) => self.comparison(cmp),
            ConditionNode::ChainedComparison(items) => Ok(Compiled::All(
                items.iter().map(|c| self.comparison(c)).collect::<Result<_, _>>()?,
            )),
            ConditionNode::BooleanCombination { op, children } => {
                let children = children.iter().map(|c| self.node(c)).collect::<Result<_, _>>()?;
                Ok(match op {
                    BoolOp::And => Compiled::All(children),
                    BoolOp::Or => Compiled::Any(children),
                })
            }
        }
    }

    fn comparison(&self, cmp: &Comparison) -> Result<Compiled, ConditionError> {
        Ok(Compiled::Compare {
            left: self.operand(&cmp.left)?,
            op: cmp.op,
            right: self.operand(&cmp.right)?,
        })
    }

    fn operand(&self, value: &ValueExpression) -> Result<Operand, ConditionError> {
        match value {
            ValueExpression::Variable(name) | ValueExpression::Opaque(name) => self.name(name),
            ValueExpression::Constant(scalar) => Ok(Operand::Constant(scalar.into())),
            ValueExpression::Subscript { base, index } => {
                if !matches!(base.as_ref(), ValueExpression::Variable(b) if b == ROW_NAME) {
                    return Err(ConditionError::malformed(format!(
                        "only the row '{}' can be subscripted, got '{}'",
                        ROW_NAME, base
                    )));
                }
                self.index(index)
            }
            ValueExpression::BinaryOp { op, left, right } => {
                let left = self.operand(left)?;
                let right = self.operand(right)?;
                if let (Operand::Constant(a), Operand::Constant(b)) = (&left, &right) {
                    return Ok(Operand::Constant(apply(*op, a, b)));
                }
                Ok(Operand::Arith { op: *op, left: Box::new(left), right: Box::new(right) })
            }
        }
    }

    /// Column name, then `x[<n>]`, then a binding
    fn name(&self, name: &str) -> Result<Operand, ConditionError> {
        if let Some(i) = self.column(name) {
            return Ok(Operand::Column(i));
        }
        if let Some(caps) = ROW_ITEM.captures(name) {
            let position = caps[1]
                .parse::<i64>()
                .map_err(|_| ConditionError::malformed(format!("bad position in '{}'", name)))?;
            return self.position(position).map(Operand::Column);
        }
        match self.bindings.get(name) {
            Some(Scalar::Text(text)) => Ok(match self.column(text) {
                Some(i) => Operand::Column(i),
                None => Operand::Constant(Value::Text(text.clone())),
            }),
            Some(scalar) => Ok(Operand::Constant(scalar.into())),
            None => Err(ConditionError::UnboundVariable(name.to_string())),
        }
    }

    fn index(&self, index: &ValueExpression) -> Result<Operand, ConditionError> {
        let scalar = match index {
            ValueExpression::Constant(scalar) => scalar.clone(),
            ValueExpression::Variable(name) | ValueExpression::Opaque(name) => {
                if let Some(i) = self.column(name) {
                    return Ok(Operand::Column(i));
                }
                self.bindings
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConditionError::UnboundVariable(name.clone()))?
            }
            other => match self.operand(other)? {
                Operand::Constant(Value::Number(n)) => Scalar::Float(n),
                _ => {
                    return Err(ConditionError::unsupported(format!(
                        "subscript index '{}' depends on the row",
                        other
                    )))
                }
            },
        };
        if let Scalar::Text(text) = &scalar {
            return self
                .column(text)
                .map(Operand::Column)
                .ok_or_else(|| ConditionError::UnknownColumn(text.clone()));
        }
        let position = scalar
            .as_position()
            .ok_or_else(|| ConditionError::malformed(format!("subscript index {} is not an integer", scalar)))?;
        self.position(position).map(Operand::Column)
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn position(&self, index: i64) -> Result<usize, ConditionError> {
        let out_of_range = index < 0 || (!self.columns.is_empty() && index as usize >= self.columns.len());
        if out_of_range {
            return Err(ConditionError::ColumnOutOfRange { index, columns: self.columns.len() });
        }
        Ok(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parse_expression;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_column_order_decides_the_row_position() {
        let cond = json!([{"left": "x", "op": ">", "right": 5}]);
        let row = [6.0, 4.0];
        assert!(compile(&cond, &cols(&["x", "y"]), &Bindings::new()).unwrap().evaluate(&row));
        assert!(!compile(&cond, &cols(&["y", "x"]), &Bindings::new()).unwrap().evaluate(&row));
    }

    #[test]
    fn test_boolean_with_arithmetic() {
        let cond = json!({"op": "and", "values": [
            {"left": "x", "op": ">", "right": 5},
            {"left": {"op": "+", "left": "y", "right": 2}, "op": "<", "right": 10}
        ]});
        let predicate = compile(&cond, &cols(&["x", "y"]), &Bindings::new()).unwrap();
        assert!(predicate.evaluate(&[6.0, 7.0]));
        assert!(!predicate.evaluate(&[4.0, 7.0]));
        assert!(!predicate.evaluate(&[6.0, 9.0]));
    }

    #[test]
    fn test_chain_checks_every_item() {
        let node = parse_expression("0 < x < 2").unwrap();
        let predicate = compile(&node.to_canonical(), &cols(&["x"]), &Bindings::new()).unwrap();
        assert!(predicate.evaluate(&[1.0]));
        assert!(!predicate.evaluate(&[3.0]));
        assert!(!predicate.evaluate(&[-1.0]));
    }

    #[test]
    fn test_positional_text_and_bindings() {
        let mut bindings = Bindings::new();
        bindings.insert("var0".into(), Scalar::Int(1));
        bindings.insert("var1".into(), Scalar::Float(2.5));
        let cond = json!({"left": {"base": "x", "index": "var0"}, "op": "<=", "right": "var1"});
        let predicate = compile(&cond, &cols(&["a", "b"]), &bindings).unwrap();
        assert!(predicate.evaluate(&[9.0, 2.5]));
        assert!(!predicate.evaluate(&[0.0, 2.6]));

        let cond = json!({"left": "x[1]", "op": "==", "right": 3});
        assert!(compile(&cond, &cols(&["a", "b"]), &Bindings::new()).unwrap().evaluate(&[0.0, 3.0]));
    }

    #[test]
    fn test_text_binding_naming_a_column() {
        let mut bindings = Bindings::new();
        bindings.insert("var0".into(), Scalar::Text("petal".into()));
        let cond = json!({"left": {"base": "x", "index": "var0"}, "op": ">", "right": 1});
        let predicate = compile(&cond, &cols(&["sepal", "petal"]), &bindings).unwrap();
        assert!(predicate.evaluate(&[0.0, 2.0]));
        assert!(!predicate.evaluate(&[5.0, 0.5]));
    }

    #[test]
    fn test_unbound_and_out_of_range() {
        let err = compile(&json!({"left": "z", "op": ">", "right": 1}), &cols(&["x"]), &Bindings::new()).unwrap_err();
        assert_eq!(err, ConditionError::UnboundVariable("z".into()));

        let err = compile(&json!({"left": "x[4]", "op": ">", "right": 1}), &cols(&["a", "b"]), &Bindings::new())
            .unwrap_err();
        assert_eq!(err, ConditionError::ColumnOutOfRange { index: 4, columns: 2 });

        let err = compile(
            &json!({"left": {"base": "y", "index": 0}, "op": ">", "right": 1}),
            &cols(&["a"]),
            &Bindings::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConditionError::MalformedCondition(_)));
    }

    #[test]
    fn test_numeric_semantics() {
        let empty = Bindings::new();
        let check = |text: &str, row: &[f64]| {
            let node = parse_expression(text).unwrap();
            compile_node(&node, &[], &empty).unwrap().evaluate(row)
        };
        assert!(check("x[0] % 3 == 2", &[-1.0]));
        assert!(check("x[0] // 2 == -2", &[-3.0]));
        assert!(check("x[0] / 0 > 1000", &[1.0]));
        assert!(check("x[0] ** 2 == 9", &[-3.0]));
        assert!(!check("x[0] > 0", &[f64::NAN]));
        assert!(check("x[0] != 0", &[f64::NAN]));
        // past the end of the row
        assert!(!check("x[5] == 0", &[1.0]));
        assert!(check("x[0] == True", &[1.0]));
    }

    #[test]
    fn test_mixed_types() {
        let empty = Bindings::new();
        let eval = |cond: Json| compile(&cond, &cols(&["a"]), &empty).unwrap().evaluate(&[1.0]);
        assert!(!eval(json!({"left": "a", "op": "==", "right": null})));
        assert!(eval(json!({"left": "a", "op": "!=", "right": null})));
        assert!(!eval(json!({"left": {"op": "+", "left": 1, "right": 2}, "op": "<", "right": null})));
    }

    #[test]
    fn test_predicate_is_shareable() {
        fn assert_send_sync<T: Send + Sync + Clone>() {}
        assert_send_sync::<Predicate>();
    }
}
