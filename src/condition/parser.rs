use super::syntax::{parse_source, BinaryOperator, CompareOp, LambdaParam, SourceExpr, UnaryOp};
use super::{Bindings, Comparison, ConditionError, ConditionNode, Scalar, ValueExpression, ROW_NAME};

/// A condition together with the values of its free variables
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRule {
    pub condition: ConditionNode,
    pub bindings: Bindings,
}

/// Turns a source expression into a `ConditionNode`.
///
/// When a row parameter is set, references to it are renamed to the
/// canonical row name so that `lambda r: r[0] > 1` and `x[0] > 1` produce
/// the same tree.
#[derive(Debug, Clone, Default)]
pub struct ConditionParser {
    row_param: Option<String>,
}

impl ConditionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row_param(name: impl Into<String>) -> Self {
        Self { row_param: Some(name.into()) }
    }

    pub fn condition(&self, expr: &SourceExpr) -> Result<ConditionNode, ConditionError> {
        reject_forbidden(expr)?;
        self.node(expr)
    }

    pub fn value(&self, expr: &SourceExpr) -> Result<ValueExpression, ConditionError> {
        reject_forbidden(expr)?;
        Ok(self.operand(expr))
    }

    fn node(&self, expr: &SourceExpr) -> Result<ConditionNode, ConditionError> {
        match expr {
            SourceExpr::BoolOp { op, values } => {
                let children = values.iter().map(|v| self.node(v)).collect::<Result<Vec<_>, _>>()?;
                Ok(ConditionNode::BooleanCombination { op: *op, children })
            }
            SourceExpr::Compare { left, ops, comparators } => {
                let mut items = Vec::with_capacity(ops.len());
                let mut lhs: &SourceExpr = left;
                for (op, rhs) in ops.iter().zip(comparators) {
                    let CompareOp::Cmp(op) = *op else {
                        return Err(ConditionError::unsupported(format!("membership or identity test in '{}'", expr)));
                    };
                    items.push(Comparison::normalized(self.operand(lhs), op, self.operand(rhs)));
                    lhs = rhs;
                }
                if items.len() == 1 {
                    Ok(ConditionNode::Comparison(items.remove(0)))
                } else {
                    Ok(ConditionNode::ChainedComparison(items))
                }
            }
            SourceExpr::Unary { op: UnaryOp::Not, .. } => {
                Err(ConditionError::unsupported(format!("negation '{}'", expr)))
            }
            SourceExpr::Binary { op: BinaryOperator::BitAnd | BinaryOperator::BitOr | BinaryOperator::BitXor, .. } => {
                Err(ConditionError::unsupported(format!("bitwise combination '{}'", expr)))
            }
            other => Err(ConditionError::unsupported(format!("'{}' is not a comparison", other))),
        }
    }

    fn operand(&self, expr: &SourceExpr) -> ValueExpression {
        match expr {
            SourceExpr::Name(name) => match &self.row_param {
                Some(row) if row == name => ValueExpression::variable(ROW_NAME),
                _ => ValueExpression::variable(name.as_str()),
            },
            SourceExpr::Literal(scalar) => ValueExpression::Constant(scalar.clone()),
            SourceExpr::Subscript { value, index } => {
                ValueExpression::subscript(self.operand(value), self.operand(index))
            }
            SourceExpr::Binary { op: BinaryOperator::Arith(op), left, right } => {
                ValueExpression::binary(*op, self.operand(left), self.operand(right))
            }
            SourceExpr::Unary { op, operand } => match signed_literal(*op, operand) {
                Some(scalar) => ValueExpression::Constant(scalar),
                None => ValueExpression::Opaque(expr.to_string()),
            },
            other => ValueExpression::Opaque(other.to_string()),
        }
    }
}

/// `-3`, `+2.5`: a sign applied directly to a numeric literal
fn signed_literal(op: UnaryOp, operand: &SourceExpr) -> Option<Scalar> {
    let SourceExpr::Literal(scalar) = operand else {
        return None;
    };
    match (op, scalar) {
        (UnaryOp::Neg, Scalar::Int(i)) => i.checked_neg().map(Scalar::Int),
        (UnaryOp::Neg, Scalar::Float(f)) => Some(Scalar::Float(-f)),
        (UnaryOp::Pos, Scalar::Int(_) | Scalar::Float(_)) => Some(scalar.clone()),
        _ => None,
    }
}

/// Calls, ternaries and lambdas are rejected wherever they appear, before
/// any operand could fall back to source text.
fn reject_forbidden(expr: &SourceExpr) -> Result<(), ConditionError> {
    match expr {
        SourceExpr::Call { .. } => Err(ConditionError::unsupported(format!("function call '{}'", expr))),
        SourceExpr::IfExp { .. } => Err(ConditionError::unsupported(format!("conditional expression '{}'", expr))),
        SourceExpr::Lambda { .. } => Err(ConditionError::unsupported(format!("nested lambda '{}'", expr))),
        SourceExpr::Name(_) | SourceExpr::Literal(_) => Ok(()),
        SourceExpr::Subscript { value, index } => {
            reject_forbidden(value)?;
            reject_forbidden(index)
        }
        SourceExpr::Attribute { value, .. } => reject_forbidden(value),
        SourceExpr::Unary { operand, .. } => reject_forbidden(operand),
        SourceExpr::Binary { left, right, .. } => {
            reject_forbidden(left)?;
            reject_forbidden(right)
        }
        SourceExpr::BoolOp { values, .. } => values.iter().try_for_each(reject_forbidden),
        SourceExpr::Compare { left, comparators, .. } => {
            reject_forbidden(left)?;
            comparators.iter().try_for_each(reject_forbidden)
        }
    }
}

/// Converts an already parsed source expression
pub fn parse_condition(expr: &SourceExpr) -> Result<ConditionNode, ConditionError> {
    ConditionParser::new().condition(expr)
}

/// Parses condition text such as `x[0] > 5 and 0 < y < 2`
pub fn parse_expression(text: &str) -> Result<ConditionNode, ConditionError> {
    parse_condition(&parse_source(text)?)
}

/// Parses a rule written either as a bare condition or as a lambda whose
/// defaults hold the bound values:
/// `lambda x, var0=2, var1=5.4: x[var0] > var1`.
pub fn parse_rule_source(text: &str) -> Result<ParsedRule, ConditionError> {
    match parse_source(text)? {
        SourceExpr::Lambda { params, body } => {
            let (row_param, bindings) = lambda_signature(&params)?;
            let parser = match row_param {
                Some(name) => ConditionParser::with_row_param(name),
                None => ConditionParser::new(),
            };
            Ok(ParsedRule { condition: parser.condition(&body)?, bindings })
        }
        expr => Ok(ParsedRule { condition: parse_condition(&expr)?, bindings: Bindings::new() }),
    }
}

fn lambda_signature(params: &[LambdaParam]) -> Result<(Option<&str>, Bindings), ConditionError> {
    let mut row_param = None;
    let mut bindings = Bindings::new();
    for (position, param) in params.iter().enumerate() {
        match &param.default {
            None if position == 0 => row_param = Some(param.name.as_str()),
            None => {
                return Err(ConditionError::unsupported(format!(
                    "parameter '{}' has no bound value",
                    param.name
                )))
            }
            Some(default) => {
                let value = match default {
                    SourceExpr::Literal(scalar) => Some(scalar.clone()),
                    SourceExpr::Unary { op, operand } => signed_literal(*op, operand),
                    _ => None,
                };
                let value = value.ok_or_else(|| {
                    ConditionError::unsupported(format!("default of '{}' must be a literal, got '{}'", param.name, default))
                })?;
                bindings.insert(param.name.clone(), value);
            }
        }
    }
    Ok((row_param, bindings))
}
