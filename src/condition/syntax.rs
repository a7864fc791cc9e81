//! Rule Source Syntax
//!
//! Tokenizer and recursive-descent parser for Python-style expression text
//! (`x[0] > 5 and 0 < y < 2`, `lambda x, var0=1: x[var0] <= 3.5`).
//! The tree it produces is deliberately wider than what a condition may
//! contain so that the condition parser can reject constructs by name.

use std::fmt;

use super::{ArithOp, BoolOp, Comparator, ConditionError, Scalar};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Scalar),
    Str(String),
    Name(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Assign,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    offset: usize,
}

const OPERATORS: [&str; 17] = [
    "**", "//", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "&", "|", "^", "~",
];

fn tokenize(source: &str) -> Result<Vec<Spanned>, ConditionError> {
    let bytes = source.as_bytes();
    let mut idx = 0usize;
    let mut tokens = Vec::new();

    while idx < bytes.len() {
        let b = bytes[idx];
        if b.is_ascii_whitespace() {
            idx += 1;
            continue;
        }
        let start = idx;
        let token = match b {
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b',' => Token::Comma,
            b':' => Token::Colon,
            b'.' if !bytes.get(idx + 1).is_some_and(u8::is_ascii_digit) => Token::Dot,
            b'\'' | b'"' => {
                let (text, end) = read_string(source, idx)?;
                tokens.push(Spanned { token: Token::Str(text), offset: start });
                idx = end;
                continue;
            }
            _ if b.is_ascii_digit() || b == b'.' => {
                let (number, end) = read_number(source, idx)?;
                tokens.push(Spanned { token: Token::Number(number), offset: start });
                idx = end;
                continue;
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                idx += 1;
                while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
                    idx += 1;
                }
                tokens.push(Spanned { token: Token::Name(source[start..idx].to_string()), offset: start });
                continue;
            }
            _ => {
                let rest = &source[idx..];
                match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
                    Some(op) => {
                        tokens.push(Spanned { token: Token::Op(*op), offset: start });
                        idx += op.len();
                        continue;
                    }
                    None if b == b'=' => Token::Assign,
                    None => {
                        let ch = rest.chars().next().unwrap_or('?');
                        return Err(ConditionError::syntax(start, format!("unexpected character '{}'", ch)));
                    }
                }
            }
        };
        tokens.push(Spanned { token, offset: start });
        idx += 1;
    }

    if tokens.is_empty() {
        return Err(ConditionError::syntax(0, "expression is empty"));
    }
    Ok(tokens)
}

fn read_string(source: &str, start: usize) -> Result<(String, usize), ConditionError> {
    let quote = source.as_bytes()[start] as char;
    let mut text = String::new();
    let mut chars = source[start + 1..].char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
            }
            c if c == quote => return Ok((text, start + 1 + i + 1)),
            c => text.push(c),
        }
    }
    Err(ConditionError::syntax(start, "unterminated string literal"))
}

fn read_number(source: &str, start: usize) -> Result<(Scalar, usize), ConditionError> {
    let bytes = source.as_bytes();
    let mut idx = start;
    let mut is_float = false;
    while idx < bytes.len() {
        match bytes[idx] {
            b'0'..=b'9' | b'_' => {}
            b'.' => is_float = true,
            b'e' | b'E' => {
                is_float = true;
                if matches!(bytes.get(idx + 1), Some(b'+' | b'-')) {
                    idx += 1;
                }
            }
            _ => break,
        }
        idx += 1;
    }
    let raw: String = source[start..idx].chars().filter(|c| *c != '_').collect();
    let parsed = if is_float {
        raw.parse::<f64>().map(Scalar::Float).ok()
    } else {
        raw.parse::<i64>()
            .map(Scalar::Int)
            .or_else(|_| raw.parse::<f64>().map(Scalar::Float))
            .ok()
    };
    parsed
        .map(|number| (number, idx))
        .ok_or_else(|| ConditionError::syntax(start, format!("invalid numeric literal '{}'", raw)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Arith(ArithOp),
    BitAnd,
    BitOr,
    BitXor,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Arith(op) => op.symbol(),
            BinaryOperator::BitAnd => "&",
            BinaryOperator::BitOr => "|",
            BinaryOperator::BitXor => "^",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Cmp(Comparator),
    In,
    NotIn,
    Is,
    IsNot,
}

impl CompareOp {
    fn text(self) -> &'static str {
        match self {
            CompareOp::Cmp(op) => op.symbol(),
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaParam {
    pub name: String,
    pub default: Option<SourceExpr>,
}

/// Parsed source expression
#[derive(Debug, Clone, PartialEq)]
pub enum SourceExpr {
    Name(String),
    Literal(Scalar),
    Subscript {
        value: Box<SourceExpr>,
        index: Box<SourceExpr>,
    },
    Attribute {
        value: Box<SourceExpr>,
        attr: String,
    },
    Call {
        func: Box<SourceExpr>,
        args: Vec<SourceExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<SourceExpr>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<SourceExpr>,
        right: Box<SourceExpr>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<SourceExpr>,
    },
    Compare {
        left: Box<SourceExpr>,
        ops: Vec<CompareOp>,
        comparators: Vec<SourceExpr>,
    },
    IfExp {
        test: Box<SourceExpr>,
        body: Box<SourceExpr>,
        orelse: Box<SourceExpr>,
    },
    Lambda {
        params: Vec<LambdaParam>,
        body: Box<SourceExpr>,
    },
}

impl SourceExpr {
    fn is_atomic(&self) -> bool {
        matches!(
            self,
            SourceExpr::Name(_)
                | SourceExpr::Literal(_)
                | SourceExpr::Subscript { .. }
                | SourceExpr::Attribute { .. }
                | SourceExpr::Call { .. }
        )
    }
}

fn fmt_nested(f: &mut fmt::Formatter<'_>, expr: &SourceExpr) -> fmt::Result {
    if expr.is_atomic() {
        write!(f, "{}", expr)
    } else {
        write!(f, "({})", expr)
    }
}

impl fmt::Display for SourceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceExpr::Name(name) => write!(f, "{}", name),
            SourceExpr::Literal(scalar) => write!(f, "{}", scalar),
            SourceExpr::Subscript { value, index } => {
                fmt_nested(f, value)?;
                write!(f, "[{}]", index)
            }
            SourceExpr::Attribute { value, attr } => {
                fmt_nested(f, value)?;
                write!(f, ".{}", attr)
            }
            SourceExpr::Call { func, args } => {
                fmt_nested(f, func)?;
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            SourceExpr::Unary { op, operand } => {
                let prefix = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Pos => "+",
                    UnaryOp::Not => "not ",
                    UnaryOp::Invert => "~",
                };
                write!(f, "{}", prefix)?;
                fmt_nested(f, operand)
            }
            SourceExpr::Binary { op, left, right } => {
                fmt_nested(f, left)?;
                write!(f, " {} ", op.symbol())?;
                fmt_nested(f, right)
            }
            SourceExpr::BoolOp { op, values } => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.keyword())?;
                    }
                    fmt_nested(f, value)?;
                }
                Ok(())
            }
            SourceExpr::Compare { left, ops, comparators } => {
                fmt_nested(f, left)?;
                for (op, right) in ops.iter().zip(comparators) {
                    write!(f, " {} ", op.text())?;
                    fmt_nested(f, right)?;
                }
                Ok(())
            }
            SourceExpr::IfExp { test, body, orelse } => {
                fmt_nested(f, body)?;
                write!(f, " if ")?;
                fmt_nested(f, test)?;
                write!(f, " else ")?;
                fmt_nested(f, orelse)
            }
            SourceExpr::Lambda { params, body } => {
                write!(f, "lambda")?;
                for (i, param) in params.iter().enumerate() {
                    write!(f, "{}{}", if i == 0 { " " } else { ", " }, param.name)?;
                    if let Some(default) = &param.default {
                        write!(f, "={}", default)?;
                    }
                }
                write!(f, ": {}", body)
            }
        }
    }
}

/// Parses expression text into a `SourceExpr`
pub fn parse_source(source: &str) -> Result<SourceExpr, ConditionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, index: 0, end: source.len(), depth: 0 };
    let expr = parser.expression()?;
    if let Some(extra) = parser.tokens.get(parser.index) {
        return Err(ConditionError::syntax(extra.offset, "unexpected trailing tokens"));
    }
    Ok(expr)
}

/// Deepest nesting of brackets, unary operators and sub-expressions accepted
pub const MAX_NESTING: usize = 100;

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|t| &t.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.index + ahead).map(|t| &t.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.index).map(|t| t.offset).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).map(|t| t.token.clone());
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(name)) if name == keyword)
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(found)) if *found == op)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ConditionError> {
        if self.peek() == Some(&expected) {
            self.index += 1;
            Ok(())
        } else {
            Err(ConditionError::syntax(self.offset(), format!("expected {}", what)))
        }
    }

    /// Runs `parse` one nesting level deeper, failing past `MAX_NESTING`
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ConditionError>,
    ) -> Result<T, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(ConditionError::syntax(self.offset(), "expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expression(&mut self) -> Result<SourceExpr, ConditionError> {
        self.nested(Self::unnested_expression)
    }

    fn unnested_expression(&mut self) -> Result<SourceExpr, ConditionError> {
        if self.at_keyword("lambda") {
            return self.lambda();
        }
        let body = self.or_test()?;
        if self.at_keyword("if") {
            self.index += 1;
            let test = self.or_test()?;
            if !self.at_keyword("else") {
                return Err(ConditionError::syntax(self.offset(), "expected 'else'"));
            }
            self.index += 1;
            let orelse = self.expression()?;
            return Ok(SourceExpr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn lambda(&mut self) -> Result<SourceExpr, ConditionError> {
        self.index += 1;
        let mut params = Vec::new();
        while let Some(Token::Name(name)) = self.peek().cloned() {
            self.index += 1;
            let default = if self.peek() == Some(&Token::Assign) {
                self.index += 1;
                Some(self.or_test()?)
            } else {
                None
            };
            params.push(LambdaParam { name, default });
            if self.peek() == Some(&Token::Comma) {
                self.index += 1;
            } else {
                break;
            }
        }
        self.expect(Token::Colon, "':' after lambda parameters")?;
        let body = self.expression()?;
        Ok(SourceExpr::Lambda { params, body: Box::new(body) })
    }

    fn or_test(&mut self) -> Result<SourceExpr, ConditionError> {
        self.bool_chain(BoolOp::Or)
    }

    fn bool_chain(&mut self, op: BoolOp) -> Result<SourceExpr, ConditionError> {
        let operand = |p: &mut Self| match op {
            BoolOp::Or => p.bool_chain(BoolOp::And),
            BoolOp::And => p.not_test(),
        };
        let first = operand(self)?;
        if !self.at_keyword(op.keyword()) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.at_keyword(op.keyword()) {
            self.index += 1;
            values.push(operand(self)?);
        }
        Ok(SourceExpr::BoolOp { op, values })
    }

    fn not_test(&mut self) -> Result<SourceExpr, ConditionError> {
        if self.at_keyword("not") {
            self.index += 1;
            let operand = self.nested(Self::not_test)?;
            return Ok(SourceExpr::Unary { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        self.comparison()
    }

    fn compare_op(&mut self) -> Option<CompareOp> {
        let op = match self.peek()?.clone() {
            Token::Op(symbol) => CompareOp::Cmp(Comparator::from_symbol(symbol)?),
            Token::Name(word) if word == "in" => CompareOp::In,
            Token::Name(word) if word == "is" => {
                if matches!(self.peek_at(1), Some(Token::Name(next)) if next == "not") {
                    self.index += 1;
                    CompareOp::IsNot
                } else {
                    CompareOp::Is
                }
            }
            Token::Name(word) if word == "not" => match self.peek_at(1) {
                Some(Token::Name(next)) if next == "in" => {
                    self.index += 1;
                    CompareOp::NotIn
                }
                _ => return None,
            },
            _ => return None,
        };
        self.index += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<SourceExpr, ConditionError> {
        let left = self.bit_or()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.compare_op() {
            ops.push(op);
            comparators.push(self.bit_or()?);
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(SourceExpr::Compare { left: Box::new(left), ops, comparators })
        }
    }

    fn bit_or(&mut self) -> Result<SourceExpr, ConditionError> {
        self.left_assoc(&[("|", BinaryOperator::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> Result<SourceExpr, ConditionError> {
        self.left_assoc(&[("^", BinaryOperator::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> Result<SourceExpr, ConditionError> {
        self.left_assoc(&[("&", BinaryOperator::BitAnd)], Self::arith)
    }

    fn arith(&mut self) -> Result<SourceExpr, ConditionError> {
        self.left_assoc(
            &[("+", BinaryOperator::Arith(ArithOp::Add)), ("-", BinaryOperator::Arith(ArithOp::Sub))],
            Self::term,
        )
    }

    fn term(&mut self) -> Result<SourceExpr, ConditionError> {
        self.left_assoc(
            &[
                ("*", BinaryOperator::Arith(ArithOp::Mul)),
                ("/", BinaryOperator::Arith(ArithOp::Div)),
                ("//", BinaryOperator::Arith(ArithOp::FloorDiv)),
                ("%", BinaryOperator::Arith(ArithOp::Mod)),
            ],
            Self::factor,
        )
    }

    fn left_assoc(
        &mut self,
        table: &[(&str, BinaryOperator)],
        next: fn(&mut Self) -> Result<SourceExpr, ConditionError>,
    ) -> Result<SourceExpr, ConditionError> {
        let mut expr = next(self)?;
        while let Some((_, op)) = table.iter().find(|(symbol, _)| self.at_op(symbol)) {
            let op = *op;
            self.index += 1;
            let right = next(self)?;
            expr = SourceExpr::Binary { op, left: Box::new(expr), right: Box::new(right) };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<SourceExpr, ConditionError> {
        let op = match self.peek() {
            Some(Token::Op("-")) => UnaryOp::Neg,
            Some(Token::Op("+")) => UnaryOp::Pos,
            Some(Token::Op("~")) => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.index += 1;
        let operand = self.nested(Self::factor)?;
        Ok(SourceExpr::Unary { op, operand: Box::new(operand) })
    }

    fn power(&mut self) -> Result<SourceExpr, ConditionError> {
        let base = self.primary()?;
        if self.at_op("**") {
            self.index += 1;
            // right associative, and binds tighter than a unary minus on its left
            let exponent = self.nested(Self::factor)?;
            return Ok(SourceExpr::Binary {
                op: BinaryOperator::Arith(ArithOp::Pow),
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<SourceExpr, ConditionError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.index += 1;
                    let index = self.expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = SourceExpr::Subscript { value: Box::new(expr), index: Box::new(index) };
                }
                Some(Token::LParen) => {
                    self.index += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.index += 1;
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(Token::RParen, "')' to close the call")?;
                    expr = SourceExpr::Call { func: Box::new(expr), args };
                }
                Some(Token::Dot) => {
                    self.index += 1;
                    match self.advance() {
                        Some(Token::Name(attr)) => {
                            expr = SourceExpr::Attribute { value: Box::new(expr), attr };
                        }
                        _ => return Err(ConditionError::syntax(self.offset(), "expected attribute name")),
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn atom(&mut self) -> Result<SourceExpr, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Number(n)) => Ok(SourceExpr::Literal(n)),
            Some(Token::Str(s)) => Ok(SourceExpr::Literal(Scalar::Text(s))),
            Some(Token::Name(name)) => Ok(match name.as_str() {
                "True" => SourceExpr::Literal(Scalar::Bool(true)),
                "False" => SourceExpr::Literal(Scalar::Bool(false)),
                "None" => SourceExpr::Literal(Scalar::Null),
                "and" | "or" | "not" | "if" | "else" | "lambda" | "in" | "is" => {
                    return Err(ConditionError::syntax(offset, format!("unexpected keyword '{}'", name)));
                }
                _ => SourceExpr::Name(name),
            }),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(_) => Err(ConditionError::syntax(offset, "unexpected token")),
            None => Err(ConditionError::syntax(offset, "unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> Box<SourceExpr> {
        Box::new(SourceExpr::Name(n.to_string()))
    }

    fn int(i: i64) -> Box<SourceExpr> {
        Box::new(SourceExpr::Literal(Scalar::Int(i)))
    }

    #[test]
    fn test_precedence_of_arithmetic() {
        let expr = parse_source("a + b * 2 ** 3").unwrap();
        assert_eq!(expr.to_string(), "a + (b * (2 ** 3))");
    }

    #[test]
    fn test_unary_minus_binds_looser_than_power() {
        let expr = parse_source("-x ** 2").unwrap();
        assert_eq!(
            expr,
            SourceExpr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(SourceExpr::Binary {
                    op: BinaryOperator::Arith(ArithOp::Pow),
                    left: name("x"),
                    right: int(2),
                }),
            }
        );
    }

    #[test]
    fn test_chained_comparison_and_boolean_nesting() {
        let expr = parse_source("0 < x < 2 or y >= 1 and not z").unwrap();
        let SourceExpr::BoolOp { op: BoolOp::Or, values } = expr else {
            panic!("expected an 'or' at the top");
        };
        assert!(matches!(&values[0], SourceExpr::Compare { ops, .. } if ops.len() == 2));
        assert!(matches!(&values[1], SourceExpr::BoolOp { op: BoolOp::And, .. }));
    }

    #[test]
    fn test_lambda_with_defaults() {
        let expr = parse_source("lambda x, var0=2, var1=-1.5: x[var0] > var1").unwrap();
        let SourceExpr::Lambda { params, body } = expr else {
            panic!("expected a lambda");
        };
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].default, None);
        assert_eq!(params[1].default, Some(SourceExpr::Literal(Scalar::Int(2))));
        assert!(matches!(*body, SourceExpr::Compare { .. }));
    }

    #[test]
    fn test_ternary_and_calls_parse() {
        assert!(matches!(parse_source("a if b > 1 else c").unwrap(), SourceExpr::IfExp { .. }));
        assert!(matches!(parse_source("abs(x) > 1").unwrap(), SourceExpr::Compare { .. }));
    }

    #[test]
    fn test_membership_ops() {
        let expr = parse_source("x not in y").unwrap();
        assert!(matches!(expr, SourceExpr::Compare { ref ops, .. } if ops[0] == CompareOp::NotIn));
        let expr = parse_source("x is not None").unwrap();
        assert!(matches!(expr, SourceExpr::Compare { ref ops, .. } if ops[0] == CompareOp::IsNot));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_source("1e3").unwrap(), SourceExpr::Literal(Scalar::Float(1000.0)));
        assert_eq!(parse_source(".5").unwrap(), SourceExpr::Literal(Scalar::Float(0.5)));
        assert_eq!(parse_source("1_000").unwrap(), SourceExpr::Literal(Scalar::Int(1000)));
        assert_eq!(parse_source("'a b'").unwrap(), SourceExpr::Literal(Scalar::Text("a b".into())));
    }

    #[test]
    fn test_syntax_errors_carry_offsets() {
        assert_eq!(
            parse_source("x > ").unwrap_err(),
            ConditionError::syntax(4, "unexpected end of expression")
        );
        assert!(matches!(parse_source("x > 1 )"), Err(ConditionError::Syntax { offset: 6, .. })));
        assert!(matches!(parse_source("x $ 1"), Err(ConditionError::Syntax { offset: 2, .. })));
        assert!(matches!(parse_source("   "), Err(ConditionError::Syntax { .. })));
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let deep = "(".repeat(5000) + "x" + &")".repeat(5000) + " > 1";
        match parse_source(&deep) {
            Err(ConditionError::Syntax { message, .. }) => assert_eq!(message, "expression nested too deeply"),
            other => panic!("expected a nesting error, got {:?}", other),
        }
        assert!(parse_source(&("-".repeat(5000) + "x > 1")).is_err());
        assert!(parse_source(&("not ".repeat(5000) + "x > 1")).is_err());
        assert!(parse_source(&("x".to_string() + &" ** x".repeat(5000) + " > 1")).is_err());

        let shallow = "(".repeat(50) + "x" + &")".repeat(50) + " > 1";
        assert!(parse_source(&shallow).is_ok());
    }
}
