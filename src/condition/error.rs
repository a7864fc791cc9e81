use thiserror::Error;

/// Failures of the condition engine.
///
/// Every variant is raised synchronously by the call that hit it; nothing in
/// this module defers an error to evaluation time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("variable '{0}' is neither a column nor a bound value")]
    UnboundVariable(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("column position {index} is out of range for {columns} columns")]
    ColumnOutOfRange { index: i64, columns: usize },

    #[error("malformed condition: {0}")]
    MalformedCondition(String),
}

impl ConditionError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax { offset, message: message.into() }
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        Self::UnsupportedExpression(what.into())
    }

    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        Self::MalformedCondition(what.into())
    }
}
