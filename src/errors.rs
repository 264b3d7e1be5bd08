//! Error types for the evalexpr-funklet crate.
//!
//! This module defines the error types that can occur while building, expanding, evaluating,
//! compiling, fitting and decomposing expressions. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from the evalexpr AST to the internal `Expr`
//! - `ExpressionError`: High-level errors returned by every public `Expression` operation
//!
//! Each error carries the offending sub-expression or key so callers can decide their own
//! fallback behaviour. Nothing in this crate swallows an error and returns a sentinel value.

use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from evalexpr AST to our internal AST representation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when a function receives the wrong number of arguments
    #[error("Function {name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when an identifier cannot be resolved to a slot or a named constant
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
}

/// Arithmetic faults raised while interpreting an `Expr`.
///
/// Values that merely overflow or divide by zero are not faults: they propagate as
/// infinities or NaN like ordinary floating point arithmetic.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArithmeticError {
    /// A function was applied outside of its real domain, e.g. `ln(-1)`
    #[error("{function}({argument}) is outside the function's domain")]
    Domain { function: &'static str, argument: f64 },
    /// A slot index was not covered by the supplied values
    #[error("slot {0} has no value")]
    MissingSlot(u32),
}

/// High-level errors that can occur when working with expressions.
#[derive(Debug, Error)]
pub enum ExpressionError {
    /// Bad bracket structure or placeholder syntax in a format string
    #[error("Malformed expression: {reason} in `{fragment}`")]
    MalformedExpression { fragment: String, reason: String },
    /// More than two inputs of an evaluation are multi-valued
    #[error("Ambiguous broadcast: more than two multi-valued inputs ({})", .keys.join(", "))]
    AmbiguousBroadcast { keys: Vec<String> },
    /// The closed-form evaluation of an expression failed
    #[error("Failed to evaluate `{expression}`: {cause}")]
    EvaluationFailed { expression: String, cause: String },
    /// A graph-node parameter cannot be compiled into a funklet
    #[error("Parameter {key} refers to graph node {node} and cannot be compiled into a funklet")]
    UnsupportedForFunklet { key: String, node: String },
    /// A term of the expression does not carry exactly one unknown parameter
    #[error("Cannot fit term `{term}`: {reason}")]
    UnfittableExpression { term: String, reason: String },
    /// The graph decomposer could not reduce a substring
    #[error("Cannot decompose `{fragment}` at depth {depth}")]
    UngraphableExpression { fragment: String, depth: usize },
    /// Error when a parameter or variable key is declared nowhere in the expression tree
    #[error("Unknown parameter or variable: {0}")]
    UnknownKey(String),
    /// Error when a mutation is rejected before touching the stored definition
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    /// Error when parsing a closed-form string with evalexpr
    #[error("Failed to build Evalexpr AST")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting from evalexpr AST to our internal AST representation
    #[error("Failed to build expression AST")]
    Convert(#[from] ConvertError),
}

impl ExpressionError {
    pub(crate) fn malformed(fragment: &str, reason: impl Into<String>) -> Self {
        ExpressionError::MalformedExpression {
            fragment: fragment.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn evaluation(expression: &str, cause: impl std::fmt::Display) -> Self {
        ExpressionError::EvaluationFailed {
            expression: expression.to_string(),
            cause: cause.to_string(),
        }
    }
}
