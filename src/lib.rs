//! Parameterized symbolic expressions with nesting, evaluation, fitting and graph emission.
//!
//! This crate models expressions written as format strings over `{parameter}` and
//! `[variable]` placeholders. Parameters can be bound to numbers, to other expressions, to
//! funklets or to nodes of an external computation graph. It builds on top of the
//! [evalexpr](https://github.com/ISibboI/evalexpr) crate for parsing closed-form arithmetic.
//!
//! # Features
//!
//! - Expansion of nested expressions into one flat expression, with global `_` parameters
//! - Broadcast evaluation over a variable axis and a parameter axis
//! - Compilation into portable funklets (basis string plus coefficients, JSON serializable)
//! - Linear least-squares fitting of parameter defaults
//! - Decomposition into named, deduplicated computation-graph nodes
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use evalexpr_funklet::prelude::*;
//!
//! let beam = Expression::new("{a}*[t] + {b}")
//!     .unwrap()
//!     .with_parameter("a", 2.0)
//!     .unwrap()
//!     .with_parameter("b", 1.0)
//!     .unwrap();
//!
//! let overrides = HashMap::from([("t".to_string(), EvalValue::from(vec![0.0, 1.0, 2.0]))]);
//! let output = beam.eval(&overrides, false).unwrap(); // Single([1.0, 3.0, 5.0])
//!
//! let funklet = beam.funklet().unwrap();
//! assert_eq!(funklet.basis, "p0*x0 + p1");
//! ```

pub use definition::{ExternalRef, NumericDef, ParamValue, ParmOptions, TestRange, VarDef, VarOptions};
pub use errors::ExpressionError;
pub use eval::{EvalOutput, EvalValue, Evaluation, PlotRecord};
pub use expression::Expression;
pub use fit::{FitResult, Sample};
pub use funklet::FunkletDef;
pub use graph::{GraphBuilder, InMemoryGraph, NodeHandle, NodeKind};

pub mod prelude {
    pub use crate::convert::parse_closed_form;
    pub use crate::definition::{ExternalRef, ParmOptions, VarOptions};
    pub use crate::eval::{EvalOutput, EvalValue};
    pub use crate::expr::Expr;
    pub use crate::expression::Expression;
    pub use crate::fit::Sample;
    pub use crate::funklet::FunkletDef;
    pub use crate::graph::{GraphBuilder, InMemoryGraph, NodeKind};
}

/// Conversion from parsed closed-form strings to the internal AST
pub mod convert;
/// Definition records for parameters and variables
pub mod definition;
/// Error types for the various failure modes
pub mod errors;
/// Numeric evaluation over broadcast inputs
pub mod eval;
/// Flattening of nested expressions
pub mod expand;
/// Closed-form expression tree and its interpreter
pub mod expr;
/// The symbolic expression type
pub mod expression;
/// Least-squares fitting of parameter defaults
pub mod fit;
/// Funklet compilation and serialization
pub mod funklet;
/// Computation-graph decomposition
pub mod graph;
/// Bracket-aware string utilities for format strings
pub mod parse;
pub(crate) mod slots;
