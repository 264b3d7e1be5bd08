//! Expression module for representing closed-form numeric expressions.
//!
//! Once every placeholder of an `Expression` has been replaced by a positional slot name
//! (`p0..pN` for parameters, `x0..xM` for variables) the remaining text is an ordinary
//! arithmetic formula. It is parsed by evalexpr, lowered into the `Expr` tree defined here and
//! then interpreted against a flat slice of slot values.
//!
//! # Expression Tree Structure
//! The expression tree is built recursively with each node being one of:
//! - Leaf nodes: Constants and slot references
//! - Unary operations: Abs, Neg and the elementary functions
//! - Binary operations: Add, Sub, Mul, Div, Rem, Atan2
//! - Powers: integer exponent, floating point exponent or expression exponent
//!
//! # Evaluation
//! `evaluate` follows IEEE semantics for division by zero and overflow, so `1/0` yields
//! infinity and `0/0` yields NaN. Real-domain violations of `ln`, `log10`, `sqrt`, `asin` and
//! `acos` are reported as `ArithmeticError::Domain` instead of silently producing NaN.

use std::collections::BTreeSet;

use crate::errors::ArithmeticError;

/// Represents a reference to a slot in an expression.
///
/// - The slot's name as written in the closed-form string (`p0`, `x1`, ...)
/// - The slot's index in the value slice passed to `evaluate`
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: u32,
}

/// An expression tree node representing mathematical operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to a slot
    Var(VarRef),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Floating point remainder of two expressions
    Rem(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation of an expression by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Base-10 logarithm of an expression
    Log10(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Tangent of an expression (argument in radians)
    Tan(Box<Expr>),
    /// Inverse sine
    Asin(Box<Expr>),
    /// Inverse cosine
    Acos(Box<Expr>),
    /// Inverse tangent
    Atan(Box<Expr>),
    /// Two-argument inverse tangent `atan2(y, x)`
    Atan2(Box<Expr>, Box<Expr>),
    /// Hyperbolic sine
    Sinh(Box<Expr>),
    /// Hyperbolic cosine
    Cosh(Box<Expr>),
    /// Hyperbolic tangent
    Tanh(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

impl Expr {
    /// Evaluates the expression against a slice of slot values.
    ///
    /// # Arguments
    /// * `values` - Slot values, indexed by `VarRef::index`
    ///
    /// # Returns
    /// The numeric result, or an `ArithmeticError` on a domain violation or a missing slot
    pub fn evaluate(&self, values: &[f64]) -> Result<f64, ArithmeticError> {
        Ok(match self {
            Expr::Const(c) => *c,
            Expr::Var(var_ref) => *values
                .get(var_ref.index as usize)
                .ok_or(ArithmeticError::MissingSlot(var_ref.index))?,
            Expr::Add(l, r) => l.evaluate(values)? + r.evaluate(values)?,
            Expr::Sub(l, r) => l.evaluate(values)? - r.evaluate(values)?,
            Expr::Mul(l, r) => l.evaluate(values)? * r.evaluate(values)?,
            Expr::Div(l, r) => l.evaluate(values)? / r.evaluate(values)?,
            Expr::Rem(l, r) => l.evaluate(values)? % r.evaluate(values)?,
            Expr::Abs(e) => e.evaluate(values)?.abs(),
            Expr::Neg(e) => -e.evaluate(values)?,
            Expr::Pow(base, exp) => match i32::try_from(*exp) {
                Ok(exp) => base.evaluate(values)?.powi(exp),
                Err(_) => base.evaluate(values)?.powf(*exp as f64),
            },
            Expr::PowFloat(base, exp) => base.evaluate(values)?.powf(*exp),
            Expr::PowExpr(base, exp) => base.evaluate(values)?.powf(exp.evaluate(values)?),
            Expr::Exp(e) => e.evaluate(values)?.exp(),
            Expr::Ln(e) => domain("ln", e.evaluate(values)?, |v| v >= 0.0)?.ln(),
            Expr::Log10(e) => domain("log10", e.evaluate(values)?, |v| v >= 0.0)?.log10(),
            Expr::Sqrt(e) => domain("sqrt", e.evaluate(values)?, |v| v >= 0.0)?.sqrt(),
            Expr::Sin(e) => e.evaluate(values)?.sin(),
            Expr::Cos(e) => e.evaluate(values)?.cos(),
            Expr::Tan(e) => e.evaluate(values)?.tan(),
            Expr::Asin(e) => domain("asin", e.evaluate(values)?, |v| v.abs() <= 1.0)?.asin(),
            Expr::Acos(e) => domain("acos", e.evaluate(values)?, |v| v.abs() <= 1.0)?.acos(),
            Expr::Atan(e) => e.evaluate(values)?.atan(),
            Expr::Atan2(y, x) => y.evaluate(values)?.atan2(x.evaluate(values)?),
            Expr::Sinh(e) => e.evaluate(values)?.sinh(),
            Expr::Cosh(e) => e.evaluate(values)?.cosh(),
            Expr::Tanh(e) => e.evaluate(values)?.tanh(),
        })
    }

    /// Returns the set of slot indices referenced anywhere in the tree.
    pub fn slots(&self) -> BTreeSet<u32> {
        let mut found = BTreeSet::new();
        self.collect_slots(&mut found);
        found
    }

    fn collect_slots(&self, found: &mut BTreeSet<u32>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(var_ref) => {
                found.insert(var_ref.index);
            }
            Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r)
            | Expr::Div(l, r)
            | Expr::Rem(l, r)
            | Expr::PowExpr(l, r)
            | Expr::Atan2(l, r) => {
                l.collect_slots(found);
                r.collect_slots(found);
            }
            Expr::Abs(e)
            | Expr::Neg(e)
            | Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Log10(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e)
            | Expr::Tan(e)
            | Expr::Asin(e)
            | Expr::Acos(e)
            | Expr::Atan(e)
            | Expr::Sinh(e)
            | Expr::Cosh(e)
            | Expr::Tanh(e) => e.collect_slots(found),
        }
    }

    /// Returns the value of the expression if it references no slots at all.
    pub fn constant_value(&self) -> Option<Result<f64, ArithmeticError>> {
        if self.slots().is_empty() {
            Some(self.evaluate(&[]))
        } else {
            None
        }
    }
}

/// NaN passes through untouched; only genuine real-domain violations are faults.
fn domain(
    function: &'static str,
    argument: f64,
    valid: impl Fn(f64) -> bool,
) -> Result<f64, ArithmeticError> {
    if argument.is_nan() || valid(argument) {
        Ok(argument)
    } else {
        Err(ArithmeticError::Domain { function, argument })
    }
}

/// Implements string formatting for expressions.
///
/// Binary operations are wrapped in parentheses, functions use call notation and slots are
/// printed by name, so the output can be parsed again by evalexpr.
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(var_ref) => write!(f, "{0}", var_ref.name),
            Expr::Add(left, right) => write!(f, "({left} + {right})"),
            Expr::Mul(left, right) => write!(f, "({left} * {right})"),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Rem(left, right) => write!(f, "({left} % {right})"),
            Expr::Abs(expr) => write!(f, "abs({expr})"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowExpr(base, exponent) => write!(f, "({base}^{exponent})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Log10(expr) => write!(f, "log10({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Sin(expr) => write!(f, "sin({expr})"),
            Expr::Cos(expr) => write!(f, "cos({expr})"),
            Expr::Tan(expr) => write!(f, "tan({expr})"),
            Expr::Asin(expr) => write!(f, "asin({expr})"),
            Expr::Acos(expr) => write!(f, "acos({expr})"),
            Expr::Atan(expr) => write!(f, "atan({expr})"),
            Expr::Atan2(y, x) => write!(f, "atan2({y}, {x})"),
            Expr::Sinh(expr) => write!(f, "sinh({expr})"),
            Expr::Cosh(expr) => write!(f, "cosh({expr})"),
            Expr::Tanh(expr) => write!(f, "tanh({expr})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
        }
    }
}
