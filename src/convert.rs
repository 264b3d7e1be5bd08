//! Conversion module for transforming evalexpr AST nodes into our internal expression representation.
//!
//! Closed-form strings (format strings whose placeholders have been replaced by slot names)
//! are parsed by evalexpr and lowered into `Expr`. Identifiers are resolved through a slot map;
//! `pi` and `e` are accepted as named constants when they are not slots themselves.
//!
//! The main entry point is `parse_closed_form`, which normalizes operator spelling, runs the
//! evalexpr parser and calls `build_ast` on the result.

use std::collections::HashMap;

use crate::{
    errors::{ConvertError, ExpressionError},
    expr::{Expr, VarRef},
};
use evalexpr::{build_operator_tree, Node, Operator};

/// Parses a closed-form string into an `Expr`.
///
/// `**` is accepted as an alternative spelling of `^`.
///
/// # Arguments
/// * `text` - The closed-form expression, containing only slot names, numbers and operators
/// * `var_map` - A mapping of slot names to their indices in the value slice
pub fn parse_closed_form(text: &str, var_map: &HashMap<String, u32>) -> Result<Expr, ExpressionError> {
    let normalized = text.replace("**", "^");
    let node: Node = build_operator_tree(&normalized)?;
    Ok(build_ast(&node, var_map)?)
}

/// Converts an evalexpr AST node into our internal expression representation.
///
/// # Arguments
/// * `node` - The evalexpr AST node to convert
/// * `var_map` - A mapping of slot names to their indices in the input array
///
/// # Examples of supported operations:
/// * Basic arithmetic: +, -, *, /, %
/// * Exponentiation with constant or expression exponents: x^2, x^0.5, x^y
/// * Functions: abs, exp, ln/log, log10, sqrt, sin, cos, tan, asin, acos, atan, atan2,
///   sinh, cosh, tanh, pow
pub fn build_ast(node: &Node, var_map: &HashMap<String, u32>) -> Result<Expr, ConvertError> {
    match node.operator() {
        // Addition operator - combines multiple children into a series of binary Add expressions
        Operator::Add => {
            let children = node.children();
            children
                .iter()
                .skip(1)
                .try_fold(build_ast(first(node)?, var_map)?, |acc, child| {
                    Ok(Expr::Add(
                        Box::new(acc),
                        Box::new(build_ast(child, var_map)?),
                    ))
                })
        }
        // Multiplication operator - combines multiple children into a series of binary Mul expressions
        Operator::Mul => {
            let children = node.children();
            children.iter().skip(1).try_fold(
                build_ast(first(node)?, var_map)?,
                |acc, child| -> Result<Expr, ConvertError> {
                    Ok(Expr::Mul(
                        Box::new(acc),
                        Box::new(build_ast(child, var_map)?),
                    ))
                },
            )
        }
        Operator::Div => {
            let (l, r) = binary(node, var_map)?;
            Ok(Expr::Div(l, r))
        }
        Operator::Sub => {
            let (l, r) = binary(node, var_map)?;
            Ok(Expr::Sub(l, r))
        }
        Operator::Mod => {
            let (l, r) = binary(node, var_map)?;
            Ok(Expr::Rem(l, r))
        }
        // Constant value - integers are widened to floats
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{:?}", value))),
        },
        // Slot reference - looks up the slot's index in var_map
        Operator::VariableIdentifierRead { identifier } => {
            match var_map.get(identifier.as_str()) {
                Some(index) => Ok(Expr::Var(VarRef {
                    name: identifier.to_string(),
                    index: *index,
                })),
                None => named_constant(identifier)
                    .map(Expr::Const)
                    .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string())),
            }
        }
        Operator::Neg => Ok(Expr::Neg(Box::new(build_ast(first(node)?, var_map)?))),
        Operator::FunctionIdentifier { identifier } => {
            let name = identifier.strip_prefix("math::").unwrap_or(identifier);
            let args = function_args(first(node)?);
            let unary = |ctor: fn(Box<Expr>) -> Expr| -> Result<Expr, ConvertError> {
                expect_arity(name, &args, 1)?;
                Ok(ctor(Box::new(build_ast(args[0], var_map)?)))
            };
            match name {
                "abs" => unary(Expr::Abs),
                "exp" => unary(Expr::Exp),
                "ln" | "log" => unary(Expr::Ln),
                "log10" => unary(Expr::Log10),
                "sqrt" => unary(Expr::Sqrt),
                "sin" => unary(Expr::Sin),
                "cos" => unary(Expr::Cos),
                "tan" => unary(Expr::Tan),
                "asin" => unary(Expr::Asin),
                "acos" => unary(Expr::Acos),
                "atan" => unary(Expr::Atan),
                "sinh" => unary(Expr::Sinh),
                "cosh" => unary(Expr::Cosh),
                "tanh" => unary(Expr::Tanh),
                "atan2" | "pow" => {
                    expect_arity(name, &args, 2)?;
                    let a = Box::new(build_ast(args[0], var_map)?);
                    let b = Box::new(build_ast(args[1], var_map)?);
                    Ok(if name == "pow" {
                        Expr::PowExpr(a, b)
                    } else {
                        Expr::Atan2(a, b)
                    })
                }
                _ => Err(ConvertError::UnsupportedFunction(name.to_string())),
            }
        }
        // Root node - should have exactly one child
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_ast(&children[0], var_map)
            } else {
                Err(ConvertError::RootNode(format!("{:?}", children)))
            }
        }
        // Exponentiation - integer and float constants get dedicated variants
        Operator::Exp => {
            let (base, exponent) = binary(node, var_map)?;
            let children = node.children();
            match children[1].operator() {
                Operator::Const {
                    value: evalexpr::Value::Int(exp),
                } => Ok(Expr::Pow(base, *exp)),
                Operator::Const {
                    value: evalexpr::Value::Float(exp),
                } => Ok(Expr::PowFloat(base, *exp)),
                _ => Ok(Expr::PowExpr(base, exponent)),
            }
        }
        // Any other operator is unsupported
        _ => Err(ConvertError::UnsupportedOperator(format!(
            "{:?}",
            node.operator()
        ))),
    }
}

fn first(node: &Node) -> Result<&Node, ConvertError> {
    node.children()
        .first()
        .ok_or_else(|| ConvertError::UnsupportedOperator(format!("{:?}", node.operator())))
}

fn binary(
    node: &Node,
    var_map: &HashMap<String, u32>,
) -> Result<(Box<Expr>, Box<Expr>), ConvertError> {
    match node.children() {
        [l, r] => Ok((
            Box::new(build_ast(l, var_map)?),
            Box::new(build_ast(r, var_map)?),
        )),
        _ => Err(ConvertError::UnsupportedOperator(format!(
            "{:?}",
            node.operator()
        ))),
    }
}

/// Unwraps parenthesis groups and splits tuples into individual arguments.
fn function_args(node: &Node) -> Vec<&Node> {
    match node.operator() {
        Operator::RootNode if node.children().len() == 1 => function_args(&node.children()[0]),
        Operator::Tuple => node.children().iter().collect(),
        _ => vec![node],
    }
}

fn expect_arity(name: &str, args: &[&Node], expected: usize) -> Result<(), ConvertError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ConvertError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        })
    }
}

pub(crate) fn named_constant(identifier: &str) -> Option<f64> {
    match identifier {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(names: &[&str]) -> HashMap<String, u32> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i as u32))
            .collect()
    }

    #[test]
    fn test_parse_arithmetic() {
        let expr = parse_closed_form("p0 + p1 * x0", &slots(&["p0", "p1", "x0"])).unwrap();
        assert_eq!(expr.evaluate(&[1.0, 2.0, 3.0]).unwrap(), 7.0);

        let expr = parse_closed_form("(p0 - x0) / 4", &slots(&["p0", "x0"])).unwrap();
        assert_eq!(expr.evaluate(&[10.0, 2.0]).unwrap(), 2.0);
    }

    #[test]
    fn test_integer_division_is_float() {
        let expr = parse_closed_form("1/2", &HashMap::new()).unwrap();
        assert_eq!(expr.evaluate(&[]).unwrap(), 0.5);
    }

    #[test]
    fn test_powers() {
        let vars = slots(&["x0", "p0"]);
        let expr = parse_closed_form("x0^2", &vars).unwrap();
        assert!(matches!(expr, Expr::Pow(_, 2)));
        let expr = parse_closed_form("x0**p0", &vars).unwrap();
        assert!(matches!(expr, Expr::PowExpr(_, _)));
        assert_eq!(expr.evaluate(&[2.0, 3.0]).unwrap(), 8.0);
    }

    #[test]
    fn test_functions() {
        let vars = slots(&["x0", "x1"]);
        let expr = parse_closed_form("sin(x0) + cos(x0)", &vars).unwrap();
        assert!((expr.evaluate(&[0.0, 0.0]).unwrap() - 1.0).abs() < 1e-12);

        let expr = parse_closed_form("atan2(x0, x1)", &vars).unwrap();
        assert!((expr.evaluate(&[1.0, 1.0]).unwrap() - std::f64::consts::FRAC_PI_4).abs() < 1e-12);

        let expr = parse_closed_form("exp(ln(x0))", &vars).unwrap();
        assert!((expr.evaluate(&[3.0, 0.0]).unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_named_constants() {
        let expr = parse_closed_form("2*pi", &HashMap::new()).unwrap();
        assert_eq!(expr.evaluate(&[]).unwrap(), 2.0 * std::f64::consts::PI);
    }

    #[test]
    fn test_unknown_identifier() {
        let err = parse_closed_form("p0 + q", &slots(&["p0"])).unwrap_err();
        assert!(matches!(
            err,
            ExpressionError::Convert(ConvertError::VariableNotFound(ref name)) if name == "q"
        ));
    }

    #[test]
    fn test_unsupported_function() {
        let err = parse_closed_form("gamma(p0)", &slots(&["p0"])).unwrap_err();
        assert!(matches!(
            err,
            ExpressionError::Convert(ConvertError::UnsupportedFunction(_))
        ));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(parse_closed_form("2*p0 + )", &slots(&["p0"])).is_err());
    }
}
