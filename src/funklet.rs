//! Funklets: closed-form basis strings with a coefficient vector.
//!
//! A funklet is the portable form of an expression. Parameters become coefficient slots
//! `p0..pN` (in declaration order, holding their current defaults) and variables become axis
//! slots `x0..xM` (in canonical axis order). Funklets serialize to JSON so they can be stored
//! and shipped to evaluators that know nothing about expressions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::convert::parse_closed_form;
use crate::definition::{ParamValue, ParmOptions};
use crate::errors::ExpressionError;
use crate::expression::Expression;
use crate::parse::replace_identifiers;
use crate::slots::SlotMap;

/// Axis names assumed for a funklet that does not record its own.
const DEFAULT_AXES: [&str; 4] = ["t", "f", "l", "m"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunkletDef {
    /// Closed-form string over `p{i}` and `x{j}`
    pub basis: String,
    pub coefficients: Vec<f64>,
    /// Variable key behind each `x{j}`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub axes: Vec<String>,
}

impl FunkletDef {
    pub fn new(basis: impl Into<String>, coefficients: Vec<f64>) -> Self {
        Self {
            basis: basis.into(),
            coefficients,
            axes: vec![],
        }
    }

    /// The funklet `p0` with a single coefficient.
    pub fn constant(value: f64) -> Self {
        Self::new("p0", vec![value])
    }

    fn axis_name(&self, j: usize) -> String {
        match self.axes.get(j) {
            Some(name) => name.clone(),
            None => DEFAULT_AXES
                .get(j)
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("x{j}")),
        }
    }

    /// Evaluates the basis at one point.
    ///
    /// # Arguments
    /// * `axes` - Values of `x0, x1, ...`, in order
    pub fn eval_at(&self, axes: &[f64]) -> Result<f64, ExpressionError> {
        let n = self.coefficients.len();
        let mut var_map: HashMap<String, u32> = (0..n).map(|i| (format!("p{i}"), i as u32)).collect();
        var_map.extend((0..axes.len()).map(|j| (format!("x{j}"), (n + j) as u32)));
        let expr = parse_closed_form(&self.basis, &var_map)?;

        let values: Vec<f64> = self.coefficients.iter().chain(axes).copied().collect();
        expr.evaluate(&values)
            .map_err(|e| ExpressionError::evaluation(&self.basis, e))
    }

    /// Turns the funklet back into an expression whose parameters are `{key}_{i}`.
    ///
    /// Each parameter's default is the corresponding coefficient.
    pub fn to_expression(&self, key: &str) -> Result<Expression, ExpressionError> {
        let text = replace_identifiers(&self.basis, |ident| {
            let (prefix, index) = ident.split_at(1);
            let index = index.parse::<usize>().ok()?;
            match prefix {
                "p" => Some(format!("{{{key}_{index}}}")),
                "x" => Some(format!("[{}]", self.axis_name(index))),
                _ => None,
            }
        });
        let mut expr = Expression::with_label(key, text)?;
        let local = ParmOptions {
            recurse: false,
            ..Default::default()
        };
        for (i, coefficient) in self.coefficients.iter().enumerate() {
            let name = format!("{key}_{i}");
            if expr.parameter(&name).is_some() {
                expr.set_parameter(&name, *coefficient, &local)?;
            }
        }
        Ok(expr)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Expression {
    /// Compiles the expanded expression into a funklet.
    ///
    /// Coefficients are the current parameter defaults. The result is cached with the
    /// expansion and dropped on mutation.
    ///
    /// # Errors
    /// * `UnsupportedForFunklet` - A parameter is bound to an external graph node
    pub fn funklet(&self) -> Result<FunkletDef, ExpressionError> {
        let flat = self.expand()?;
        if let Some(cached) = flat.funklet.get() {
            return Ok(cached.clone());
        }
        let compiled = flat.compile_funklet()?;
        Ok(flat.funklet.get_or_init(|| compiled).clone())
    }

    fn compile_funklet(&self) -> Result<FunkletDef, ExpressionError> {
        if let Some(value) = self.numeric_value {
            return Ok(FunkletDef::constant(value));
        }
        let slots = SlotMap::for_expression(self);
        let coefficients = slots
            .params
            .iter()
            .map(|key| match &self.parameters[key] {
                ParamValue::Numeric(def) => Ok(def.default),
                ParamValue::ExternalRef(node) => Err(ExpressionError::UnsupportedForFunklet {
                    key: key.clone(),
                    node: node.node_name.clone(),
                }),
                _ => Err(ExpressionError::UnsupportedForFunklet {
                    key: key.clone(),
                    node: "nested binding".to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let basis = slots.basis(&self.format_string)?.replace("**", "^");
        // validates the basis once so a stored funklet always parses
        slots.compile(&self.format_string)?;
        Ok(FunkletDef {
            basis,
            coefficients,
            axes: slots.vars,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::definition::ExternalRef;
    use crate::eval::{EvalOutput, EvalValue};
    use crate::graph::NodeKind;

    #[test]
    fn test_compile_funklet() {
        let expr = Expression::new("{a}*[t] + {b}")
            .unwrap()
            .with_parameter("a", 2.0)
            .unwrap()
            .with_parameter("b", 3.0)
            .unwrap();
        let funklet = expr.funklet().unwrap();
        assert_eq!(funklet.basis, "p0*x0 + p1");
        assert_eq!(funklet.coefficients, vec![2.0, 3.0]);
        assert_eq!(funklet.axes, vec!["t".to_string()]);
    }

    #[test]
    fn test_funklet_matches_evaluation() {
        let expr = Expression::new("{a}*sin([t]) + {b}*[f]/1e8")
            .unwrap()
            .with_parameter("a", 2.0)
            .unwrap()
            .with_parameter("b", -0.5)
            .unwrap();
        let funklet = expr.funklet().unwrap();
        for t in [0.0, 0.5, 1.5, 3.0] {
            let overrides = HashMap::from([("t".to_string(), EvalValue::Scalar(t))]);
            let expected = match expr.eval(&overrides, false).unwrap() {
                EvalOutput::Single(values) => values[0],
                EvalOutput::Series(_) => panic!("expected a single series"),
            };
            let got = funklet.eval_at(&[t, 1e8]).unwrap();
            assert!((got - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_numeric_only_funklet() {
        let expr = Expression::new("6/4").unwrap();
        assert_eq!(expr.funklet().unwrap(), FunkletDef::constant(1.5));
    }

    #[test]
    fn test_external_node_is_rejected() {
        let expr = Expression::new("{g}*[t]")
            .unwrap()
            .with_parameter("g", ExternalRef::new("gain", NodeKind::Parm))
            .unwrap();
        assert!(matches!(
            expr.funklet().unwrap_err(),
            ExpressionError::UnsupportedForFunklet { ref key, ref node } if key == "g" && node == "gain"
        ));
    }

    #[test]
    fn test_cache_follows_mutation() {
        let mut expr = Expression::new("{a}*[t]").unwrap();
        expr.set_parameter("a", 1.0, &ParmOptions::default()).unwrap();
        assert_eq!(expr.funklet().unwrap().coefficients, vec![1.0]);
        expr.set_parameter("a", 4.0, &ParmOptions::default()).unwrap();
        assert_eq!(expr.funklet().unwrap().coefficients, vec![4.0]);
    }

    #[test]
    fn test_json() {
        let mut funklet = FunkletDef::new("p0 + p1*x0", vec![1.0, 2.0]);
        funklet.axes = vec!["t".to_string()];
        let json = funklet.to_json().unwrap();
        assert_eq!(FunkletDef::from_json(&json).unwrap(), funklet);

        let bare = FunkletDef::from_json(r#"{"basis":"p0","coefficients":[4.0]}"#).unwrap();
        assert!(bare.axes.is_empty());
        assert_eq!(bare.eval_at(&[]).unwrap(), 4.0);
    }

    #[test]
    #[should_panic]
    fn test_eval_at_missing_axis_invalid() {
        let funklet = FunkletDef::new("p0*x0", vec![2.0]);
        let _ = funklet.eval_at(&[]).expect("Missing axis value");
    }

    #[test]
    fn test_to_expression() {
        let funklet = FunkletDef::new("p0*exp(p1*x0)", vec![2.0, -1.0]);
        let expr = funklet.to_expression("decay").unwrap();
        assert_eq!(expr.format_string(), "{decay_0}*exp({decay_1}*[t])");
        assert_eq!(expr.parameter_default("decay_1"), Some(-1.0));
        assert!(funklet.eval_at(&[]).is_err());
    }
}
