//! Numeric evaluation of expressions over arrays of inputs.
//!
//! Evaluation expands the expression, resolves a value for every parameter and variable and
//! interprets the closed form once per grid point. Any input may be overridden by a scalar or
//! by an array; at most two inputs may be multi-valued:
//!
//! - the *variable axis*, which becomes the points of each output series
//! - the *parameter axis*, which selects one output series per value
//!
//! Variables are preferred for the variable axis; when two inputs are multi-valued and the
//! second is longer, the two swap roles.

use std::collections::HashMap;

use log::trace;
use ndarray::{array, Array1};

use crate::definition::ParamValue;
use crate::errors::ExpressionError;
use crate::expression::Expression;
use crate::slots::SlotMap;

/// Value supplied for an input.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl EvalValue {
    pub fn len(&self) -> usize {
        match self {
            EvalValue::Scalar(_) => 1,
            EvalValue::Array(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn at(&self, i: usize) -> f64 {
        match self {
            EvalValue::Scalar(v) => *v,
            EvalValue::Array(values) => values[i],
        }
    }

    fn first(&self) -> f64 {
        self.at(0)
    }

    fn bounds(&self) -> (f64, f64) {
        match self {
            EvalValue::Scalar(v) => (*v, *v),
            EvalValue::Array(values) => values.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), v| (lo.min(*v), hi.max(*v)),
            ),
        }
    }
}

impl From<f64> for EvalValue {
    fn from(value: f64) -> Self {
        EvalValue::Scalar(value)
    }
}

impl From<Vec<f64>> for EvalValue {
    fn from(values: Vec<f64>) -> Self {
        EvalValue::Array(values)
    }
}

impl From<&[f64]> for EvalValue {
    fn from(values: &[f64]) -> Self {
        EvalValue::Array(values.to_vec())
    }
}

impl From<Array1<f64>> for EvalValue {
    fn from(values: Array1<f64>) -> Self {
        EvalValue::Array(values.to_vec())
    }
}

/// Result shape of an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutput {
    /// One series over the variable axis (length 1 without one)
    Single(Array1<f64>),
    /// One series per value on the parameter axis
    Series(Vec<Array1<f64>>),
}

impl EvalOutput {
    /// All series, a single output counting as one.
    pub fn series(&self) -> Vec<&Array1<f64>> {
        match self {
            EvalOutput::Single(values) => vec![values],
            EvalOutput::Series(series) => series.iter().collect(),
        }
    }
}

/// Description of a plot axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisRecord {
    pub key: String,
    pub unit: Option<String>,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// What a plotting front end needs to label an evaluation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlotRecord {
    pub title: String,
    /// The evaluated (expanded) format string
    pub expression: String,
    pub x_axis: Option<AxisRecord>,
    pub series_axis: Option<AxisRecord>,
    pub y_unit: Option<String>,
    /// One `key=value` entry per series, or the title for a single series
    pub legend: Vec<String>,
    /// `key=value` of every scalar input
    pub annotations: Vec<String>,
}

/// Output of `Expression::evaluate`.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub output: EvalOutput,
    pub plot: PlotRecord,
}

struct Input {
    key: String,
    slot: usize,
    value: EvalValue,
    unit: Option<String>,
}

impl Input {
    fn axis_record(&self) -> AxisRecord {
        let (min, max) = self.value.bounds();
        AxisRecord {
            key: self.key.clone(),
            unit: self.unit.clone(),
            min,
            max,
            count: self.value.len(),
        }
    }
}

impl Expression {
    /// Evaluates the expression and describes the result for plotting.
    ///
    /// # Arguments
    /// * `overrides` - Values replacing the defaults of parameters or variables. Keys the
    ///   expanded expression does not declare are ignored.
    /// * `use_test_values` - Variables default to their test range and parameters to their
    ///   test value instead of their defaults
    ///
    /// # Errors
    /// * `AmbiguousBroadcast` - More than two inputs are multi-valued
    /// * `EvaluationFailed` - A graph-node parameter was not overridden, or the closed form
    ///   cannot be parsed or evaluated
    pub fn evaluate(
        &self,
        overrides: &HashMap<String, EvalValue>,
        use_test_values: bool,
    ) -> Result<Evaluation, ExpressionError> {
        let flat = self.expand()?;
        let mut plot = PlotRecord {
            title: flat.label.clone(),
            expression: flat.format_string.clone(),
            y_unit: flat.result_unit.clone(),
            ..Default::default()
        };

        if let Some(value) = flat.numeric_value {
            plot.legend.push(flat.label.clone());
            return Ok(Evaluation {
                output: EvalOutput::Single(array![value]),
                plot,
            });
        }

        let slots = SlotMap::for_expression(flat);
        let compiled = slots
            .compile(&flat.format_string)
            .map_err(|e| ExpressionError::evaluation(&flat.format_string, e))?;
        let inputs = flat.resolve_inputs(&slots, overrides, use_test_values)?;

        let multi: Vec<usize> = (0..inputs.len())
            .filter(|&i| inputs[i].value.len() > 1)
            .collect();
        let (variable_axis, parameter_axis) = match multi.as_slice() {
            [] => (None, None),
            [only] => (Some(*only), None),
            [first, second] if inputs[*second].value.len() > inputs[*first].value.len() => {
                (Some(*second), Some(*first))
            }
            [first, second] => (Some(*first), Some(*second)),
            _ => {
                return Err(ExpressionError::AmbiguousBroadcast {
                    keys: multi.iter().map(|&i| inputs[i].key.clone()).collect(),
                })
            }
        };
        trace!(
            "{}: variable axis {:?}, parameter axis {:?}",
            flat.label,
            variable_axis.map(|i| &inputs[i].key),
            parameter_axis.map(|i| &inputs[i].key)
        );

        let points = variable_axis.map_or(1, |i| inputs[i].value.len());
        let series_count = parameter_axis.map_or(1, |i| inputs[i].value.len());
        let mut values = vec![0.0; slots.width()];
        let mut series = Vec::with_capacity(series_count);
        for s in 0..series_count {
            let mut out = Vec::with_capacity(points);
            for p in 0..points {
                for (i, input) in inputs.iter().enumerate() {
                    values[input.slot] = if Some(i) == variable_axis {
                        input.value.at(p)
                    } else if Some(i) == parameter_axis {
                        input.value.at(s)
                    } else {
                        input.value.first()
                    };
                }
                let y = compiled
                    .evaluate(&values)
                    .map_err(|e| ExpressionError::evaluation(&flat.format_string, e))?;
                out.push(y);
            }
            series.push(Array1::from_vec(out));
        }

        plot.x_axis = variable_axis.map(|i| inputs[i].axis_record());
        plot.series_axis = parameter_axis.map(|i| inputs[i].axis_record());
        plot.legend = match parameter_axis {
            Some(i) => (0..series_count)
                .map(|s| format!("{}={}", inputs[i].key, inputs[i].value.at(s)))
                .collect(),
            None => vec![flat.label.clone()],
        };
        plot.annotations = inputs
            .iter()
            .filter(|input| input.value.len() == 1)
            .map(|input| format!("{}={}", input.key, input.value.first()))
            .collect();

        let output = match parameter_axis {
            Some(_) => EvalOutput::Series(series),
            None => EvalOutput::Single(series.remove(0)),
        };
        Ok(Evaluation { output, plot })
    }

    /// Evaluates the expression, see `evaluate`.
    pub fn eval(
        &self,
        overrides: &HashMap<String, EvalValue>,
        use_test_values: bool,
    ) -> Result<EvalOutput, ExpressionError> {
        Ok(self.evaluate(overrides, use_test_values)?.output)
    }

    /// Values of every slot; variables first, in slot order, then parameters.
    fn resolve_inputs(
        &self,
        slots: &SlotMap,
        overrides: &HashMap<String, EvalValue>,
        use_test_values: bool,
    ) -> Result<Vec<Input>, ExpressionError> {
        let mut inputs = Vec::with_capacity(slots.width());
        for (j, key) in slots.vars.iter().enumerate() {
            let def = &self.variables[key];
            let value = match overrides.get(key) {
                Some(value) => value.clone(),
                None if use_test_values => EvalValue::Array(def.numeric.test_range.samples()),
                None => EvalValue::Scalar(def.default()),
            };
            inputs.push(Input {
                key: key.clone(),
                slot: slots.params.len() + j,
                value,
                unit: def.numeric.unit.clone(),
            });
        }
        for (i, key) in slots.params.iter().enumerate() {
            let (value, unit) = match (overrides.get(key), &self.parameters[key]) {
                (Some(value), binding) => (
                    value.clone(),
                    binding.as_numeric().and_then(|def| def.unit.clone()),
                ),
                (None, ParamValue::Numeric(def)) => {
                    let v = match def.test_value {
                        Some(test_value) if use_test_values => test_value,
                        _ => def.default,
                    };
                    (EvalValue::Scalar(v), def.unit.clone())
                }
                (None, ParamValue::ExternalRef(node)) => {
                    return Err(ExpressionError::evaluation(
                        &self.format_string,
                        format!("parameter {key} is bound to graph node {} and has no value", node.node_name),
                    ))
                }
                (None, _) => {
                    return Err(ExpressionError::evaluation(
                        &self.format_string,
                        format!("parameter {key} is not expanded"),
                    ))
                }
            };
            inputs.push(Input {
                key: key.clone(),
                slot: i,
                value,
                unit,
            });
        }
        if let Some(empty) = inputs.iter().find(|input| input.value.is_empty()) {
            return Err(ExpressionError::InvalidValue {
                key: empty.key.clone(),
                reason: "override array is empty".to_string(),
            });
        }
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ExternalRef, ParmOptions};
    use crate::graph::NodeKind;

    fn overrides(entries: &[(&str, EvalValue)]) -> HashMap<String, EvalValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn single(output: EvalOutput) -> Array1<f64> {
        match output {
            EvalOutput::Single(values) => values,
            EvalOutput::Series(_) => panic!("expected a single series"),
        }
    }

    #[test]
    fn test_nested_evaluation() {
        let mut expr = Expression::new("{a}+{b}").unwrap();
        let opts = ParmOptions::default();
        expr.set_parameter("b", Expression::new("{x}*2").unwrap(), &opts)
            .unwrap();
        expr.set_parameter("x", 5.0, &opts).unwrap();
        expr.set_parameter("a", 1.0, &opts).unwrap();
        let values = single(expr.eval(&HashMap::new(), false).unwrap());
        assert_eq!(values, array![11.0]);
    }

    #[test]
    fn test_variable_axis() {
        let expr = Expression::new("{a}*[t]")
            .unwrap()
            .with_parameter("a", 2.0)
            .unwrap();
        let t = EvalValue::from(vec![0.0, 1.0, 2.0]);
        let values = single(expr.eval(&overrides(&[("t", t)]), false).unwrap());
        assert_eq!(values, array![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_parameter_axis() {
        let expr = Expression::new("{a}*[t]").unwrap();
        let inputs = overrides(&[
            ("t", vec![0.0, 1.0, 2.0].into()),
            ("a", vec![1.0, 10.0].into()),
        ]);
        let evaluation = expr.evaluate(&inputs, false).unwrap();
        match &evaluation.output {
            EvalOutput::Series(series) => {
                assert_eq!(series.len(), 2);
                assert_eq!(series[0], array![0.0, 1.0, 2.0]);
                assert_eq!(series[1], array![0.0, 10.0, 20.0]);
            }
            EvalOutput::Single(_) => panic!("expected one series per value of a"),
        }
        assert_eq!(evaluation.plot.legend, vec!["a=1", "a=10"]);
        assert_eq!(evaluation.plot.x_axis.as_ref().unwrap().key, "t");
        assert_eq!(evaluation.plot.x_axis.as_ref().unwrap().unit.as_deref(), Some("s"));
        assert_eq!(evaluation.plot.series_axis.as_ref().unwrap().key, "a");
    }

    #[test]
    fn test_longer_parameter_becomes_variable_axis() {
        let expr = Expression::new("{a}*[t]").unwrap();
        let inputs = overrides(&[
            ("t", vec![1.0, 2.0].into()),
            ("a", vec![1.0, 2.0, 3.0].into()),
        ]);
        let evaluation = expr.evaluate(&inputs, false).unwrap();
        assert_eq!(evaluation.plot.x_axis.unwrap().key, "a");
        match evaluation.output {
            EvalOutput::Series(series) => {
                assert_eq!(series, vec![array![1.0, 2.0, 3.0], array![2.0, 4.0, 6.0]]);
            }
            EvalOutput::Single(_) => panic!("expected one series per value of t"),
        }
    }

    #[test]
    fn test_ambiguous_broadcast() {
        let expr = Expression::new("{a}*[t] + {b}").unwrap();
        let inputs = overrides(&[
            ("t", vec![0.0, 1.0].into()),
            ("a", vec![1.0, 2.0].into()),
            ("b", vec![3.0, 4.0].into()),
        ]);
        match expr.eval(&inputs, false).unwrap_err() {
            ExpressionError::AmbiguousBroadcast { keys } => assert_eq!(keys, ["t", "a", "b"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_test_values() {
        let opts = ParmOptions {
            test_value: Some(3.0),
            ..Default::default()
        };
        let mut expr = Expression::new("{a}*[t]").unwrap();
        expr.set_parameter("a", 1.0, &opts).unwrap();
        let values = single(expr.eval(&HashMap::new(), true).unwrap());
        assert_eq!(values.len(), 11);
        assert_eq!(values[10], 30.0);

        let values = single(expr.eval(&HashMap::new(), false).unwrap());
        assert_eq!(values, array![0.0]);
    }

    #[test]
    fn test_constant_expression_ignores_overrides() {
        let expr = Expression::new("2*3").unwrap();
        let inputs = overrides(&[("t", vec![0.0, 1.0].into())]);
        assert_eq!(single(expr.eval(&inputs, true).unwrap()), array![6.0]);
    }

    #[test]
    fn test_unknown_overrides_are_ignored() {
        let expr = Expression::new("{a}+1").unwrap();
        let inputs = overrides(&[("zz", 5.0.into())]);
        assert_eq!(single(expr.eval(&inputs, false).unwrap()), array![0.0]);
    }

    #[test]
    fn test_graph_node_needs_override() {
        let expr = Expression::new("{g}*2")
            .unwrap()
            .with_parameter("g", ExternalRef::new("gain", NodeKind::Parm))
            .unwrap();
        assert!(matches!(
            expr.eval(&HashMap::new(), false).unwrap_err(),
            ExpressionError::EvaluationFailed { .. }
        ));
        let inputs = overrides(&[("g", 4.0.into())]);
        assert_eq!(single(expr.eval(&inputs, false).unwrap()), array![8.0]);
    }

    #[test]
    fn test_domain_error() {
        let expr = Expression::new("sqrt({a})").unwrap();
        assert!(matches!(
            expr.eval(&HashMap::new(), false).unwrap_err(),
            ExpressionError::EvaluationFailed { .. }
        ));
    }

    #[test]
    fn test_terms_reassemble_to_same_values() {
        use crate::parse::find_additive_terms;

        let text = "-{a}*[t] + sin([t])*{b} - [t]^2/{c} + 4";
        let expr = Expression::new(text)
            .unwrap()
            .with_parameter("a", 1.5)
            .unwrap()
            .with_parameter("c", 2.0)
            .unwrap();
        let terms = find_additive_terms(text).unwrap();
        assert_eq!(terms.len(), 4);
        let positive = terms.positive.iter().map(|t| format!(" + ({t})"));
        let negative = terms.negative.iter().map(|t| format!(" - ({t})"));
        let rebuilt = format!("0{}", positive.chain(negative).collect::<String>());
        let mut reassembled = Expression::new(rebuilt).unwrap();
        for key in ["a", "b", "c"] {
            let value = expr.parameter_default(key).unwrap();
            reassembled
                .set_parameter(key, value, &ParmOptions::default())
                .unwrap();
        }

        let t = overrides(&[("t", vec![0.0, 0.3, 1.0, 2.5].into())]);
        let expected = single(expr.eval(&t, false).unwrap());
        let got = single(reassembled.eval(&t, false).unwrap());
        for (e, g) in expected.iter().zip(got.iter()) {
            assert!((e - g).abs() < 1e-12);
        }
    }

    #[test]
    fn test_plot_annotations() {
        let mut expr = Expression::with_label("line", "{a}*[t] + {b}").unwrap();
        expr.set_result_unit("Jy");
        let evaluation = expr
            .evaluate(&overrides(&[("t", vec![0.0, 1.0].into())]), false)
            .unwrap();
        assert_eq!(evaluation.plot.title, "line");
        assert_eq!(evaluation.plot.y_unit.as_deref(), Some("Jy"));
        assert_eq!(evaluation.plot.legend, vec!["line"]);
        assert_eq!(evaluation.plot.annotations, vec!["a=-1", "b=-1"]);
    }
}
