//! Linear least-squares fitting of parameter defaults.
//!
//! The expanded expression is split into its top-level additive terms. Every term must carry
//! exactly one unknown (a non-constant numeric parameter) and be linear in it; the remaining
//! parameters keep their defaults. For sample `r` and term `k` with unknown `u`, the design
//! matrix entry is the term evaluated with `u = 1`, so the expression value is `A·u`.
//! Terms sharing an unknown add up in one column. A term that is a whole parenthesized sum,
//! as left by splicing a nested expression, is split further with its sign carried through.

use std::collections::HashMap;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::definition::ParamValue;
use crate::errors::ExpressionError;
use crate::expand::{Origin, Target};
use crate::expr::Expr;
use crate::expression::Expression;
use crate::parse::{find_additive_terms, placeholders, strip_enclosing_parens, PlaceholderKind};
use crate::slots::SlotMap;

/// Singular values below this absolute threshold are treated as zero.
pub const SVD_TOLERANCE: f64 = 1e-12;

const LINEARITY_TOLERANCE: f64 = 1e-9;

/// One observation: variable values and the measured value of the expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub variables: HashMap<String, f64>,
    pub value: f64,
}

impl Sample {
    pub fn new(variables: impl IntoIterator<Item = (String, f64)>, value: f64) -> Self {
        Self {
            variables: variables.into_iter().collect(),
            value,
        }
    }
}

/// Solution of a least-squares fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    /// Unknowns in column order, as named in the expanded expression
    pub keys: Vec<String>,
    pub coefficients: Vec<f64>,
    /// `observed - fitted`, per sample
    pub residuals: Vec<f64>,
}

impl FitResult {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|i| self.coefficients[i])
    }

    /// Root mean square of the residuals.
    pub fn rms(&self) -> f64 {
        if self.residuals.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.residuals.iter().map(|r| r * r).sum();
        (sum / self.residuals.len() as f64).sqrt()
    }
}

struct Term {
    text: String,
    sign: f64,
    column: usize,
    slot: usize,
    expr: Expr,
}

impl Expression {
    /// Solves for the unknown parameters without modifying the expression.
    ///
    /// # Errors
    /// * `UnfittableExpression` - A term has zero or several unknowns, is not linear in its
    ///   unknown, or the system cannot be solved
    /// * `InvalidValue` - A sample misses one of the expression's variables
    pub fn solve_least_squares(&self, samples: &[Sample]) -> Result<FitResult, ExpressionError> {
        let flat = self.expand()?;
        if samples.is_empty() {
            return Err(ExpressionError::UnfittableExpression {
                term: flat.format_string.clone(),
                reason: "no samples".to_string(),
            });
        }
        let slots = SlotMap::for_expression(flat);
        let (keys, terms) = flat.linear_terms(&slots)?;

        let mut base = vec![0.0; slots.width()];
        for (i, key) in slots.params.iter().enumerate() {
            if let ParamValue::Numeric(def) = &flat.parameters[key] {
                base[i] = def.default;
            }
        }

        let mut design = DMatrix::<f64>::zeros(samples.len(), keys.len());
        let mut observed = DVector::<f64>::zeros(samples.len());
        for (r, sample) in samples.iter().enumerate() {
            let mut values = base.clone();
            for (j, key) in slots.vars.iter().enumerate() {
                let value = sample.variables.get(key).ok_or_else(|| {
                    ExpressionError::InvalidValue {
                        key: key.clone(),
                        reason: format!("sample {r} has no value for this variable"),
                    }
                })?;
                values[slots.params.len() + j] = *value;
            }
            for term in &terms {
                values[term.slot] = 1.0;
                let unit = evaluate_term(term, &values)?;
                values[term.slot] = 2.0;
                let double = evaluate_term(term, &values)?;
                values[term.slot] = base[term.slot];
                if unit.is_finite()
                    && (double - 2.0 * unit).abs() > LINEARITY_TOLERANCE * unit.abs().max(1.0)
                {
                    return Err(ExpressionError::UnfittableExpression {
                        term: term.text.clone(),
                        reason: format!("term is not linear in {}", keys[term.column]),
                    });
                }
                design[(r, term.column)] += term.sign * unit;
            }
            observed[r] = sample.value;
        }

        let solution = design
            .clone()
            .svd(true, true)
            .solve(&observed, SVD_TOLERANCE)
            .map_err(|reason| ExpressionError::UnfittableExpression {
                term: flat.format_string.clone(),
                reason: reason.to_string(),
            })?;
        let residuals = &observed - &design * &solution;
        debug!(
            "{}: fitted {:?} = {:?} over {} samples, residual norm {}",
            flat.label,
            keys,
            solution.as_slice(),
            samples.len(),
            residuals.norm()
        );

        Ok(FitResult {
            keys,
            coefficients: solution.iter().copied().collect(),
            residuals: residuals.iter().copied().collect(),
        })
    }

    /// Fits the unknown parameters and stores the solution as their new defaults.
    ///
    /// Solved keys are written back to every declaration they were expanded from: nested
    /// expressions, funklet coefficients and each level declaring a global key. Fitted
    /// parameters get a zero `stddev`.
    ///
    /// # Errors
    /// * `UnknownKey` - A solved key cannot be traced back to a declaration; nothing is stored
    pub fn fit(&mut self, samples: &[Sample]) -> Result<FitResult, ExpressionError> {
        let result = self.solve_least_squares(samples)?;
        let flat = self.expand()?;
        let mut targets: Vec<(Origin, f64)> = Vec::new();
        for (key, value) in result.keys.iter().zip(&result.coefficients) {
            for origin in flat.origins_of(key) {
                self.check_origin(&origin.path, &origin.target)?;
                targets.push((origin, *value));
            }
        }
        for (origin, value) in targets {
            debug!("{}: storing {} at {:?}", self.label, value, origin);
            self.assign_fitted(&origin.path, &origin.target, value);
        }
        self.invalidate();
        Ok(result)
    }

    /// Splits the flat expression into terms, each bound to the column of its unknown.
    fn linear_terms(&self, slots: &SlotMap) -> Result<(Vec<String>, Vec<Term>), ExpressionError> {
        let mut signed = Vec::new();
        collect_terms(&self.format_string, 1.0, &mut signed)?;

        let mut keys: Vec<String> = Vec::new();
        let mut terms = Vec::new();
        for (text, sign) in &signed {
            let sign = *sign;
            let mut unknowns: Vec<String> = Vec::new();
            for placeholder in placeholders(text)? {
                if placeholder.kind != PlaceholderKind::Parameter
                    || unknowns.contains(&placeholder.key)
                {
                    continue;
                }
                match &self.parameters[&placeholder.key] {
                    ParamValue::Numeric(def) if !def.constant => unknowns.push(placeholder.key),
                    ParamValue::Numeric(_) => {}
                    _ => {
                        return Err(ExpressionError::UnfittableExpression {
                            term: text.clone(),
                            reason: format!("{} has no numeric value", placeholder.key),
                        })
                    }
                }
            }
            let unknown = match unknowns.as_slice() {
                [one] => one.clone(),
                _ => {
                    return Err(ExpressionError::UnfittableExpression {
                        term: text.clone(),
                        reason: format!(
                            "expected exactly one unknown parameter, found {}",
                            unknowns.len()
                        ),
                    })
                }
            };
            let column = match keys.iter().position(|k| *k == unknown) {
                Some(column) => column,
                None => {
                    keys.push(unknown.clone());
                    keys.len() - 1
                }
            };
            let slot = slots.param_slot(&unknown).ok_or_else(|| {
                ExpressionError::UnknownKey(unknown.clone())
            })?;
            let expr = slots
                .compile(text)
                .map_err(|e| ExpressionError::evaluation(text, e))?;
            terms.push(Term {
                text: text.clone(),
                sign,
                column,
                slot,
                expr,
            });
        }
        Ok((keys, terms))
    }

    /// Declaration at `path`/`target`, if it can hold a fitted value.
    fn check_origin(&self, path: &[String], target: &Target) -> Result<(), ExpressionError> {
        let missing = || ExpressionError::UnknownKey(path.join("_"));
        match (path.split_first(), target) {
            (None, Target::Parameter(key)) => match self.parameters.get(key) {
                Some(ParamValue::Numeric(_)) => Ok(()),
                _ => Err(ExpressionError::UnknownKey(key.clone())),
            },
            (Some((binding, rest)), _) => match (self.parameters.get(binding), target) {
                (Some(ParamValue::Nested(child)), _) => child.check_origin(rest, target),
                (Some(ParamValue::Funklet(funklet)), Target::Coefficient(i))
                    if rest.is_empty() && *i < funklet.coefficients.len() =>
                {
                    Ok(())
                }
                _ => Err(missing()),
            },
            (None, Target::Coefficient(_)) => Err(missing()),
        }
    }

    /// Stores a fitted value at a declaration checked by `check_origin`.
    fn assign_fitted(&mut self, path: &[String], target: &Target, value: f64) {
        match (path.split_first(), target) {
            (None, Target::Parameter(key)) => {
                if let Some(ParamValue::Numeric(def)) = self.parameters.get_mut(key) {
                    def.set_fitted(value);
                }
            }
            (Some((binding, rest)), _) => match self.parameters.get_mut(binding) {
                Some(ParamValue::Nested(child)) => child.assign_fitted(rest, target, value),
                Some(ParamValue::Funklet(funklet)) => {
                    if let Target::Coefficient(i) = target {
                        if let Some(c) = funklet.coefficients.get_mut(*i) {
                            *c = value;
                        }
                    }
                }
                _ => {}
            },
            (None, Target::Coefficient(_)) => {}
        }
        self.invalidate();
    }
}

/// Appends the additive terms of `text`, opening parenthesized sums.
fn collect_terms(
    text: &str,
    sign: f64,
    out: &mut Vec<(String, f64)>,
) -> Result<(), ExpressionError> {
    let inner = strip_enclosing_parens(text)?;
    let split = find_additive_terms(&inner)?;
    if inner == text && split.negative.is_empty() && split.positive.len() == 1 {
        out.push((text.to_string(), sign));
        return Ok(());
    }
    for term in &split.positive {
        collect_terms(term, sign, out)?;
    }
    for term in &split.negative {
        collect_terms(term, -sign, out)?;
    }
    Ok(())
}

fn evaluate_term(term: &Term, values: &[f64]) -> Result<f64, ExpressionError> {
    term.expr
        .evaluate(values)
        .map_err(|e| ExpressionError::evaluation(&term.text, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ParmOptions;
    use crate::eval::EvalValue;
    use crate::funklet::FunkletDef;

    fn time_samples(f: impl Fn(f64) -> f64) -> Vec<Sample> {
        (0..=10)
            .map(|i| {
                let t = i as f64;
                Sample::new([("t".to_string(), t)], f(t))
            })
            .collect()
    }

    #[test]
    fn test_recovers_coefficients() {
        let mut expr = Expression::new("{a}*[t] + {b}*[t]*[t]").unwrap();
        let samples = time_samples(|t| 2.0 * t - t * t);
        let result = expr.fit(&samples).unwrap();
        assert_eq!(result.keys, ["a", "b"]);
        assert!((result.get("a").unwrap() - 2.0).abs() < 1e-9);
        assert!((result.get("b").unwrap() + 1.0).abs() < 1e-9);
        assert!(result.rms() < 1e-9);

        assert!((expr.parameter_default("a").unwrap() - 2.0).abs() < 1e-9);
        let def = expr.parameter("b").unwrap().as_numeric().unwrap();
        assert!((def.nominal_default + 1.0).abs() < 1e-9);
        assert_eq!(def.stddev, 0.0);
    }

    #[test]
    fn test_negative_terms_and_known_factors() {
        let mut expr = Expression::new("{k}*{a}*[t] - {b}").unwrap();
        let opts = ParmOptions {
            constant: Some(true),
            ..Default::default()
        };
        expr.set_parameter("k", 3.0, &opts).unwrap();
        let samples = time_samples(|t| 3.0 * 0.5 * t - 4.0);
        let result = expr.solve_least_squares(&samples).unwrap();
        assert!((result.get("a").unwrap() - 0.5).abs() < 1e-9);
        assert!((result.get("b").unwrap() - 4.0).abs() < 1e-9);
        // solving alone leaves the defaults untouched
        assert_eq!(expr.parameter_default("a"), Some(-1.0));
    }

    #[test]
    fn test_shared_unknown() {
        let expr = Expression::new("{a}*[t] + {a}").unwrap();
        let samples = time_samples(|t| 3.0 * t + 3.0);
        let result = expr.solve_least_squares(&samples).unwrap();
        assert_eq!(result.keys, ["a"]);
        assert!((result.coefficients[0] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_writes_into_nested_expression() {
        let mut expr = Expression::new("{a}*[t] + {b}").unwrap();
        expr.set_parameter("b", Expression::new("{c}*[t]*[t]").unwrap(), &ParmOptions::default())
            .unwrap();
        let samples = time_samples(|t| 2.0 * t - t * t);
        let result = expr.fit(&samples).unwrap();
        assert_eq!(result.keys, ["a", "b_c"]);
        let c = expr.nested("b").unwrap().parameter_default("c").unwrap();
        assert!((c + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_writes_renamed_key_into_nested_expression() {
        let mut expr = Expression::new("{b_x}*[t] + {b}").unwrap();
        expr.set_parameter("b", Expression::new("{x}").unwrap(), &ParmOptions::default())
            .unwrap();
        let result = expr.fit(&time_samples(|t| 2.0 * t + 5.0)).unwrap();
        assert_eq!(result.keys, ["b_x", "b_x_2"]);

        assert!((expr.parameter_default("b_x").unwrap() - 2.0).abs() < 1e-9);
        let x = expr.nested("b").unwrap().parameter_default("x").unwrap();
        assert!((x - 5.0).abs() < 1e-9);
        let t = HashMap::from([("t".to_string(), EvalValue::Scalar(1.0))]);
        let value = expr.eval(&t, false).unwrap().series()[0][0];
        assert!((value - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_writes_funklet_coefficients() {
        let mut expr = Expression::new("{a}*[t] + {g}").unwrap();
        let basis = FunkletDef::new("p0 + p1*x0*x0", vec![0.0, 0.0]);
        expr.set_parameter("g", basis, &ParmOptions::default()).unwrap();
        let result = expr.fit(&time_samples(|t| 1.0 + 2.0 * t - t * t)).unwrap();
        assert_eq!(result.keys, ["a", "g_0", "g_1"]);

        let Some(ParamValue::Funklet(funklet)) = expr.parameter("g") else {
            panic!("g should stay a funklet");
        };
        assert!((funklet.coefficients[0] - 1.0).abs() < 1e-9);
        assert!((funklet.coefficients[1] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_writes_every_global_declaration() {
        let mut expr = Expression::new("{_g}*[t] + {b}").unwrap();
        expr.set_parameter(
            "b",
            Expression::new("{_g}*[t]*[t] + {c}").unwrap(),
            &ParmOptions::default(),
        )
        .unwrap();
        let result = expr.fit(&time_samples(|t| 2.0 * t + 2.0 * t * t + 1.0)).unwrap();
        assert_eq!(result.keys, ["_g", "b_c"]);

        let nested = expr.nested("b").unwrap();
        assert!((expr.parameter_default("_g").unwrap() - 2.0).abs() < 1e-9);
        assert!((nested.parameter_default("_g").unwrap() - 2.0).abs() < 1e-9);
        assert!((nested.parameter_default("c").unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_nested_sum_is_split_into_terms() {
        let mut expr = Expression::new("{a} - {b}").unwrap();
        expr.set_parameter(
            "b",
            Expression::new("{x}*[t] - {y}*[t]*[t]").unwrap(),
            &ParmOptions::default(),
        )
        .unwrap();
        // a - (x*t - y*t^2)
        let result = expr.solve_least_squares(&time_samples(|t| 3.0 - 2.0 * t - t * t)).unwrap();
        assert_eq!(result.keys, ["a", "b_x", "b_y"]);
        assert!((result.get("a").unwrap() - 3.0).abs() < 1e-9);
        assert!((result.get("b_x").unwrap() - 2.0).abs() < 1e-9);
        assert!((result.get("b_y").unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_term_without_unknown() {
        let expr = Expression::new("{a}*[t] + 2").unwrap();
        let err = expr.solve_least_squares(&time_samples(|t| t)).unwrap_err();
        assert!(matches!(
            err,
            ExpressionError::UnfittableExpression { ref term, .. } if term == "2"
        ));
    }

    #[test]
    fn test_term_with_two_unknowns() {
        let expr = Expression::new("{a}*{b}*[t]").unwrap();
        assert!(matches!(
            expr.solve_least_squares(&time_samples(|t| t)).unwrap_err(),
            ExpressionError::UnfittableExpression { .. }
        ));
    }

    #[test]
    fn test_nonlinear_term() {
        let expr = Expression::new("{a}^2*[t]").unwrap();
        assert!(matches!(
            expr.solve_least_squares(&time_samples(|t| t)).unwrap_err(),
            ExpressionError::UnfittableExpression { .. }
        ));
    }

    #[test]
    fn test_missing_variable_in_sample() {
        let expr = Expression::new("{a}*[t]").unwrap();
        let samples = vec![Sample::new([("f".to_string(), 1.0)], 1.0)];
        assert!(matches!(
            expr.solve_least_squares(&samples).unwrap_err(),
            ExpressionError::InvalidValue { ref key, .. } if key == "t"
        ));
        assert!(expr.solve_least_squares(&[]).is_err());
    }
}
