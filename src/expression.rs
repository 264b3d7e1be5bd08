//! The symbolic `Expression` type.
//!
//! An expression is a format string over `{parameter}` and `[variable]` placeholders together
//! with a definition record for every placeholder. Parameters may be bound to numbers, to other
//! expressions (owned, copied on clone), to funklets or to nodes of an external graph.
//!
//! # Example
//!
//! ```
//! use evalexpr_funklet::{Expression, ParmOptions};
//!
//! let mut beam = Expression::new("{a}*[t] + {b}").unwrap();
//! beam.set_parameter("a", 2.0, &ParmOptions::default()).unwrap();
//! beam.set_parameter("b", Expression::new("{x}*2").unwrap(), &ParmOptions::default()).unwrap();
//! beam.set_parameter("x", 5.0, &ParmOptions::default()).unwrap();
//! assert_eq!(beam.expand().unwrap().format_string(), "{a}*[t] + ({b_x}*2)");
//! ```
//!
//! Mutating methods validate their input before touching any record; a rejected call leaves
//! the expression exactly as it was. Every successful mutation drops the cached expansion and
//! funklet.

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use colored::Colorize;
use itertools::Itertools;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rustc_hash::FxHasher;

use crate::convert::{named_constant, parse_closed_form};
use crate::definition::{NumericDef, ParamValue, ParmInput, ParmOptions, VarDef, VarOptions};
use crate::errors::ExpressionError;
use crate::expand::{Expanded, Origin};
use crate::funklet::FunkletDef;
use crate::parse::{bare_identifiers, canonical_parameter_key, placeholders, PlaceholderKind};

static NEXT_LABEL: AtomicU64 = AtomicU64::new(1);

/// A parameterized symbolic expression.
#[derive(Clone)]
pub struct Expression {
    pub(crate) label: String,
    pub(crate) format_string: String,
    pub(crate) description: Option<String>,
    pub(crate) result_unit: Option<String>,
    pub(crate) parameter_order: Vec<String>,
    pub(crate) parameters: HashMap<String, ParamValue>,
    pub(crate) variable_order: Vec<String>,
    pub(crate) variables: HashMap<String, VarDef>,
    pub(crate) scope_qualifiers: BTreeMap<String, String>,
    pub(crate) numeric_value: Option<f64>,
    /// Declarations behind each parameter of an expanded expression
    pub(crate) origins: HashMap<String, Vec<Origin>>,
    pub(crate) expanded: OnceCell<Expanded>,
    pub(crate) funklet: OnceCell<FunkletDef>,
}

impl Expression {
    /// Creates an expression with an automatically assigned label (`E1`, `E2`, ...).
    ///
    /// Every placeholder is declared with a fresh definition record. A format string without
    /// placeholders is evaluated immediately and must be a valid closed-form expression.
    ///
    /// # Errors
    /// * `MalformedExpression` - Unbalanced brackets, an invalid placeholder, or a bare name
    ///   outside placeholders that is neither a function call nor `pi`/`e`
    /// * `Parse`/`Convert`/`EvaluationFailed` - A numeric-only string that cannot be evaluated
    pub fn new(format_string: impl Into<String>) -> Result<Self, ExpressionError> {
        let label = format!("E{}", NEXT_LABEL.fetch_add(1, Ordering::Relaxed));
        Self::build(label, format_string.into())
    }

    /// Creates an expression with an explicit label.
    pub fn with_label(
        label: impl Into<String>,
        format_string: impl Into<String>,
    ) -> Result<Self, ExpressionError> {
        Self::build(label.into(), format_string.into())
    }

    pub(crate) fn build(label: String, format_string: String) -> Result<Self, ExpressionError> {
        let mut parameter_order = Vec::new();
        let mut parameters = HashMap::new();
        let mut variable_order = Vec::new();
        let mut variables = HashMap::new();

        if let Some(name) = bare_identifiers(&format_string)?
            .into_iter()
            .find(|name| named_constant(name).is_none())
        {
            return Err(ExpressionError::malformed(
                &format_string,
                format!("`{name}` is neither a placeholder nor a known constant"),
            ));
        }

        for placeholder in placeholders(&format_string)? {
            match placeholder.kind {
                PlaceholderKind::Parameter => {
                    if !parameters.contains_key(&placeholder.key) {
                        parameter_order.push(placeholder.key.clone());
                        parameters.insert(
                            placeholder.key,
                            ParamValue::Numeric(NumericDef::placeholder(placeholder.multi_index)),
                        );
                    }
                }
                PlaceholderKind::Variable => {
                    if !variables.contains_key(&placeholder.key) {
                        variable_order.push(placeholder.key.clone());
                        variables.insert(placeholder.key.clone(), VarDef::for_key(&placeholder.key));
                    }
                }
            }
        }

        let numeric_value = if parameters.is_empty() && variables.is_empty() {
            parse_closed_form(&format_string, &HashMap::new())?
                .constant_value()
                .transpose()
                .map_err(|e| ExpressionError::evaluation(&format_string, e))?
        } else {
            None
        };

        Ok(Self {
            label,
            format_string,
            description: None,
            result_unit: None,
            parameter_order,
            parameters,
            variable_order,
            variables,
            scope_qualifiers: BTreeMap::new(),
            numeric_value,
            origins: HashMap::new(),
            expanded: OnceCell::new(),
            funklet: OnceCell::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format_string(&self) -> &str {
        &self.format_string
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Unit of the evaluated result, used for plot labels.
    pub fn result_unit(&self) -> Option<&str> {
        self.result_unit.as_deref()
    }

    pub fn set_result_unit(&mut self, unit: impl Into<String>) {
        self.result_unit = Some(unit.into());
    }

    /// Parameter keys in order of first appearance.
    pub fn parameter_order(&self) -> &[String] {
        &self.parameter_order
    }

    /// Variable keys in order of first appearance.
    pub fn variable_order(&self) -> &[String] {
        &self.variable_order
    }

    pub fn parameter(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    /// Current default of a numeric parameter.
    pub fn parameter_default(&self, key: &str) -> Option<f64> {
        self.parameters
            .get(key)
            .and_then(ParamValue::as_numeric)
            .map(|def| def.default)
    }

    /// The expression bound to a parameter, if any.
    pub fn nested(&self, key: &str) -> Option<&Expression> {
        match self.parameters.get(key) {
            Some(ParamValue::Nested(child)) => Some(child),
            _ => None,
        }
    }

    pub fn variable(&self, key: &str) -> Option<&VarDef> {
        self.variables.get(key)
    }

    /// Value of an expression without placeholders.
    pub fn numeric_value(&self) -> Option<f64> {
        self.numeric_value
    }

    pub fn scope_qualifiers(&self) -> &BTreeMap<String, String> {
        &self.scope_qualifiers
    }

    /// Binds a parameter.
    ///
    /// A number replaces the default (and nominal default) of the record; an `Expression`,
    /// `FunkletDef` or `ExternalRef` replaces the whole binding. With `opts.recurse` the value
    /// is also applied to every nested expression declaring the key, at any depth.
    ///
    /// # Arguments
    /// * `key` - Parameter key, either canonical (`A_01`) or bracketed (`A[0,1]`)
    /// * `value` - The new binding
    /// * `opts` - Metadata overrides and recursion control
    ///
    /// # Errors
    /// * `UnknownKey` - No level of the expression tree declares the key
    /// * `InvalidValue` - The value or options were rejected
    pub fn set_parameter(
        &mut self,
        key: &str,
        value: impl Into<ParmInput>,
        opts: &ParmOptions,
    ) -> Result<(), ExpressionError> {
        let (key, _) = canonical_parameter_key(key)?;
        let value = value.into();
        value.validate(&key)?;
        opts.validate(&key)?;
        if !self.declares_parameter(&key, opts.recurse) {
            return Err(ExpressionError::UnknownKey(key));
        }
        debug!("{}: setting parameter {} to {:?}", self.label, key, value);
        self.apply_parameter(&key, &value, opts);
        Ok(())
    }

    /// Consuming form of `set_parameter` with default options.
    pub fn with_parameter(
        mut self,
        key: &str,
        value: impl Into<ParmInput>,
    ) -> Result<Self, ExpressionError> {
        self.set_parameter(key, value, &ParmOptions::default())?;
        Ok(self)
    }

    fn declares_parameter(&self, key: &str, recurse: bool) -> bool {
        self.parameters.contains_key(key)
            || (recurse && self.children().any(|child| child.declares_parameter(key, true)))
    }

    fn apply_parameter(&mut self, key: &str, value: &ParmInput, opts: &ParmOptions) {
        if opts.recurse {
            for (k, binding) in self.parameters.iter_mut() {
                if let ParamValue::Nested(child) = binding {
                    if k != key && child.declares_parameter(key, true) {
                        child.apply_parameter(key, value, opts);
                    }
                }
            }
        }
        if let Some(current) = self.parameters.get(key) {
            let updated = match value {
                ParmInput::Value(v) => match current {
                    ParamValue::Numeric(def) => ParamValue::Numeric(def.updated(*v, opts)),
                    _ => ParamValue::Numeric(NumericDef::placeholder(vec![]).updated(*v, opts)),
                },
                ParmInput::Expression(e) => ParamValue::Nested(Box::new(e.clone())),
                ParmInput::Funklet(f) => ParamValue::Funklet(f.clone()),
                ParmInput::Node(node) => ParamValue::ExternalRef(node.clone()),
            };
            self.parameters.insert(key.to_string(), updated);
        }
        self.invalidate();
    }

    /// Binds a variable's default, unit and test range.
    ///
    /// # Errors
    /// * `UnknownKey` - No level of the expression tree declares the variable
    /// * `InvalidValue` - The value is not finite
    pub fn set_variable(
        &mut self,
        key: &str,
        value: f64,
        opts: &VarOptions,
    ) -> Result<(), ExpressionError> {
        if !value.is_finite() {
            return Err(ExpressionError::InvalidValue {
                key: key.to_string(),
                reason: "default must be finite".to_string(),
            });
        }
        if let Some(range) = opts.test_range {
            if !(range.min.is_finite() && range.max.is_finite()) || range.count == 0 {
                return Err(ExpressionError::InvalidValue {
                    key: key.to_string(),
                    reason: "test range must be finite and non-empty".to_string(),
                });
            }
        }
        if !self.declares_variable(key, opts.recurse) {
            return Err(ExpressionError::UnknownKey(key.to_string()));
        }
        debug!("{}: setting variable {} to {}", self.label, key, value);
        self.apply_variable(key, value, opts);
        Ok(())
    }

    /// Consuming form of `set_variable` with default options.
    pub fn with_variable(mut self, key: &str, value: f64) -> Result<Self, ExpressionError> {
        self.set_variable(key, value, &VarOptions::default())?;
        Ok(self)
    }

    fn declares_variable(&self, key: &str, recurse: bool) -> bool {
        self.variables.contains_key(key)
            || (recurse && self.children().any(|child| child.declares_variable(key, true)))
    }

    fn apply_variable(&mut self, key: &str, value: f64, opts: &VarOptions) {
        if opts.recurse {
            for binding in self.parameters.values_mut() {
                if let ParamValue::Nested(child) = binding {
                    if child.declares_variable(key, true) {
                        child.apply_variable(key, value, opts);
                    }
                }
            }
        }
        if let Some(def) = self.variables.get_mut(key) {
            *def = def.updated(value, opts);
        }
        self.invalidate();
    }

    /// Restores every default to its nominal value, recursively.
    pub fn reset_to_nominal(&mut self) {
        for def in self.variables.values_mut() {
            def.numeric.default = def.numeric.nominal_default;
        }
        for binding in self.parameters.values_mut() {
            match binding {
                ParamValue::Numeric(def) => {
                    def.default = def.nominal_default;
                    def.recompute_test_range();
                }
                ParamValue::Nested(child) => child.reset_to_nominal(),
                _ => {}
            }
        }
        self.invalidate();
    }

    /// Redraws every non-constant parameter default as `nominal + N(0, stddev·scale)`.
    ///
    /// Parameters are visited in declaration order, nested expressions depth first, so a
    /// seeded `rng` gives reproducible defaults.
    pub fn perturb_defaults<R: Rng + ?Sized>(
        &mut self,
        stddev: f64,
        rng: &mut R,
    ) -> Result<(), ExpressionError> {
        if !stddev.is_finite() || stddev < 0.0 {
            return Err(ExpressionError::InvalidValue {
                key: self.label.clone(),
                reason: format!("perturbation stddev {stddev} must be finite and non-negative"),
            });
        }
        self.redraw_defaults(&|def: &NumericDef| stddev * def.scale, rng)
    }

    /// Returns a copy bound to a scope.
    ///
    /// The copy carries `qualifiers` (they become part of its graph node names) and its
    /// defaults are redrawn from each parameter's own `stddev`, with a generator seeded from
    /// the qualifiers: the same scope always yields the same defaults.
    pub fn with_scope(
        &self,
        qualifiers: BTreeMap<String, String>,
    ) -> Result<Expression, ExpressionError> {
        let mut rng = StdRng::seed_from_u64(scope_seed(&qualifiers));

        let mut scoped = self.clone();
        scoped.set_scope_qualifiers(&qualifiers);
        scoped.redraw_defaults(&|def: &NumericDef| def.stddev, &mut rng)?;
        Ok(scoped)
    }

    fn set_scope_qualifiers(&mut self, qualifiers: &BTreeMap<String, String>) {
        self.scope_qualifiers = qualifiers.clone();
        for binding in self.parameters.values_mut() {
            if let ParamValue::Nested(child) = binding {
                child.set_scope_qualifiers(qualifiers);
            }
        }
        self.invalidate();
    }

    fn redraw_defaults<R: Rng + ?Sized>(
        &mut self,
        sigma: &dyn Fn(&NumericDef) -> f64,
        rng: &mut R,
    ) -> Result<(), ExpressionError> {
        for key in &self.parameter_order {
            match self.parameters.get_mut(key) {
                Some(ParamValue::Numeric(def)) => {
                    let spread = if def.constant { 0.0 } else { sigma(def) };
                    let offset = if spread > 0.0 {
                        Normal::new(0.0, spread)
                            .map_err(|e| ExpressionError::InvalidValue {
                                key: key.clone(),
                                reason: e.to_string(),
                            })?
                            .sample(rng)
                    } else {
                        0.0
                    };
                    def.default = def.nominal_default + offset;
                    def.recompute_test_range();
                }
                Some(ParamValue::Nested(child)) => child.redraw_defaults(sigma, rng)?,
                _ => {}
            }
        }
        self.invalidate();
        Ok(())
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = &Expression> {
        self.parameters.values().filter_map(|binding| match binding {
            ParamValue::Nested(child) => Some(child.as_ref()),
            _ => None,
        })
    }

    pub(crate) fn invalidate(&mut self) {
        self.expanded = OnceCell::new();
        self.funklet = OnceCell::new();
    }

    fn describe_binding(binding: &ParamValue) -> String {
        match binding {
            ParamValue::Numeric(def) => def.default.to_string(),
            ParamValue::Nested(child) => format!("({})", child.format_string),
            ParamValue::Funklet(f) => format!("funklet({})", f.basis),
            ParamValue::ExternalRef(node) => format!("node({})", node.node_name),
        }
    }

    fn write_summary(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parameters = self
            .parameter_order
            .iter()
            .map(|k| format!("{}={}", k, Self::describe_binding(&self.parameters[k])))
            .join(", ");
        let variables = self
            .variable_order
            .iter()
            .map(|k| format!("{}={}", k, self.variables[k].default()))
            .join(", ");
        writeln!(f, "{{\n")?;
        writeln!(f, "    {}: {}\n", "Label".cyan(), self.label)?;
        writeln!(f, "    {}: {}\n", "Expression".cyan(), self.format_string)?;
        writeln!(f, "    {}: [{}]\n", "Parameters".cyan(), parameters)?;
        writeln!(f, "    {}: [{}]\n", "Variables".cyan(), variables)?;
        writeln!(f, "}}")?;
        Ok(())
    }
}

impl std::fmt::Debug for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.write_summary(f)
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.write_summary(f)
    }
}

/// Seed derived from the qualifier bytes only, so it does not depend on std's `Hash` impls.
fn scope_seed(qualifiers: &BTreeMap<String, String>) -> u64 {
    let mut hasher = FxHasher::default();
    for (key, value) in qualifiers {
        hasher.write(key.as_bytes());
        hasher.write_u8(0xff);
        hasher.write(value.as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}

impl PartialEq for Expression {
    /// Structural equality; labels and caches are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.format_string == other.format_string
            && self.parameter_order == other.parameter_order
            && self.parameters == other.parameters
            && self.variable_order == other.variable_order
            && self.variables == other.variables
            && self.numeric_value == other.numeric_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ExternalRef, PLACEHOLDER_DEFAULT};
    use crate::graph::NodeKind;

    fn set(expr: &mut Expression, key: &str, value: impl Into<ParmInput>) {
        expr.set_parameter(key, value, &ParmOptions::default())
            .unwrap();
    }

    #[test]
    fn test_declares_placeholders_in_order() {
        let expr = Expression::new("{b}*[t] + {a}*{b} + {A[0,1]}*[f] + [t]").unwrap();
        assert_eq!(expr.parameter_order(), ["b", "a", "A_01"]);
        assert_eq!(expr.variable_order(), ["t", "f"]);
        assert_eq!(expr.parameter_default("a"), Some(PLACEHOLDER_DEFAULT));
        let def = expr.parameter("A_01").unwrap().as_numeric().unwrap();
        assert_eq!(def.multi_index, vec![0, 1]);
        assert!(expr.numeric_value().is_none());
    }

    #[test]
    fn test_labels_are_unique() {
        let a = Expression::new("{a}").unwrap();
        let b = Expression::new("{a}").unwrap();
        assert_ne!(a.label(), b.label());
        assert_eq!(a.format_string(), b.format_string());
        let named = Expression::with_label("gain", "{g}").unwrap();
        assert_eq!(named.label(), "gain");
    }

    #[test]
    fn test_numeric_only_expression() {
        let expr = Expression::new("2*(3+4)").unwrap();
        assert_eq!(expr.numeric_value(), Some(14.0));
        assert!(Expression::new("2*(3+").is_err());
        assert!(Expression::new("q + 1").is_err());
    }

    #[test]
    fn test_malformed_format_string() {
        assert!(matches!(
            Expression::new("{a}*([t]").unwrap_err(),
            ExpressionError::MalformedExpression { .. }
        ));
        assert!(Expression::new("{a}]").is_err());
    }

    #[test]
    fn test_bare_names_are_rejected() {
        for text in ["{a} + p0", "{a}*x1", "[t] + foo"] {
            assert!(matches!(
                Expression::new(text).unwrap_err(),
                ExpressionError::MalformedExpression { ref reason, .. } if reason.contains('`')
            ));
        }
        let expr = Expression::new("2*pi*{a}*sin(e*[t])").unwrap();
        assert_eq!(expr.parameter_order(), ["a"]);
    }

    #[test]
    #[should_panic]
    fn test_unclosed_placeholder_invalid() {
        let _ = Expression::new("{a*[t]").expect("Malformed expression");
    }

    #[test]
    fn test_set_numeric_parameter() {
        let mut expr = Expression::new("{a}*[t]").unwrap();
        set(&mut expr, "a", 4.0);
        let def = expr.parameter("a").unwrap().as_numeric().unwrap();
        assert_eq!(def.default, 4.0);
        assert_eq!(def.nominal_default, 4.0);
        assert_eq!(def.scale, 4.0);

        let opts = ParmOptions {
            stddev: Some(0.5),
            unit: Some("Jy".to_string()),
            ..Default::default()
        };
        expr.set_parameter("a", 5.0, &opts).unwrap();
        let def = expr.parameter("a").unwrap().as_numeric().unwrap();
        assert_eq!(def.stddev, 0.5);
        assert_eq!(def.unit.as_deref(), Some("Jy"));
    }

    #[test]
    fn test_unknown_key() {
        let mut expr = Expression::new("{a}*[t]").unwrap();
        let err = expr
            .set_parameter("z", 1.0, &ParmOptions::default())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::UnknownKey(ref k) if k == "z"));
        assert!(expr
            .set_variable("x", 1.0, &VarOptions::default())
            .is_err());
    }

    #[test]
    fn test_rejected_value_leaves_state() {
        let mut expr = Expression::new("{a}*[t]").unwrap();
        set(&mut expr, "a", 3.0);
        let before = expr.clone();
        assert!(expr
            .set_parameter("a", f64::INFINITY, &ParmOptions::default())
            .is_err());
        assert!(expr
            .set_variable("t", f64::NAN, &VarOptions::default())
            .is_err());
        assert_eq!(expr, before);
    }

    #[test]
    fn test_recursive_set() {
        let mut expr = Expression::new("{a} + {b}").unwrap();
        let child = Expression::new("{x}*{a}").unwrap();
        set(&mut expr, "b", child);
        set(&mut expr, "a", 7.0);
        assert_eq!(expr.parameter_default("a"), Some(7.0));
        assert_eq!(expr.nested("b").unwrap().parameter_default("a"), Some(7.0));

        // only the nested expression declares x
        set(&mut expr, "x", 2.0);
        assert_eq!(expr.nested("b").unwrap().parameter_default("x"), Some(2.0));

        let local = ParmOptions {
            recurse: false,
            ..Default::default()
        };
        assert!(matches!(
            expr.set_parameter("x", 3.0, &local).unwrap_err(),
            ExpressionError::UnknownKey(_)
        ));
        expr.set_parameter("a", 1.0, &local).unwrap();
        assert_eq!(expr.parameter_default("a"), Some(1.0));
        assert_eq!(expr.nested("b").unwrap().parameter_default("a"), Some(7.0));
    }

    #[test]
    fn test_clone_is_deep() {
        let mut expr = Expression::new("{a}*{b}").unwrap();
        set(&mut expr, "b", Expression::new("{x}+1").unwrap());
        let mut copy = expr.clone();
        set(&mut copy, "x", 9.0);
        assert_eq!(copy.nested("b").unwrap().parameter_default("x"), Some(9.0));
        assert_eq!(
            expr.nested("b").unwrap().parameter_default("x"),
            Some(PLACEHOLDER_DEFAULT)
        );
    }

    #[test]
    fn test_bind_external_node() {
        let mut expr = Expression::new("{g}*[t]").unwrap();
        set(&mut expr, "g", ExternalRef::new("gain:ant1", NodeKind::Parm));
        assert!(matches!(
            expr.parameter("g"),
            Some(ParamValue::ExternalRef(node)) if node.node_name == "gain:ant1"
        ));
        set(&mut expr, "g", 2.0);
        assert_eq!(expr.parameter_default("g"), Some(2.0));
    }

    #[test]
    fn test_set_variable() {
        let mut expr = Expression::new("{a}*[t] + [f]").unwrap();
        expr.set_variable("t", 5.0, &VarOptions::default()).unwrap();
        let t = expr.variable("t").unwrap();
        assert_eq!(t.default(), 5.0);
        assert_eq!(t.numeric.test_range.min, 2.5);
        assert_eq!(t.numeric.test_range.max, 7.5);
        assert_eq!(expr.variable("f").unwrap().default(), 1e8);
    }

    #[test]
    fn test_perturb_and_reset() {
        let mut expr = Expression::new("{a}*[t] + {c}").unwrap();
        set(&mut expr, "a", 10.0);
        let constant = ParmOptions {
            constant: Some(true),
            ..Default::default()
        };
        expr.set_parameter("c", 3.0, &constant).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        expr.perturb_defaults(0.1, &mut rng).unwrap();
        assert_ne!(expr.parameter_default("a"), Some(10.0));
        assert_eq!(expr.parameter_default("c"), Some(3.0));

        expr.reset_to_nominal();
        assert_eq!(expr.parameter_default("a"), Some(10.0));
        assert!(expr.perturb_defaults(-1.0, &mut rng).is_err());
    }

    #[test]
    fn test_perturbation_is_reproducible() {
        let mut a = Expression::new("{a}*[t]").unwrap();
        set(&mut a, "a", 10.0);
        let mut b = a.clone();
        a.perturb_defaults(0.2, &mut StdRng::seed_from_u64(7)).unwrap();
        b.perturb_defaults(0.2, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a.parameter_default("a"), b.parameter_default("a"));
    }

    #[test]
    fn test_scope_seed_depends_on_qualifier_bytes() {
        let scope = |k: &str, v: &str| BTreeMap::from([(k.to_string(), v.to_string())]);
        assert_eq!(scope_seed(&scope("station", "CS001")), scope_seed(&scope("station", "CS001")));
        assert_ne!(scope_seed(&scope("ab", "c")), scope_seed(&scope("a", "bc")));
        assert_ne!(scope_seed(&scope("station", "CS001")), scope_seed(&BTreeMap::new()));
    }

    #[test]
    fn test_with_scope() {
        let mut expr = Expression::new("{a}*[t]").unwrap();
        let opts = ParmOptions {
            stddev: Some(1.0),
            ..Default::default()
        };
        expr.set_parameter("a", 10.0, &opts).unwrap();

        let scope = BTreeMap::from([("station".to_string(), "CS001".to_string())]);
        let first = expr.with_scope(scope.clone()).unwrap();
        let second = expr.with_scope(scope).unwrap();
        assert_eq!(first.parameter_default("a"), second.parameter_default("a"));
        assert_ne!(first.parameter_default("a"), Some(10.0));
        assert_eq!(first.scope_qualifiers()["station"], "CS001");

        assert_eq!(expr.parameter_default("a"), Some(10.0));
        assert!(expr.scope_qualifiers().is_empty());
    }

    #[test]
    fn test_display() {
        let expr = Expression::with_label("beam", "{a}*[t]").unwrap();
        let shown = format!("{}", expr);
        assert!(shown.contains("beam"));
        assert!(shown.contains("{a}*[t]"));
        assert!(shown.contains("a=-1"));
    }
}
