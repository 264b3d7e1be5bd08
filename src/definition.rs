//! Definition records for parameters and variables.
//!
//! Every `{parameter}` of an expression is bound to a `ParamValue`, every `[variable]` to a
//! `VarDef`. Numeric records carry a default, the nominal default it is reset to, a scale used
//! for perturbations and a test range derived from the default.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::ExpressionError;
use crate::expression::Expression;
use crate::funklet::FunkletDef;
use crate::graph::NodeKind;

/// Number of test increments on each side of a default.
pub const TEST_STEPS: usize = 5;

/// Default assigned to freshly declared parameters.
pub const PLACEHOLDER_DEFAULT: f64 = -1.0;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Sampling range `[min, max]` with `count` evenly spaced points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestRange {
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl TestRange {
    pub fn new(min: f64, max: f64, count: usize) -> Self {
        Self { min, max, count }
    }

    /// `[center - increment·steps, center + increment·steps]` with `2·steps + 1` points.
    pub fn around(center: f64, increment: f64, steps: usize) -> Self {
        let half = increment * steps as f64;
        Self::new(center - half, center + half, 2 * steps + 1)
    }

    /// The evenly spaced sample points of the range.
    pub fn samples(&self) -> Vec<f64> {
        match self.count {
            0 => vec![],
            1 => vec![self.min],
            n => {
                let step = (self.max - self.min) / (n - 1) as f64;
                (0..n).map(|i| self.min + step * i as f64).collect()
            }
        }
    }
}

/// Numeric metadata of a parameter or variable.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericDef {
    pub default: f64,
    pub nominal_default: f64,
    pub scale: f64,
    pub stddev: f64,
    pub unit: Option<String>,
    pub test_value: Option<f64>,
    /// Explicit test increment; derived from `scale` when unset
    pub test_increment: Option<f64>,
    pub test_range: TestRange,
    pub constant: bool,
    pub multi_index: Vec<usize>,
    /// Shared by copies of the same definition
    pub identity: u64,
}

impl NumericDef {
    /// A fresh definition with the given default.
    pub fn new(default: f64) -> Self {
        let mut def = Self {
            default,
            nominal_default: default,
            scale: default.abs(),
            stddev: 0.0,
            unit: None,
            test_value: None,
            test_increment: None,
            test_range: TestRange::new(default, default, 1),
            constant: false,
            multi_index: vec![],
            identity: next_identity(),
        };
        def.recompute_test_range();
        def
    }

    /// The record every placeholder starts out with.
    pub fn placeholder(multi_index: Vec<usize>) -> Self {
        Self {
            multi_index,
            ..Self::new(PLACEHOLDER_DEFAULT)
        }
    }

    fn increment(&self) -> f64 {
        self.test_increment.unwrap_or(if self.scale > 0.0 {
            self.scale / 10.0
        } else {
            0.1
        })
    }

    pub fn recompute_test_range(&mut self) {
        self.test_range = TestRange::around(self.default, self.increment(), TEST_STEPS);
    }

    /// Applies a new default and options, returning the updated record.
    ///
    /// The new default also becomes the nominal default; `scale` follows `|default|` unless
    /// given explicitly.
    pub(crate) fn updated(&self, default: f64, opts: &ParmOptions) -> Self {
        let mut def = self.clone();
        def.default = default;
        def.nominal_default = default;
        def.scale = opts.scale.unwrap_or(default.abs());
        if let Some(stddev) = opts.stddev {
            def.stddev = stddev;
        }
        if let Some(unit) = &opts.unit {
            def.unit = Some(unit.clone());
        }
        if let Some(test_value) = opts.test_value {
            def.test_value = Some(test_value);
        }
        if let Some(increment) = opts.test_increment {
            def.test_increment = Some(increment);
        }
        if let Some(constant) = opts.constant {
            def.constant = constant;
        }
        def.recompute_test_range();
        def
    }

    /// Records a solved value: default and nominal both move, the uncertainty is cleared.
    pub(crate) fn set_fitted(&mut self, value: f64) {
        self.default = value;
        self.nominal_default = value;
        self.scale = value.abs();
        self.stddev = 0.0;
        self.recompute_test_range();
    }
}

/// Axis a variable stands for, derived from the first letter of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AxisKind {
    Time,
    Freq,
    L,
    M,
    Other,
}

impl AxisKind {
    pub fn from_key(key: &str) -> Self {
        match key.chars().next() {
            Some('t') => AxisKind::Time,
            Some('f') => AxisKind::Freq,
            Some('l') => AxisKind::L,
            Some('m') => AxisKind::M,
            _ => AxisKind::Other,
        }
    }

    /// Position in the canonical axis ordering.
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Kind of the graph leaf emitted for a variable on this axis.
    pub fn node_kind(self) -> NodeKind {
        match self {
            AxisKind::Time => NodeKind::Time,
            AxisKind::Freq => NodeKind::Freq,
            AxisKind::L => NodeKind::L,
            AxisKind::M => NodeKind::M,
            AxisKind::Other => NodeKind::Grid,
        }
    }

    /// Built-in default, unit and test range of the axis.
    fn defaults(self) -> (f64, Option<&'static str>, TestRange) {
        match self {
            AxisKind::Time => (0.0, Some("s"), TestRange::new(0.0, 10.0, 11)),
            AxisKind::Freq => (1e8, Some("Hz"), TestRange::new(1e8, 2e8, 11)),
            AxisKind::L | AxisKind::M => (0.0, Some("rad"), TestRange::new(-0.1, 0.1, 11)),
            AxisKind::Other => (0.0, None, TestRange::new(-1.0, 1.0, 11)),
        }
    }
}

/// Definition of a `[variable]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
    pub numeric: NumericDef,
    pub axis: AxisKind,
}

impl VarDef {
    /// The built-in definition for a variable key.
    pub fn for_key(key: &str) -> Self {
        let axis = AxisKind::from_key(key);
        let (default, unit, test_range) = axis.defaults();
        let mut numeric = NumericDef::new(default);
        numeric.unit = unit.map(str::to_string);
        numeric.test_range = test_range;
        Self { numeric, axis }
    }

    pub fn default(&self) -> f64 {
        self.numeric.default
    }

    pub(crate) fn updated(&self, default: f64, opts: &VarOptions) -> Self {
        let mut def = self.clone();
        let numeric = &mut def.numeric;
        numeric.default = default;
        numeric.nominal_default = default;
        numeric.scale = opts.scale.unwrap_or(default.abs());
        if let Some(unit) = &opts.unit {
            numeric.unit = Some(unit.clone());
        }
        match opts.test_range {
            Some(range) => numeric.test_range = range,
            None => numeric.recompute_test_range(),
        }
        def
    }
}

/// A weak reference to a node owned by the external graph builder.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalRef {
    pub node_name: String,
    pub node_kind: NodeKind,
    /// Output selected from a multi-output node
    pub index: Option<usize>,
}

impl ExternalRef {
    pub fn new(node_name: impl Into<String>, node_kind: NodeKind) -> Self {
        Self {
            node_name: node_name.into(),
            node_kind,
            index: None,
        }
    }
}

/// Value bound to a `{parameter}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Numeric(NumericDef),
    /// Exclusively owned, deep-copied on clone
    Nested(Box<Expression>),
    Funklet(FunkletDef),
    ExternalRef(ExternalRef),
}

impl ParamValue {
    pub fn as_numeric(&self) -> Option<&NumericDef> {
        match self {
            ParamValue::Numeric(def) => Some(def),
            _ => None,
        }
    }

    /// True when both values stem from the same definition.
    pub(crate) fn same_definition(&self, other: &ParamValue) -> bool {
        match (self, other) {
            (ParamValue::Numeric(a), ParamValue::Numeric(b)) => a.identity == b.identity,
            _ => self == other,
        }
    }
}

/// Input accepted by `Expression::set_parameter`.
#[derive(Debug, Clone)]
pub enum ParmInput {
    Value(f64),
    Expression(Expression),
    Funklet(FunkletDef),
    Node(ExternalRef),
}

impl From<f64> for ParmInput {
    fn from(value: f64) -> Self {
        ParmInput::Value(value)
    }
}

impl From<Expression> for ParmInput {
    fn from(expression: Expression) -> Self {
        ParmInput::Expression(expression)
    }
}

impl From<FunkletDef> for ParmInput {
    fn from(funklet: FunkletDef) -> Self {
        ParmInput::Funklet(funklet)
    }
}

impl From<ExternalRef> for ParmInput {
    fn from(node: ExternalRef) -> Self {
        ParmInput::Node(node)
    }
}

impl ParmInput {
    /// Rejects values that must never reach a definition record.
    pub(crate) fn validate(&self, key: &str) -> Result<(), ExpressionError> {
        let invalid = |reason: &str| ExpressionError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        match self {
            ParmInput::Value(v) if !v.is_finite() => Err(invalid("default must be finite")),
            ParmInput::Funklet(f) if f.coefficients.iter().any(|c| !c.is_finite()) => {
                Err(invalid("funklet coefficients must be finite"))
            }
            ParmInput::Node(node) if node.node_name.is_empty() => {
                Err(invalid("graph node reference has no name"))
            }
            _ => Ok(()),
        }
    }
}

/// Options for `Expression::set_parameter`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParmOptions {
    /// Propagate into nested expressions declaring the same key
    pub recurse: bool,
    pub scale: Option<f64>,
    pub stddev: Option<f64>,
    pub unit: Option<String>,
    pub test_value: Option<f64>,
    pub test_increment: Option<f64>,
    pub constant: Option<bool>,
}

impl Default for ParmOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            scale: None,
            stddev: None,
            unit: None,
            test_value: None,
            test_increment: None,
            constant: None,
        }
    }
}

impl ParmOptions {
    pub(crate) fn validate(&self, key: &str) -> Result<(), ExpressionError> {
        let check = |name: &str, value: Option<f64>| match value {
            Some(v) if !v.is_finite() || v < 0.0 => Err(ExpressionError::InvalidValue {
                key: key.to_string(),
                reason: format!("{name} must be finite and non-negative"),
            }),
            _ => Ok(()),
        };
        check("scale", self.scale)?;
        check("stddev", self.stddev)?;
        check("test increment", self.test_increment)
    }
}

/// Options for `Expression::set_variable`.
#[derive(Debug, Clone, PartialEq)]
pub struct VarOptions {
    pub recurse: bool,
    pub scale: Option<f64>,
    pub unit: Option<String>,
    pub test_range: Option<TestRange>,
}

impl Default for VarOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            scale: None,
            unit: None,
            test_range: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_definition() {
        let def = NumericDef::placeholder(vec![0, 1]);
        assert_eq!(def.default, -1.0);
        assert_eq!(def.nominal_default, -1.0);
        assert_eq!(def.scale, 1.0);
        assert_eq!(def.multi_index, vec![0, 1]);
        // increment 0.1, five steps each side
        assert!((def.test_range.min + 1.5).abs() < 1e-12);
        assert!((def.test_range.max + 0.5).abs() < 1e-12);
        assert_eq!(def.test_range.count, 11);
    }

    #[test]
    fn test_updated_definition() {
        let def = NumericDef::placeholder(vec![]);
        let updated = def.updated(20.0, &ParmOptions::default());
        assert_eq!(updated.default, 20.0);
        assert_eq!(updated.nominal_default, 20.0);
        assert_eq!(updated.scale, 20.0);
        assert_eq!(updated.identity, def.identity);
        assert_eq!(updated.test_range, TestRange::around(20.0, 2.0, TEST_STEPS));

        let opts = ParmOptions {
            scale: Some(1.0),
            test_increment: Some(0.5),
            constant: Some(true),
            ..Default::default()
        };
        let updated = def.updated(3.0, &opts);
        assert_eq!(updated.scale, 1.0);
        assert!(updated.constant);
        assert_eq!(updated.test_range.min, 0.5);
        assert_eq!(updated.test_range.max, 5.5);
    }

    #[test]
    fn test_zero_default_uses_unit_increment() {
        let def = NumericDef::new(0.0);
        assert!((def.test_range.min + 0.5).abs() < 1e-12);
        assert!((def.test_range.max - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_range_samples() {
        assert_eq!(TestRange::new(0.0, 1.0, 3).samples(), vec![0.0, 0.5, 1.0]);
        assert_eq!(TestRange::new(2.0, 5.0, 1).samples(), vec![2.0]);
        assert!(TestRange::new(0.0, 1.0, 0).samples().is_empty());
    }

    #[test]
    fn test_axis_kinds() {
        assert_eq!(AxisKind::from_key("t"), AxisKind::Time);
        assert_eq!(AxisKind::from_key("time"), AxisKind::Time);
        assert_eq!(AxisKind::from_key("freq"), AxisKind::Freq);
        assert_eq!(AxisKind::from_key("l"), AxisKind::L);
        assert_eq!(AxisKind::from_key("m"), AxisKind::M);
        assert_eq!(AxisKind::from_key("x"), AxisKind::Other);
        assert!(AxisKind::Time.rank() < AxisKind::Freq.rank());
        assert!(AxisKind::M.rank() < AxisKind::Other.rank());
    }

    #[test]
    fn test_axis_defaults() {
        let f = VarDef::for_key("f");
        assert_eq!(f.default(), 1e8);
        assert_eq!(f.numeric.unit.as_deref(), Some("Hz"));
        assert_eq!(f.axis.node_kind(), NodeKind::Freq);

        let t = VarDef::for_key("t");
        assert_eq!(t.numeric.test_range.samples().len(), 11);
        assert_eq!(t.numeric.unit.as_deref(), Some("s"));
    }

    #[test]
    fn test_validation() {
        assert!(ParmInput::Value(f64::NAN).validate("a").is_err());
        assert!(ParmInput::Value(1.0).validate("a").is_ok());
        let opts = ParmOptions {
            stddev: Some(-1.0),
            ..Default::default()
        };
        assert!(opts.validate("a").is_err());
    }
}
