//! Decomposition of expressions into computation-graph nodes.
//!
//! The expanded format string is split recursively: sums into `Add`/`Subtract`/`Negate`,
//! products into `Multiply`/`Divide`, function calls into function nodes and powers into
//! `Pow`. Placeholders become leaves. Nodes are created through a `GraphBuilder`, which
//! deduplicates them by name, so decomposing the same expression twice yields the same node.
//!
//! Node names are derived from content: variables are named by their key, parameters by
//! `label:key`, global parameters by their bare key, constants by `const(value)` and compound
//! nodes by `kind(child,child,...)`. Scope qualifiers are appended to parameter names as
//! `:k=v,...`.

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;
use log::trace;

use crate::definition::ParamValue;
use crate::errors::ExpressionError;
use crate::expand::is_global_key;
use crate::expression::Expression;
use crate::parse::{
    find_additive_terms, find_binary_op, find_multiplicative_factors, find_unary_op,
    placeholders, split_arguments, strip_enclosing_parens, PlaceholderKind,
};

/// Nesting depth at which decomposition gives up.
pub const MAX_DEPTH: usize = 256;

/// Kind of a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Constant,
    Parm,
    Time,
    Freq,
    L,
    M,
    /// Any other variable axis
    Grid,
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Pow,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log10,
    Sqrt,
    Abs,
    /// Selects one output of a multi-output node
    Selector(usize),
    /// A node type known only to the external builder
    External(String),
}

impl NodeKind {
    /// Node kind of a function call, if the function is supported.
    pub fn from_function(name: &str) -> Option<NodeKind> {
        let kind = match name.strip_prefix("math::").unwrap_or(name) {
            "sin" => NodeKind::Sin,
            "cos" => NodeKind::Cos,
            "tan" => NodeKind::Tan,
            "asin" => NodeKind::Asin,
            "acos" => NodeKind::Acos,
            "atan" => NodeKind::Atan,
            "atan2" => NodeKind::Atan2,
            "sinh" => NodeKind::Sinh,
            "cosh" => NodeKind::Cosh,
            "tanh" => NodeKind::Tanh,
            "exp" => NodeKind::Exp,
            "ln" | "log" => NodeKind::Log,
            "log10" => NodeKind::Log10,
            "sqrt" => NodeKind::Sqrt,
            "abs" => NodeKind::Abs,
            "pow" => NodeKind::Pow,
            _ => return None,
        };
        Some(kind)
    }

    fn arity(&self) -> usize {
        match self {
            NodeKind::Atan2 | NodeKind::Pow => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Selector(index) => write!(f, "select{index}"),
            NodeKind::External(name) => write!(f, "{name}"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Handle of a node owned by a `GraphBuilder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub usize);

/// Sink for graph nodes.
///
/// `leaf` and `node` are idempotent by name: asking again for an existing name with the same
/// kind and children returns the existing handle. `resolve` only looks a node up; it is how
/// references to nodes owned by someone else are followed.
pub trait GraphBuilder {
    fn leaf(&mut self, name: &str, kind: NodeKind, default: f64) -> NodeHandle;
    fn node(&mut self, name: &str, kind: NodeKind, children: Vec<NodeHandle>) -> NodeHandle;
    fn resolve(&self, name: &str) -> Option<NodeHandle>;

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
    pub children: Vec<NodeHandle>,
    /// Set for leaves
    pub default: Option<f64>,
}

/// A `GraphBuilder` keeping its nodes in memory.
///
/// A name reused for a different node is disambiguated as `name(1)`, `name(2)`, ...
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraph {
    nodes: Vec<GraphNode>,
    by_name: HashMap<String, NodeHandle>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<NodeHandle> {
        self.by_name.get(name).copied()
    }

    pub fn node_at(&self, handle: NodeHandle) -> Option<&GraphNode> {
        self.nodes.get(handle.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    fn intern(&mut self, node: GraphNode) -> NodeHandle {
        let base = node.name.clone();
        let mut name = base.clone();
        let mut attempt = 0;
        loop {
            match self.by_name.get(&name) {
                Some(&handle) => {
                    let existing = &self.nodes[handle.0];
                    if existing.kind == node.kind
                        && existing.children == node.children
                        && existing.default == node.default
                    {
                        return handle;
                    }
                    attempt += 1;
                    name = format!("{base}({attempt})");
                }
                None => {
                    let handle = NodeHandle(self.nodes.len());
                    trace!("graph: new node {} ({})", name, node.kind);
                    self.nodes.push(GraphNode { name: name.clone(), ..node });
                    self.by_name.insert(name, handle);
                    return handle;
                }
            }
        }
    }
}

impl GraphBuilder for InMemoryGraph {
    fn leaf(&mut self, name: &str, kind: NodeKind, default: f64) -> NodeHandle {
        self.intern(GraphNode {
            name: name.to_string(),
            kind,
            children: vec![],
            default: Some(default),
        })
    }

    fn node(&mut self, name: &str, kind: NodeKind, children: Vec<NodeHandle>) -> NodeHandle {
        self.intern(GraphNode {
            name: name.to_string(),
            kind,
            children,
            default: None,
        })
    }

    fn resolve(&self, name: &str) -> Option<NodeHandle> {
        self.get(name)
    }
}

type Built = (NodeHandle, String);

struct Decomposer<'a, B: GraphBuilder + ?Sized> {
    expr: &'a Expression,
    builder: &'a mut B,
    suffix: String,
    leaves: HashMap<(PlaceholderKind, String), Built>,
}

impl<'a, B: GraphBuilder + ?Sized> Decomposer<'a, B> {
    fn new(expr: &'a Expression, builder: &'a mut B) -> Self {
        let suffix = if expr.scope_qualifiers.is_empty() {
            String::new()
        } else {
            format!(
                ":{}",
                expr.scope_qualifiers
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .join(",")
            )
        };
        Self {
            expr,
            builder,
            suffix,
            leaves: HashMap::new(),
        }
    }

    fn parameter_leaf(&mut self, key: &str) -> Result<Built, ExpressionError> {
        match &self.expr.parameters[key] {
            ParamValue::Numeric(def) => {
                let name = if is_global_key(key) {
                    format!("{key}{}", self.suffix)
                } else {
                    format!("{}:{key}{}", self.expr.label, self.suffix)
                };
                let kind = if def.constant {
                    NodeKind::Constant
                } else {
                    NodeKind::Parm
                };
                Ok((self.builder.leaf(&name, kind, def.default), name))
            }
            ParamValue::ExternalRef(node) => {
                let base = self.builder.resolve(&node.node_name).ok_or_else(|| {
                    ExpressionError::UngraphableExpression {
                        fragment: format!("{{{key}}} -> {}", node.node_name),
                        depth: 0,
                    }
                })?;
                Ok(match node.index {
                    Some(index) => {
                        let name = format!("{}[{index}]", node.node_name);
                        let handle = self.builder.node(&name, NodeKind::Selector(index), vec![base]);
                        (handle, name)
                    }
                    None => (base, node.node_name.clone()),
                })
            }
            _ => Err(ExpressionError::UngraphableExpression {
                fragment: format!("{{{key}}}"),
                depth: 0,
            }),
        }
    }

    fn leaf(&mut self, kind: PlaceholderKind, key: &str) -> Result<Built, ExpressionError> {
        if let Some(built) = self.leaves.get(&(kind, key.to_string())) {
            return Ok(built.clone());
        }
        let built = match kind {
            PlaceholderKind::Parameter => self.parameter_leaf(key)?,
            PlaceholderKind::Variable => {
                let def = &self.expr.variables[key];
                let handle = self.builder.leaf(key, def.axis.node_kind(), def.default());
                (handle, key.to_string())
            }
        };
        self.leaves.insert((kind, key.to_string()), built.clone());
        Ok(built)
    }

    fn constant(&mut self, value: f64) -> Built {
        let name = format!("const({value})");
        (self.builder.leaf(&name, NodeKind::Constant, value), name)
    }

    fn compose(&mut self, kind: NodeKind, children: Vec<Built>) -> Built {
        let name = format!("{kind}({})", children.iter().map(|(_, n)| n).join(","));
        let handles = children.into_iter().map(|(h, _)| h).collect();
        (self.builder.node(&name, kind, handles), name)
    }

    /// Folds several nodes into one `kind` node; a single node is returned as is.
    fn combine(&mut self, kind: NodeKind, mut children: Vec<Built>) -> Option<Built> {
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(self.compose(kind, children)),
        }
    }

    fn decompose_all(&mut self, texts: &[String], depth: usize) -> Result<Vec<Built>, ExpressionError> {
        texts.iter().map(|t| self.decompose(t, depth + 1)).collect()
    }

    fn decompose(&mut self, text: &str, depth: usize) -> Result<Built, ExpressionError> {
        let ungraphable = |fragment: &str| ExpressionError::UngraphableExpression {
            fragment: fragment.to_string(),
            depth,
        };
        if depth > MAX_DEPTH {
            return Err(ungraphable(text));
        }
        let s = strip_enclosing_parens(text)?;
        if s.is_empty() {
            return Err(ungraphable(text));
        }

        if let [placeholder] = placeholders(&s)?.as_slice() {
            if placeholder.span == (0..s.chars().count()) {
                return self.leaf(placeholder.kind, &placeholder.key);
            }
        }
        if let Ok(value) = s.parse::<f64>() {
            return Ok(self.constant(value));
        }
        match s.as_str() {
            "pi" => return Ok(self.constant(std::f64::consts::PI)),
            "e" => return Ok(self.constant(std::f64::consts::E)),
            _ => {}
        }

        let terms = find_additive_terms(&s)?;
        if terms.positive.len() != 1 || !terms.negative.is_empty() {
            let positive = self.decompose_all(&terms.positive, depth)?;
            let negative = self.decompose_all(&terms.negative, depth)?;
            let positive = self.combine(NodeKind::Add, positive);
            let negative = self.combine(NodeKind::Add, negative);
            return match (positive, negative) {
                (Some(p), Some(n)) => Ok(self.compose(NodeKind::Subtract, vec![p, n])),
                (Some(p), None) => Ok(p),
                (None, Some(n)) => Ok(self.compose(NodeKind::Negate, vec![n])),
                (None, None) => Err(ungraphable(&s)),
            };
        }

        let factors = find_multiplicative_factors(&s)?;
        if factors.len() > 1 {
            let multiplied = self.decompose_all(&factors.multiplied, depth)?;
            let divided = self.decompose_all(&factors.divided, depth)?;
            let numerator = self
                .combine(NodeKind::Multiply, multiplied)
                .ok_or_else(|| ungraphable(&s))?;
            return Ok(match self.combine(NodeKind::Multiply, divided) {
                Some(denominator) => self.compose(NodeKind::Divide, vec![numerator, denominator]),
                None => numerator,
            });
        }

        if let Some(unary) = find_unary_op(&s)? {
            let kind = NodeKind::from_function(&unary.op).ok_or_else(|| ungraphable(&s))?;
            let args = split_arguments(&unary.arg)?;
            if args.len() != kind.arity() {
                return Err(ungraphable(&s));
            }
            let children = self.decompose_all(&args, depth)?;
            return Ok(self.compose(kind, children));
        }

        if let Some(binary) = find_binary_op(&s)? {
            if binary.op == "^" || binary.op == "**" {
                let lhs = self.decompose(&binary.lhs, depth + 1)?;
                let rhs = self.decompose(&binary.rhs, depth + 1)?;
                return Ok(self.compose(NodeKind::Pow, vec![lhs, rhs]));
            }
        }

        Err(ungraphable(&s))
    }
}

impl Expression {
    /// Emits the expanded expression into `builder` and returns the root node.
    ///
    /// # Errors
    /// * `UngraphableExpression` - A sub-expression matches none of the decomposition rules
    pub fn to_graph_node<B: GraphBuilder + ?Sized>(
        &self,
        builder: &mut B,
    ) -> Result<NodeHandle, ExpressionError> {
        let flat = self.expand()?;
        let mut decomposer = Decomposer::new(flat, builder);
        let (handle, name) = match flat.numeric_value {
            Some(value) => decomposer.constant(value),
            None => decomposer.decompose(&flat.format_string, 0)?,
        };
        trace!("{}: graph root {}", flat.label, name);
        Ok(handle)
    }
}
