//! Expansion of nested expressions into a single flat expression.
//!
//! Expansion splices the (recursively expanded) format string of every nested expression, in
//! parentheses, in place of the parameter it is bound to. Funklet bindings are first turned
//! back into expressions over their coefficients. Parameters of a nested expression bound to
//! key `k` are renamed `k_<param>`; keys starting with `_` are global and are never renamed, so
//! all occurrences of a global key collapse onto one parameter.
//!
//! The result is cached on the expression until the next mutation. An expression without
//! nested or funklet bindings is its own expansion. Every merged parameter remembers the
//! declarations it stands for, so values computed on the flat form can be stored back.

use std::collections::HashMap;

use log::debug;

use crate::definition::{ParamValue, VarDef};
use crate::errors::ExpressionError;
use crate::expression::Expression;
use crate::parse::{substitute_placeholders, PlaceholderKind};

/// Cached expansion state of an expression.
#[derive(Clone)]
pub(crate) enum Expanded {
    /// The expression contains nothing to expand
    SelfFlat,
    Flat(Box<Expression>),
}

/// Where a parameter of a flat expression is declared in the unexpanded tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Origin {
    /// Binding keys leading from the root to the declaring expression or funklet
    pub path: Vec<String>,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Parameter(String),
    /// Coefficient of the funklet at the end of the path
    Coefficient(usize),
}

impl Origin {
    fn local(key: &str) -> Self {
        Self {
            path: vec![],
            target: Target::Parameter(key.to_string()),
        }
    }

    fn under(mut self, binding: &str) -> Self {
        self.path.insert(0, binding.to_string());
        self
    }
}

/// A key starting with `_` is shared across all nesting levels.
pub fn is_global_key(key: &str) -> bool {
    key.starts_with('_')
}

/// Definitions collected while flattening.
struct Merge {
    parameters: HashMap<String, ParamValue>,
    variables: HashMap<String, VarDef>,
    origins: HashMap<String, Vec<Origin>>,
}

impl Merge {
    /// Starts from the parent's own leaf bindings; they keep their names.
    fn new(parent: &Expression) -> Self {
        let parameters: HashMap<String, ParamValue> = parent
            .parameters
            .iter()
            .filter(|(_, binding)| {
                matches!(binding, ParamValue::Numeric(_) | ParamValue::ExternalRef(_))
            })
            .map(|(k, binding)| (k.clone(), binding.clone()))
            .collect();
        let origins = parameters
            .keys()
            .map(|k| (k.clone(), vec![Origin::local(k)]))
            .collect();
        Self {
            parameters,
            variables: parent.variables.clone(),
            origins,
        }
    }

    /// Name under which a parameter of a spliced expression is merged.
    ///
    /// A name already holding a different definition gets a `_2`, `_3`, ... suffix.
    fn claim(&mut self, base: String, binding: &ParamValue, origins: Vec<Origin>) -> String {
        let name = if is_global_key(&base) {
            self.parameters.entry(base.clone()).or_insert_with(|| binding.clone());
            base
        } else {
            let mut name = base.clone();
            let mut suffix = 1;
            loop {
                match self.parameters.get(&name) {
                    None => {
                        self.parameters.insert(name.clone(), binding.clone());
                        break name;
                    }
                    Some(existing) if existing.same_definition(binding) => break name,
                    Some(_) => {
                        suffix += 1;
                        name = format!("{base}_{suffix}");
                        debug!("expansion: {} is taken, trying {}", base, name);
                    }
                }
            }
        };
        self.origins.entry(name.clone()).or_default().extend(origins);
        name
    }

    /// Merges a flat expression and returns its parenthesized text in merged names.
    ///
    /// `origins` maps a key of `flat` to the declarations it stands for.
    fn splice(
        &mut self,
        prefix: Option<&str>,
        flat: &Expression,
        origins: impl Fn(&str) -> Vec<Origin>,
    ) -> Result<String, ExpressionError> {
        if flat.numeric_value.is_some() {
            return Ok(format!("({})", flat.format_string));
        }
        let mut renamed = HashMap::new();
        for key in &flat.parameter_order {
            let base = match prefix {
                Some(prefix) if !is_global_key(key) => format!("{prefix}_{key}"),
                _ => key.clone(),
            };
            let name = self.claim(base, &flat.parameters[key], origins(key));
            renamed.insert(key.clone(), name);
        }
        for key in &flat.variable_order {
            self.variables
                .entry(key.clone())
                .or_insert_with(|| flat.variables[key].clone());
        }
        let text = substitute_placeholders(&flat.format_string, |placeholder| {
            match placeholder.kind {
                PlaceholderKind::Parameter => {
                    renamed.get(&placeholder.key).map(|name| format!("{{{name}}}"))
                }
                PlaceholderKind::Variable => None,
            }
        })?;
        Ok(format!("({text})"))
    }
}

impl Expression {
    /// Returns the flat form of this expression.
    ///
    /// The flat form has only numeric and graph-node parameters. It is computed once and
    /// cached until the expression is mutated; expanding a flat expression returns itself.
    pub fn expand(&self) -> Result<&Expression, ExpressionError> {
        if let Some(cached) = self.expanded.get() {
            return Ok(self.resolve(cached));
        }
        let expanded = self.build_expanded()?;
        Ok(self.resolve(self.expanded.get_or_init(|| expanded)))
    }

    fn resolve<'a>(&'a self, expanded: &'a Expanded) -> &'a Expression {
        match expanded {
            Expanded::SelfFlat => self,
            Expanded::Flat(flat) => flat,
        }
    }

    /// Declarations behind a parameter of this (flat) expression.
    pub(crate) fn origins_of(&self, key: &str) -> Vec<Origin> {
        match self.origins.get(key) {
            Some(origins) => origins.clone(),
            None => vec![Origin::local(key)],
        }
    }

    /// True when no parameter is bound to a nested expression or a funklet.
    pub fn is_flat(&self) -> bool {
        self.parameters
            .values()
            .all(|binding| matches!(binding, ParamValue::Numeric(_) | ParamValue::ExternalRef(_)))
    }

    fn build_expanded(&self) -> Result<Expanded, ExpressionError> {
        if self.is_flat() {
            return Ok(Expanded::SelfFlat);
        }

        let mut merge = Merge::new(self);
        let mut replacements = HashMap::new();
        for key in &self.parameter_order {
            let text = match &self.parameters[key] {
                ParamValue::Nested(child) => {
                    let child = child.expand()?;
                    merge.splice(Some(key.as_str()), child, |k| {
                        child
                            .origins_of(k)
                            .into_iter()
                            .map(|origin| origin.under(key))
                            .collect()
                    })?
                }
                ParamValue::Funklet(funklet) => {
                    let coefficient = |k: &str| {
                        k.strip_prefix(key.as_str())
                            .and_then(|rest| rest.strip_prefix('_'))
                            .and_then(|index| index.parse::<usize>().ok())
                    };
                    merge.splice(None, &funklet.to_expression(key)?, |k| {
                        coefficient(k)
                            .map(|i| Origin {
                                path: vec![key.clone()],
                                target: Target::Coefficient(i),
                            })
                            .into_iter()
                            .collect()
                    })?
                }
                _ => continue,
            };
            replacements.insert(key.clone(), text);
        }

        let body = substitute_placeholders(&self.format_string, |placeholder| {
            match placeholder.kind {
                PlaceholderKind::Parameter => replacements.get(&placeholder.key).cloned(),
                PlaceholderKind::Variable => None,
            }
        })?;
        debug!("{}: expanded {} into {}", self.label, self.format_string, body);

        let mut flat = Expression::build(self.label.clone(), body)?;
        for key in &flat.parameter_order {
            if let Some(binding) = merge.parameters.remove(key) {
                flat.parameters.insert(key.clone(), binding);
            }
            if let Some(origins) = merge.origins.remove(key) {
                flat.origins.insert(key.clone(), origins);
            }
        }
        for key in &flat.variable_order {
            if let Some(def) = merge.variables.remove(key) {
                flat.variables.insert(key.clone(), def);
            }
        }
        flat.description = self.description.clone();
        flat.result_unit = self.result_unit.clone();
        flat.scope_qualifiers = self.scope_qualifiers.clone();
        Ok(Expanded::Flat(Box::new(flat)))
    }
}
