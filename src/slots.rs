//! Slot assignment for closed-form evaluation.
//!
//! Parameters get slots `p0, p1, ...` in declaration order. Variables get `x0, x1, ...` in
//! canonical axis order (time, frequency, l, m, then the rest in declaration order). In the
//! value slice passed to `Expr::evaluate` all parameter slots come first.

use std::collections::HashMap;

use crate::convert::parse_closed_form;
use crate::errors::ExpressionError;
use crate::expr::Expr;
use crate::expression::Expression;
use crate::parse::{substitute_placeholders, PlaceholderKind};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SlotMap {
    pub params: Vec<String>,
    pub vars: Vec<String>,
}

impl SlotMap {
    pub fn for_expression(expr: &Expression) -> Self {
        let mut vars: Vec<(usize, &String)> = expr.variable_order.iter().enumerate().collect();
        vars.sort_by_key(|(position, key)| (expr.variables[*key].axis.rank(), *position));
        Self {
            params: expr.parameter_order.clone(),
            vars: vars.into_iter().map(|(_, key)| key.clone()).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.params.len() + self.vars.len()
    }

    pub fn param_slot(&self, key: &str) -> Option<usize> {
        self.params.iter().position(|k| k == key)
    }

    /// Position of a variable in the value slice.
    pub fn var_slot(&self, key: &str) -> Option<usize> {
        self.vars
            .iter()
            .position(|k| k == key)
            .map(|j| self.params.len() + j)
    }

    /// Rewrites placeholders as slot names.
    pub fn basis(&self, text: &str) -> Result<String, ExpressionError> {
        substitute_placeholders(text, |placeholder| match placeholder.kind {
            PlaceholderKind::Parameter => self
                .params
                .iter()
                .position(|k| *k == placeholder.key)
                .map(|i| format!("p{i}")),
            PlaceholderKind::Variable => self
                .vars
                .iter()
                .position(|k| *k == placeholder.key)
                .map(|j| format!("x{j}")),
        })
    }

    pub fn var_map(&self) -> HashMap<String, u32> {
        let params = (0..self.params.len()).map(|i| (format!("p{i}"), i as u32));
        let vars = (0..self.vars.len()).map(|j| (format!("x{j}"), (self.params.len() + j) as u32));
        params.chain(vars).collect()
    }

    /// Parses any substring of the expression's format string into an `Expr` over the slots.
    pub fn compile(&self, text: &str) -> Result<Expr, ExpressionError> {
        parse_closed_form(&self.basis(text)?, &self.var_map())
    }
}
