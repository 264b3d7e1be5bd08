//! Bracket-aware string utilities for format strings.
//!
//! Every function in this module works on raw format strings such as
//! `{a}*sin([t]) - {b[0,1]}/2` and shares one notion of depth: `()`, `{}` and `[]` all nest,
//! must be balanced and must close in the right order. Term and factor boundaries are only
//! ever placed at depth zero, so they can never land inside a placeholder or a function call.
//!
//! - `find_enclosed`: contents of the outermost regions of one bracket pair
//! - `find_additive_terms`: top-level `+`/`-` split with sign attribution
//! - `find_multiplicative_factors`: top-level `*`/`/` split of a single term
//! - `find_unary_op`: `fn(arg)` spanning the whole text
//! - `find_binary_op`: the lowest-precedence top-level binary operator
//! - `placeholders` / `substitute_placeholders`: parameter and variable placeholder scanning

use std::ops::Range;

use crate::errors::ExpressionError;

/// Signed split of an expression into additive terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Terms {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
}

impl Terms {
    /// Total number of terms, regardless of sign.
    pub fn len(&self) -> usize {
        self.positive.len() + self.negative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split of a single term into multiplied and divided factors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Factors {
    pub multiplied: Vec<String>,
    pub divided: Vec<String>,
}

impl Factors {
    pub fn len(&self) -> usize {
        self.multiplied.len() + self.divided.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A function call `op(arg)` spanning an entire string.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryOp {
    pub op: String,
    pub arg: String,
}

/// A binary operator splitting an entire string in two.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOp {
    pub op: String,
    pub lhs: String,
    pub rhs: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderKind {
    /// `{key}` or `{key[i,j]}`
    Parameter,
    /// `[key]`
    Variable,
}

/// A placeholder found in a format string.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    /// Canonical key, with multi-indices folded in (`A[0,1]` becomes `A_01`)
    pub key: String,
    pub multi_index: Vec<usize>,
    /// Character span of the placeholder including its brackets
    pub span: Range<usize>,
}

fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '{' => '}',
        _ => ']',
    }
}

fn collect(chars: &[char], range: Range<usize>) -> String {
    chars[range].iter().collect()
}

/// Depth of every character; a bracket itself sits at the depth outside of it.
fn depths(chars: &[char]) -> Result<Vec<usize>, ExpressionError> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut out = Vec::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '(' | '{' | '[' => {
                out.push(stack.len());
                stack.push((c, i));
            }
            ')' | '}' | ']' => match stack.pop() {
                Some((open, _)) if closing(open) == c => out.push(stack.len()),
                Some((open, at)) => {
                    return Err(ExpressionError::malformed(
                        &collect(chars, at..i + 1),
                        format!("`{open}` closed by `{c}`"),
                    ))
                }
                None => {
                    return Err(ExpressionError::malformed(
                        &collect(chars, 0..i + 1),
                        format!("unbalanced `{c}`"),
                    ))
                }
            },
            _ => out.push(stack.len()),
        }
    }
    match stack.pop() {
        Some((open, at)) => Err(ExpressionError::malformed(
            &collect(chars, at..chars.len()),
            format!("unclosed `{open}`"),
        )),
        None => Ok(out),
    }
}

/// Index of the bracket closing the one opened at `open_at`. Input must already be balanced.
fn matching(chars: &[char], open_at: usize) -> usize {
    let mut depth = 0usize;
    for (j, &c) in chars.iter().enumerate().skip(open_at) {
        match c {
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return j;
                }
            }
            _ => {}
        }
    }
    chars.len() - 1
}

fn is_operand_end(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ')' | '}' | ']')
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// True when the sign at `at` belongs to a literal such as `1e-3`.
fn is_exponent_sign(chars: &[char], at: usize) -> bool {
    if at < 2 || !matches!(chars[at - 1], 'e' | 'E') {
        return false;
    }
    let mut j = at - 1;
    let mut digits = 0;
    while j > 0 && (chars[j - 1].is_ascii_digit() || chars[j - 1] == '.') {
        if chars[j - 1].is_ascii_digit() {
            digits += 1;
        }
        j -= 1;
    }
    digits > 0 && (j == 0 || !is_ident_char(chars[j - 1]))
}

/// Previous non-blank character before `at`.
fn previous(chars: &[char], at: usize) -> Option<char> {
    chars[..at].iter().rev().copied().find(|c| !c.is_whitespace())
}

/// Positions of top-level binary `+`/`-` operators.
fn additive_operators(chars: &[char], depth: &[usize]) -> Vec<usize> {
    (0..chars.len())
        .filter(|&i| depth[i] == 0 && matches!(chars[i], '+' | '-'))
        .filter(|&i| previous(chars, i).is_some_and(is_operand_end))
        .filter(|&i| !is_exponent_sign(chars, i))
        .collect()
}

/// Positions and widths of top-level `*`, `/` operators, skipping `**`.
fn multiplicative_operators(chars: &[char], depth: &[usize]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if depth[i] == 0 {
            if chars[i] == '*' && chars.get(i + 1) == Some(&'*') {
                i += 2;
                continue;
            }
            if matches!(chars[i], '*' | '/') {
                out.push(i);
            }
        }
        i += 1;
    }
    out
}

/// Returns the contents of each outermost `open`…`close` region, in order.
///
/// A placeholder of the other kind hides its contents, so the `[0,1]` in `{A[0,1]}` is not
/// reported when looking for `[`…`]`. Parentheses hide nothing.
pub fn find_enclosed(text: &str, open: char, close: char) -> Result<Vec<String>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    depths(&chars)?;
    let hides = |c: char| matches!(c, '{' | '[') && c != open;
    let unhides = |c: char| matches!(c, '}' | ']') && c != close;

    let mut found = Vec::new();
    let mut hidden = 0usize;
    let mut level = 0usize;
    let mut start = 0usize;
    for (i, &c) in chars.iter().enumerate() {
        if level == 0 && hides(c) {
            hidden += 1;
        } else if level == 0 && unhides(c) {
            hidden = hidden.saturating_sub(1);
        } else if hidden == 0 && c == open {
            if level == 0 {
                start = i + 1;
            }
            level += 1;
        } else if hidden == 0 && c == close && level > 0 {
            level -= 1;
            if level == 0 {
                found.push(collect(&chars, start..i));
            }
        }
    }
    Ok(found)
}

/// Splits `text` on top-level `+` and `-`.
///
/// A leading unary sign applies to the first term. Signs directly after another operator
/// (`a*-b`) or inside a numeric exponent (`1e-3`) do not split.
pub fn find_additive_terms(text: &str) -> Result<Terms, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let depth = depths(&chars)?;
    let mut terms = Terms::default();

    let mut cuts = vec![];
    let lead = chars.iter().position(|c| !c.is_whitespace());
    let (mut negative, mut start) = match lead.map(|i| (i, chars[i])) {
        Some((i, '-')) => (true, i + 1),
        Some((i, '+')) => (false, i + 1),
        _ => (false, 0),
    };
    for op in additive_operators(&chars, &depth) {
        cuts.push((start, op, negative));
        negative = chars[op] == '-';
        start = op + 1;
    }
    cuts.push((start, chars.len(), negative));

    for (from, to, negative) in cuts {
        let term = collect(&chars, from..to).trim().to_string();
        if term.is_empty() {
            return Err(ExpressionError::malformed(text, "empty term"));
        }
        if negative {
            terms.negative.push(term);
        } else {
            terms.positive.push(term);
        }
    }
    Ok(terms)
}

/// Splits a single term on top-level `*` and `/`; `**` is left alone.
pub fn find_multiplicative_factors(text: &str) -> Result<Factors, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let depth = depths(&chars)?;
    let mut factors = Factors::default();

    let mut start = 0;
    let mut divided = false;
    let mut push = |from: usize, to: usize, divided: bool| -> Result<(), ExpressionError> {
        let factor = collect(&chars, from..to).trim().to_string();
        if factor.is_empty() {
            return Err(ExpressionError::malformed(text, "empty factor"));
        }
        if divided {
            factors.divided.push(factor);
        } else {
            factors.multiplied.push(factor);
        }
        Ok(())
    };
    for op in multiplicative_operators(&chars, &depth) {
        push(start, op, divided)?;
        divided = chars[op] == '/';
        start = op + 1;
    }
    push(start, chars.len(), divided)?;
    Ok(factors)
}

/// Recognizes `fn(arg)` wrapping the entire text.
pub fn find_unary_op(text: &str) -> Result<Option<UnaryOp>, ExpressionError> {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    depths(&chars)?;

    let name_len = chars
        .iter()
        .take_while(|&&c| is_ident_char(c) || c == ':')
        .count();
    if name_len == 0
        || chars[0].is_ascii_digit()
        || chars.get(name_len) != Some(&'(')
        || matching(&chars, name_len) != chars.len() - 1
    {
        return Ok(None);
    }
    Ok(Some(UnaryOp {
        op: collect(&chars, 0..name_len),
        arg: collect(&chars, name_len + 1..chars.len() - 1).trim().to_string(),
    }))
}

/// Recognizes the lowest-precedence top-level binary operator splitting the text in two.
///
/// Precedence, lowest first: rightmost `+`/`-`, rightmost `*`/`/`, leftmost `^`/`**`.
pub fn find_binary_op(text: &str) -> Result<Option<BinaryOp>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let depth = depths(&chars)?;

    let split = |at: usize, width: usize| {
        let lhs = collect(&chars, 0..at).trim().to_string();
        let rhs = collect(&chars, at + width..chars.len()).trim().to_string();
        (!lhs.is_empty() && !rhs.is_empty()).then(|| BinaryOp {
            op: collect(&chars, at..at + width),
            lhs,
            rhs,
        })
    };

    if let Some(&at) = additive_operators(&chars, &depth).last() {
        return Ok(split(at, 1));
    }
    if let Some(&at) = multiplicative_operators(&chars, &depth).last() {
        return Ok(split(at, 1));
    }
    let power = (0..chars.len()).find(|&i| {
        depth[i] == 0 && (chars[i] == '^' || (chars[i] == '*' && chars.get(i + 1) == Some(&'*')))
    });
    Ok(power.and_then(|at| split(at, if chars[at] == '^' { 1 } else { 2 })))
}

/// Removes parentheses that wrap the entire text, repeatedly.
pub fn strip_enclosing_parens(text: &str) -> Result<String, ExpressionError> {
    let mut current = text.trim().to_string();
    loop {
        let chars: Vec<char> = current.chars().collect();
        depths(&chars)?;
        if chars.first() == Some(&'(') && matching(&chars, 0) == chars.len() - 1 {
            current = collect(&chars, 1..chars.len() - 1).trim().to_string();
        } else {
            return Ok(current);
        }
    }
}

/// Splits a function argument list on its top-level commas.
pub fn split_arguments(text: &str) -> Result<Vec<String>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let depth = depths(&chars)?;
    let mut args = Vec::new();
    let mut start = 0;
    for (i, &c) in chars.iter().enumerate() {
        if c == ',' && depth[i] == 0 {
            args.push(collect(&chars, start..i).trim().to_string());
            start = i + 1;
        }
    }
    args.push(collect(&chars, start..chars.len()).trim().to_string());
    if args.iter().any(String::is_empty) {
        return Err(ExpressionError::malformed(text, "empty argument"));
    }
    Ok(args)
}

fn validate_identifier(ident: &str, fragment: &str) -> Result<(), ExpressionError> {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(ExpressionError::malformed(fragment, "invalid identifier")),
    }
    if chars.all(is_ident_char) {
        Ok(())
    } else {
        Err(ExpressionError::malformed(fragment, "invalid identifier"))
    }
}

/// Canonicalizes a parameter key, folding a multi-index into the name.
///
/// `A[0,1]` becomes `("A_01", [0, 1])`; plain identifiers are returned unchanged.
pub fn canonical_parameter_key(raw: &str) -> Result<(String, Vec<usize>), ExpressionError> {
    let raw = raw.trim();
    let Some(open) = raw.find('[') else {
        validate_identifier(raw, raw)?;
        return Ok((raw.to_string(), vec![]));
    };
    let name = raw[..open].trim();
    validate_identifier(name, raw)?;
    let inner = raw[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| ExpressionError::malformed(raw, "non-terminating index"))?;
    let indices = inner
        .split(',')
        .map(|i| i.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ExpressionError::malformed(raw, "invalid multi-index"))?;
    let suffix: String = indices.iter().map(|i| i.to_string()).collect();
    Ok((format!("{name}_{suffix}"), indices))
}

/// Scans a format string for `{parameter}` and `[variable]` placeholders, in order.
pub fn placeholders(text: &str) -> Result<Vec<Placeholder>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    depths(&chars)?;

    let mut found = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let kind = match chars[i] {
            '{' => PlaceholderKind::Parameter,
            '[' => PlaceholderKind::Variable,
            _ => {
                i += 1;
                continue;
            }
        };
        let end = matching(&chars, i);
        let content = collect(&chars, i + 1..end);
        let (key, multi_index) = match kind {
            PlaceholderKind::Parameter => canonical_parameter_key(&content)?,
            PlaceholderKind::Variable => {
                let key = content.trim().to_string();
                validate_identifier(&key, &collect(&chars, i..end + 1))?;
                (key, vec![])
            }
        };
        found.push(Placeholder {
            kind,
            key,
            multi_index,
            span: i..end + 1,
        });
        i = end + 1;
    }
    Ok(found)
}

/// Rebuilds `text`, replacing each placeholder for which `replace` returns `Some`.
pub fn substitute_placeholders<F>(text: &str, mut replace: F) -> Result<String, ExpressionError>
where
    F: FnMut(&Placeholder) -> Option<String>,
{
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for placeholder in placeholders(text)? {
        out.extend(&chars[cursor..placeholder.span.start]);
        match replace(&placeholder) {
            Some(replacement) => out.push_str(&replacement),
            None => out.extend(&chars[placeholder.span.clone()]),
        }
        cursor = placeholder.span.end;
    }
    out.extend(&chars[cursor..]);
    Ok(out)
}

/// Rewrites bare identifiers in a closed-form string, leaving numeric literals alone.
pub fn replace_identifiers<F>(text: &str, mut replace: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                let mut j = i + 1;
                if j < chars.len() && matches!(chars[j], '+' | '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            out.extend(&chars[start..i]);
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident = collect(&chars, start..i);
            match replace(&ident) {
                Some(replacement) => out.push_str(&replacement),
                None => out.push_str(&ident),
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Identifiers outside placeholders that are not called as functions.
///
/// `sin(x)` yields nothing for `sin`; `{a} + p0` yields `p0`. Placeholder keys are never
/// reported.
pub fn bare_identifiers(text: &str) -> Result<Vec<String>, ExpressionError> {
    let masked = substitute_placeholders(text, |_| Some("0".to_string()))?;
    let mut found = Vec::new();
    let marked = replace_identifiers(&masked, |ident| {
        found.push(ident.to_string());
        Some("\0".to_string())
    });
    let chars: Vec<char> = marked.chars().collect();
    let mut idents = found.into_iter();
    let mut bare = Vec::new();
    for (i, &c) in chars.iter().enumerate() {
        if c != '\0' {
            continue;
        }
        let Some(ident) = idents.next() else { break };
        let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
        if !matches!(next, Some('(') | Some(':')) {
            bare.push(ident);
        }
    }
    Ok(bare)
}
