//! `{{ ... }}` placeholder expansion.
//!
//! Two modes:
//!
//! - **simple**: `{{name}}` is replaced by the named template, nothing else.
//! - **full**: the placeholder body is an expression. Bare names resolve to
//!   variables, then templates; `name(k='v')` renders template `name` with
//!   extra variables; anything else is evaluated as a rhai expression with
//!   the current variables in scope (`{{(i + 1) * 1000}}`).
//!
//! Placeholders that cannot be resolved are left in the text untouched so
//! the caller can report them when the entry is actually used.

use indexmap::IndexMap;
use regex::Regex;
use rhai::{Dynamic, Engine, Scope};

use crate::error::{RefError, RefResult};

/// Templates may reference each other; cycles stop expanding here.
const MAX_TEMPLATE_DEPTH: usize = 16;

/// Variables visible to full-mode expressions.
pub type TemplateVars = IndexMap<String, Dynamic>;

/// Named substitution strings. Caller overrides shadow document entries.
#[derive(Debug, Clone, Default)]
pub struct TemplateTable {
    entries: IndexMap<String, String>,
}

impl TemplateTable {
    /// Merge document templates with caller overrides (overrides win per name).
    pub fn new(document: IndexMap<String, String>, overrides: &IndexMap<String, String>) -> Self {
        let mut entries = document;
        for (name, value) in overrides {
            entries.insert(name.clone(), value.clone());
        }
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

/// Expands placeholders against a [`TemplateTable`].
pub struct TemplateRenderer {
    table: TemplateTable,
    simple: bool,
    placeholder: Regex,
    engine: Engine,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer")
            .field("table", &self.table)
            .field("simple", &self.simple)
            .finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    pub fn new(table: TemplateTable, simple: bool) -> RefResult<Self> {
        let placeholder = Regex::new(r"\{\{\s*(.*?)\s*\}\}")
            .map_err(|e| RefError::spec(format!("placeholder pattern: {e}")))?;
        Ok(Self {
            table,
            simple,
            placeholder,
            engine: Self::create_engine(),
        })
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();

        // Expressions are arithmetic over a handful of integers.
        engine.set_max_expr_depths(64, 64);
        engine.set_max_operations(100_000);
        engine.set_max_modules(10);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);
        engine
    }

    /// True when `text` still contains a placeholder.
    pub fn has_placeholder(&self, text: &str) -> bool {
        self.placeholder.is_match(text)
    }

    /// First placeholder left in `text`, verbatim.
    pub fn first_placeholder(&self, text: &str) -> Option<String> {
        self.placeholder.find(text).map(|m| m.as_str().to_string())
    }

    /// Render a reference value using the configured mode.
    pub fn render(&self, text: &str) -> String {
        if self.simple {
            self.render_simple(text, 0)
        } else {
            self.render_full(text, &TemplateVars::new(), 0)
        }
    }

    /// Render with iteration variables in scope. Always full mode.
    pub fn render_with(&self, text: &str, vars: &TemplateVars) -> String {
        self.render_full(text, vars, 0)
    }

    fn render_simple(&self, text: &str, depth: usize) -> String {
        if depth >= MAX_TEMPLATE_DEPTH || !self.has_placeholder(text) {
            return text.to_string();
        }
        self.placeholder
            .replace_all(text, |caps: &regex::Captures<'_>| {
                match self.table.get(&caps[1]) {
                    Some(body) => self.render_simple(body, depth + 1),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn render_full(&self, text: &str, vars: &TemplateVars, depth: usize) -> String {
        if depth >= MAX_TEMPLATE_DEPTH || !self.has_placeholder(text) {
            return text.to_string();
        }
        self.placeholder
            .replace_all(text, |caps: &regex::Captures<'_>| {
                self.evaluate(&caps[1], vars, depth)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn evaluate(&self, expr: &str, vars: &TemplateVars, depth: usize) -> Option<String> {
        if is_ident(expr) {
            if let Some(value) = vars.get(expr) {
                return Some(value.to_string());
            }
            let body = self.table.get(expr)?;
            return Some(self.render_full(body, vars, depth + 1));
        }

        if let Some((name, args)) = split_call(expr) {
            if let Some(body) = self.table.get(name) {
                let mut scoped = vars.clone();
                for (key, raw) in split_kwargs(args)? {
                    let value = self.eval_value(raw, vars)?;
                    scoped.insert(key.to_string(), value);
                }
                let rendered = self.render_full(body, &scoped, depth + 1);
                return (!self.has_placeholder(&rendered)).then_some(rendered);
            }
        }

        self.eval_value(expr, vars).map(|v| v.to_string())
    }

    fn eval_value(&self, expr: &str, vars: &TemplateVars) -> Option<Dynamic> {
        if let Some(text) = quoted(expr) {
            return Some(Dynamic::from(text.to_string()));
        }
        let mut scope = Scope::new();
        for (name, value) in self.table.iter() {
            if !vars.contains_key(name) {
                scope.push_dynamic(name.clone(), Dynamic::from(value.clone()));
            }
        }
        for (name, value) in vars {
            scope.push_dynamic(name.clone(), value.clone());
        }
        match self.engine.eval_expression_with_scope::<Dynamic>(&mut scope, expr) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(expr, error = %e, "template expression left unresolved");
                None
            }
        }
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `name(args)` → `(name, args)`.
fn split_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    let name = expr[..open].trim();
    let args = expr[open + 1..].strip_suffix(')')?;
    is_ident(name).then_some((name, args))
}

/// Split `a='x', b=2` on top-level commas. `None` on anything that is not
/// a keyword argument list.
fn split_kwargs(args: &str) -> Option<Vec<(&str, &str)>> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    let bytes_end = args.len();
    for (i, c) in args.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                out.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&args[start..bytes_end]);

    out.into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=')?;
            let key = key.trim();
            is_ident(key).then_some((key, value.trim()))
        })
        .collect()
}

fn quoted(expr: &str) -> Option<&str> {
    let expr = expr.trim();
    ['\'', '"'].into_iter().find_map(|q| {
        expr.strip_prefix(q)
            .and_then(|rest| rest.strip_suffix(q))
            .filter(|inner| !inner.contains(q))
    })
}
