//! Reference document loading and expansion.
//!
//! Two document forms are accepted:
//!
//! - **legacy**: the top-level object is the reference table itself.
//! - **versioned** (`"version": 1`): `{version, templates, gen, refs}`.
//!
//! [`ReferenceDocument::expand`] turns either form into a flat
//! [`ReferenceMapping`]. Everything that can be checked is checked here so
//! reads never see a half-formed entry.

use indexmap::IndexMap;
use rhai::Dynamic;
use serde::Deserialize;
use serde_json::Value;

use crate::entry::ReferenceEntry;
use crate::error::{RefError, RefResult};
use crate::mapping::ReferenceMapping;
use crate::template::{TemplateRenderer, TemplateTable, TemplateVars};

/// Options that shape expansion.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Per-name template replacements; win over the document's templates.
    pub template_overrides: IndexMap<String, String>,
    /// Plain `{{name}}` substitution only (no expressions) for `refs`.
    pub simple_templates: bool,
    /// Locator used by `[null, offset, length]` entries.
    pub default_target: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            template_overrides: IndexMap::new(),
            simple_templates: true,
            default_target: None,
        }
    }
}

/// One iteration axis of a generation rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    /// `{start, stop, step}`: half-open, counting down when `step` is negative.
    Range {
        #[serde(default)]
        start: i64,
        stop: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
    /// An explicit list of values.
    Values(Vec<Value>),
}

fn default_step() -> i64 {
    1
}

impl Dimension {
    fn values(&self) -> Vec<Dynamic> {
        match *self {
            Dimension::Range { start, stop, step } => {
                let mut out = Vec::new();
                let mut next = Some(start);
                while let Some(i) = next {
                    if (step > 0 && i >= stop) || (step < 0 && i <= stop) {
                        break;
                    }
                    out.push(Dynamic::from(i));
                    next = i.checked_add(step);
                }
                out
            }
            Dimension::Values(ref items) => items
                .iter()
                .map(|v| match v {
                    Value::Number(n) if n.is_i64() => Dynamic::from(n.as_i64().unwrap_or_default()),
                    Value::String(s) => Dynamic::from(s.clone()),
                    other => Dynamic::from(other.to_string()),
                })
                .collect(),
        }
    }
}

/// A string-or-integer field (`"length": "1000"` and `"length": 1000` agree).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum Expr {
    Text(String),
    Number(i64),
}

impl Expr {
    fn into_text(self) -> String {
        match self {
            Expr::Text(s) => s,
            Expr::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRule {
    key: String,
    url: String,
    #[serde(default)]
    offset: Option<Expr>,
    #[serde(default)]
    length: Option<Expr>,
    #[serde(default)]
    dimensions: IndexMap<String, Dimension>,
}

/// Produces many references by iterating over the cartesian product of
/// its dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRule {
    pub key: String,
    pub url: String,
    /// Offset and length expressions; both or neither.
    pub range: Option<(String, String)>,
    pub dimensions: IndexMap<String, Dimension>,
}

impl GenerationRule {
    /// Parse and validate one `gen` item.
    pub fn from_json(index: usize, value: Value) -> RefResult<Self> {
        let raw: RawRule = serde_json::from_value(value)
            .map_err(|e| RefError::spec(format!("gen[{index}]: {e}")))?;

        let range = match (raw.offset, raw.length) {
            (Some(offset), Some(length)) => Some((offset.into_text(), length.into_text())),
            (None, None) => None,
            (Some(_), None) => {
                return Err(RefError::spec(format!(
                    "gen[{index}] ({}) has offset but no length",
                    raw.key
                )));
            }
            (None, Some(_)) => {
                return Err(RefError::spec(format!(
                    "gen[{index}] ({}) has length but no offset",
                    raw.key
                )));
            }
        };

        for (name, dim) in &raw.dimensions {
            if let Dimension::Range { step: 0, .. } = dim {
                return Err(RefError::spec(format!(
                    "gen[{index}] dimension {name:?} has step 0"
                )));
            }
        }

        Ok(Self {
            key: raw.key,
            url: raw.url,
            range,
            dimensions: raw.dimensions,
        })
    }

    /// Every variable binding, first dimension slowest.
    fn combinations(&self) -> Vec<TemplateVars> {
        let axes: Vec<(&String, Vec<Dynamic>)> = self
            .dimensions
            .iter()
            .map(|(name, dim)| (name, dim.values()))
            .collect();

        if axes.iter().any(|(_, values)| values.is_empty()) {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut cursor = vec![0usize; axes.len()];
        loop {
            out.push(
                axes.iter()
                    .zip(&cursor)
                    .map(|((name, values), &i)| ((*name).clone(), values[i].clone()))
                    .collect(),
            );

            // Odometer: bump the last axis, carry leftwards.
            let mut axis = axes.len();
            loop {
                if axis == 0 {
                    return out;
                }
                axis -= 1;
                cursor[axis] += 1;
                if cursor[axis] < axes[axis].1.len() {
                    break;
                }
                cursor[axis] = 0;
            }
        }
    }

    fn expand_into(
        &self,
        renderer: &TemplateRenderer,
        mapping: &mut ReferenceMapping,
    ) -> RefResult<usize> {
        let combos = self.combinations();
        for vars in &combos {
            let key = renderer.render_with(&self.key, vars);
            let url = renderer.render_with(&self.url, vars);
            let entry = match &self.range {
                None => ReferenceEntry::whole(url.clone()),
                Some((offset, length)) => {
                    let offset = eval_u64(renderer, &key, "offset", offset, vars)?;
                    let length = eval_u64(renderer, &key, "length", length, vars)?;
                    ReferenceEntry::range(url.clone(), offset, length)
                }
            };
            match renderer.first_placeholder(&url) {
                Some(placeholder) => mapping.insert_unresolved(&key, entry, placeholder),
                None => mapping.insert(&key, entry),
            }
        }
        Ok(combos.len())
    }
}

fn eval_u64(
    renderer: &TemplateRenderer,
    key: &str,
    field: &str,
    expr: &str,
    vars: &TemplateVars,
) -> RefResult<u64> {
    let rendered = renderer.render_with(expr, vars);
    rendered.trim().parse::<u64>().map_err(|_| {
        RefError::spec(format!(
            "generated reference {key:?}: {field} {expr:?} evaluated to {rendered:?}, not an integer"
        ))
    })
}

/// A parsed, not yet expanded, reference document.
#[derive(Debug, Clone, Default)]
pub struct ReferenceDocument {
    /// `None` for the legacy form.
    pub version: Option<u64>,
    pub templates: IndexMap<String, String>,
    pub generators: Vec<GenerationRule>,
    pub refs: IndexMap<String, Value>,
}

impl ReferenceDocument {
    /// Parse raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> RefResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RefError::spec(format!("document is not JSON: {e}")))?;
        Self::from_json(value)
    }

    /// Detect the form and validate the structure.
    pub fn from_json(value: Value) -> RefResult<Self> {
        let Value::Object(mut top) = value else {
            return Err(RefError::spec("document must be a JSON object"));
        };

        let Some(version) = top.shift_remove("version") else {
            return Ok(Self {
                refs: top.into_iter().collect(),
                ..Self::default()
            });
        };

        match version.as_u64() {
            Some(1) => {}
            _ => {
                return Err(RefError::spec(format!(
                    "unsupported document version {version}"
                )));
            }
        }

        let templates = match top.shift_remove("templates") {
            None | Some(Value::Null) => IndexMap::new(),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(name, v)| match v {
                    Value::String(s) => Ok((name, s)),
                    Value::Number(n) => Ok((name, n.to_string())),
                    other => Err(RefError::spec(format!(
                        "template {name:?} must be a string, got {other}"
                    ))),
                })
                .collect::<RefResult<_>>()?,
            Some(other) => {
                return Err(RefError::spec(format!("templates must be an object, got {other}")));
            }
        };

        let generators = match top.shift_remove("gen") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| GenerationRule::from_json(i, item))
                .collect::<RefResult<_>>()?,
            Some(other) => {
                return Err(RefError::spec(format!("gen must be a list, got {other}")));
            }
        };

        let refs = match top.shift_remove("refs") {
            None | Some(Value::Null) => IndexMap::new(),
            Some(Value::Object(map)) => map.into_iter().collect(),
            Some(other) => {
                return Err(RefError::spec(format!("refs must be an object, got {other}")));
            }
        };

        Ok(Self {
            version: Some(1),
            templates,
            generators,
            refs,
        })
    }

    /// Expand templates and generation rules into a flat mapping.
    pub fn expand(self, options: &LoadOptions) -> RefResult<ReferenceMapping> {
        let table = TemplateTable::new(self.templates, &options.template_overrides);
        let renderer = TemplateRenderer::new(table, options.simple_templates)?;
        let default_target = options.default_target.as_deref();
        let versioned = self.version.is_some();

        let mut mapping = ReferenceMapping::new();
        for (path, value) in self.refs {
            let entry = ReferenceEntry::from_json(&path, &value, default_target)?;
            let entry = match entry {
                ReferenceEntry::Remote { locator, range }
                    if versioned && renderer.has_placeholder(&locator) =>
                {
                    let locator = renderer.render(&locator);
                    let leftover = renderer.first_placeholder(&locator);
                    let entry = ReferenceEntry::Remote { locator, range };
                    if let Some(placeholder) = leftover {
                        mapping.insert_unresolved(&path, entry, placeholder);
                        continue;
                    }
                    entry
                }
                other => other,
            };
            mapping.insert(&path, entry);
        }

        let declared = mapping.len();
        let mut generated = 0;
        for rule in &self.generators {
            generated += rule.expand_into(&renderer, &mut mapping)?;
        }

        tracing::debug!(
            declared,
            generated,
            total = mapping.len(),
            versioned,
            "expanded reference document"
        );
        Ok(mapping)
    }

    /// Convenience: parse then expand.
    pub fn load(value: Value, options: &LoadOptions) -> RefResult<ReferenceMapping> {
        Self::from_json(value)?.expand(options)
    }
}
