//! Reference entries: how one logical file's bytes are produced.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};

use crate::error::{RefError, RefResult};

/// Prefix marking a base64-encoded literal in the legacy document form.
pub const BASE64_PREFIX: &str = "base64:";

/// A contiguous span of a target resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// One reference.
///
/// Entries are immutable; replacing a reference means inserting a new entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceEntry {
    /// Bytes stored inline.
    Literal(Vec<u8>),
    /// Base64 text, decoded on every read.
    Encoded(String),
    /// Any other JSON value, serialized with sorted keys on read.
    Structured(Value),
    /// Bytes living in some other resource. `range: None` reads the whole target.
    Remote {
        locator: String,
        range: Option<ByteRange>,
    },
}

impl ReferenceEntry {
    /// Literal entry from anything byte-like.
    pub fn literal(data: impl Into<Vec<u8>>) -> Self {
        Self::Literal(data.into())
    }

    /// Whole-target remote entry.
    pub fn whole(locator: impl Into<String>) -> Self {
        Self::Remote {
            locator: locator.into(),
            range: None,
        }
    }

    /// Ranged remote entry.
    pub fn range(locator: impl Into<String>, offset: u64, length: u64) -> Self {
        Self::Remote {
            locator: locator.into(),
            range: Some(ByteRange::new(offset, length)),
        }
    }

    /// Parse one value of the legacy document form.
    ///
    /// `default_target` stands in for a `null` locator.
    pub fn from_json(path: &str, value: &Value, default_target: Option<&str>) -> RefResult<Self> {
        match value {
            Value::String(s) => Ok(match s.strip_prefix(BASE64_PREFIX) {
                Some(encoded) => Self::Encoded(encoded.to_string()),
                None => Self::Literal(s.as_bytes().to_vec()),
            }),
            Value::Array(items) if is_locator_slot(items.first()) => {
                let locator = match &items[0] {
                    Value::String(s) => s.clone(),
                    _ => default_target.map(str::to_string).ok_or_else(|| {
                        RefError::spec(format!(
                            "reference {path:?} has a null target and no default target is set"
                        ))
                    })?,
                };
                match items.len() {
                    1 => Ok(Self::whole(locator)),
                    3 => {
                        let offset = as_u64(path, "offset", &items[1])?;
                        let length = as_u64(path, "length", &items[2])?;
                        Ok(Self::range(locator, offset, length))
                    }
                    n => Err(RefError::spec(format!(
                        "reference {path:?} must be [target] or [target, offset, length], got {n} items"
                    ))),
                }
            }
            other => Ok(Self::Structured(other.clone())),
        }
    }

    /// Inverse of [`ReferenceEntry::from_json`].
    pub fn to_json(&self) -> Value {
        match self {
            Self::Literal(data) => match std::str::from_utf8(data) {
                Ok(text) if !text.starts_with(BASE64_PREFIX) => Value::String(text.to_string()),
                _ => Value::String(format!("{BASE64_PREFIX}{}", BASE64.encode(data))),
            },
            Self::Encoded(text) => Value::String(format!("{BASE64_PREFIX}{text}")),
            Self::Structured(value) => value.clone(),
            Self::Remote { locator, range } => match range {
                None => Value::Array(vec![Value::String(locator.clone())]),
                Some(r) => Value::Array(vec![
                    Value::String(locator.clone()),
                    Value::from(r.offset),
                    Value::from(r.length),
                ]),
            },
        }
    }

    /// Bytes for the in-memory kinds. `None` for remote entries.
    pub fn inline_bytes(&self, path: &str) -> RefResult<Option<Vec<u8>>> {
        match self {
            Self::Literal(data) => Ok(Some(data.clone())),
            Self::Encoded(text) => BASE64
                .decode(text.as_bytes())
                .map(Some)
                .map_err(|e| RefError::decode(path, e)),
            Self::Structured(value) => Ok(Some(canonical_json(value)?)),
            Self::Remote { .. } => Ok(None),
        }
    }

    /// Size known without any backend I/O.
    pub fn known_size(&self) -> Option<u64> {
        match self {
            Self::Literal(data) => Some(data.len() as u64),
            Self::Encoded(text) => BASE64.decode(text.as_bytes()).ok().map(|d| d.len() as u64),
            Self::Structured(value) => canonical_json(value).ok().map(|d| d.len() as u64),
            Self::Remote { range, .. } => range.map(|r| r.length),
        }
    }

    /// The target locator, for remote entries.
    pub fn locator(&self) -> Option<&str> {
        match self {
            Self::Remote { locator, .. } => Some(locator),
            _ => None,
        }
    }
}

fn is_locator_slot(first: Option<&Value>) -> bool {
    matches!(first, Some(Value::String(_)) | Some(Value::Null))
}

fn as_u64(path: &str, field: &str, value: &Value) -> RefResult<u64> {
    value.as_u64().ok_or_else(|| {
        RefError::spec(format!(
            "reference {path:?} has non-integer {field}: {value}"
        ))
    })
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> RefResult<Vec<u8>> {
    Ok(serde_json::to_vec(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// A target address split into protocol and backend-relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator<'a> {
    /// `None` for bare paths.
    pub protocol: Option<&'a str>,
    pub path: &'a str,
}

impl<'a> Locator<'a> {
    /// Split `proto://rest`. Bare paths have no protocol.
    pub fn parse(locator: &'a str) -> Self {
        match locator.split_once("://") {
            Some((protocol, path))
                if !protocol.is_empty()
                    && protocol
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
            {
                Self {
                    protocol: Some(protocol),
                    path,
                }
            }
            _ => Self {
                protocol: None,
                path: locator,
            },
        }
    }
}
