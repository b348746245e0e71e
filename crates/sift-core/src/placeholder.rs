//! Typed references from one node's params into another node's output.
//!
//! A placeholder is a JSON object with a single `"$ref"` key whose value names
//! a node and a path into that node's serialized payload:
//!
//! ```text
//! {"$ref": "n1.items[*].thread_id"}
//! ```
//!
//! `.field` selects an object field, `[3]` an array element, and `[*]` fans out
//! over every element of an array, applying the rest of the path to each.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Result, SiftError};

/// Object key that marks a placeholder.
pub const REF_KEY: &str = "$ref";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Each,
}

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderRef {
    pub node_id: String,
    pub path: Vec<PathSegment>,
}

impl PlaceholderRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bad = |why: &str| SiftError::Configuration(format!("bad placeholder '{}': {}", raw, why));

        let id_end = raw.find(['.', '[']).unwrap_or(raw.len());
        let node_id = &raw[..id_end];
        if node_id.is_empty() {
            return Err(bad("missing node id"));
        }
        if !node_id.chars().all(is_ident_char) {
            return Err(bad("node id has invalid characters"));
        }

        let mut path = Vec::new();
        let mut rest = &raw[id_end..];
        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
                let field = &after_dot[..end];
                if field.is_empty() || !field.chars().all(is_ident_char) {
                    return Err(bad("empty or invalid field name"));
                }
                path.push(PathSegment::Field(field.to_string()));
                rest = &after_dot[end..];
            } else if let Some(after_bracket) = rest.strip_prefix('[') {
                let close = after_bracket.find(']').ok_or_else(|| bad("unclosed '['"))?;
                let inner = after_bracket[..close].trim();
                if inner == "*" {
                    path.push(PathSegment::Each);
                } else {
                    let idx = inner
                        .parse::<usize>()
                        .map_err(|_| bad("index must be a number or '*'"))?;
                    path.push(PathSegment::Index(idx));
                }
                rest = &after_bracket[close + 1..];
            } else {
                return Err(bad("expected '.' or '['"));
            }
        }

        Ok(Self {
            node_id: node_id.to_string(),
            path,
        })
    }

    /// Apply the path to a node's serialized payload.
    pub fn select(&self, payload: &Value) -> Result<Value> {
        select_path(payload, &self.path).map_err(|missing| {
            SiftError::Configuration(format!("unresolved placeholder '{}': {}", self, missing))
        })
    }
}

impl FromStr for PlaceholderRef {
    type Err = SiftError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PlaceholderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_id)?;
        for seg in &self.path {
            match seg {
                PathSegment::Field(name) => write!(f, ".{}", name)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
                PathSegment::Each => write!(f, "[*]")?,
            }
        }
        Ok(())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn select_path(value: &Value, path: &[PathSegment]) -> std::result::Result<Value, String> {
    let Some((head, tail)) = path.split_first() else {
        return Ok(value.clone());
    };
    match head {
        PathSegment::Field(name) => match value.get(name.as_str()) {
            Some(v) => select_path(v, tail),
            None => Err(format!("field '{}' missing", name)),
        },
        PathSegment::Index(i) => match value.as_array() {
            Some(arr) => match arr.get(*i) {
                Some(v) => select_path(v, tail),
                None => Err(format!("index {} out of range (len {})", i, arr.len())),
            },
            None => Err(format!("index {} applied to a non-array", i)),
        },
        PathSegment::Each => match value.as_array() {
            Some(arr) => arr
                .iter()
                .map(|v| select_path(v, tail))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            None => Err("[*] applied to a non-array".to_string()),
        },
    }
}

/// If `value` is a placeholder object, return its raw reference string.
pub fn as_placeholder(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(REF_KEY)?.as_str()
}

/// Parse every placeholder found anywhere inside `params`.
pub fn collect(params: &Value) -> Result<Vec<PlaceholderRef>> {
    let mut out = Vec::new();
    walk(params, &mut |raw| {
        out.push(PlaceholderRef::parse(raw)?);
        Ok(())
    })?;
    Ok(out)
}

/// Whether any placeholder object remains inside `params`.
pub fn contains_placeholder(params: &Value) -> bool {
    let mut found = false;
    let _ = walk(params, &mut |_| {
        found = true;
        Ok(())
    });
    found
}

fn walk(value: &Value, visit: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
    if let Some(raw) = as_placeholder(value) {
        return visit(raw);
    }
    match value {
        Value::Array(items) => items.iter().try_for_each(|v| walk(v, visit)),
        Value::Object(map) => map.values().try_for_each(|v| walk(v, visit)),
        _ => Ok(()),
    }
}

/// Replace every placeholder in `params` with the value it selects.
///
/// `sources` maps node ids to their serialized payloads. Any reference to a
/// node not present in `sources`, or any missing path, is a configuration error.
pub fn resolve(params: &Value, sources: &HashMap<String, Value>) -> Result<Value> {
    if let Some(raw) = as_placeholder(params) {
        let reference = PlaceholderRef::parse(raw)?;
        let payload = sources.get(&reference.node_id).ok_or_else(|| {
            SiftError::Configuration(format!(
                "unresolved placeholder '{}': no output from node '{}'",
                reference, reference.node_id
            ))
        })?;
        return reference.select(payload);
    }
    match params {
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, sources))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, sources)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
