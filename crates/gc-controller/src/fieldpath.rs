//! JSON field-path resolution over untyped resources
//!
//! Resources are handled as generic documents (`DynamicObject` rendered to a
//! `serde_json::Value`). Paths use the kubectl JSONPath subset operators
//! already write in policies:
//!
//! - `.status.phase`, `status.phase`, `{.status.phase}`, `$.status.phase`
//! - `.spec.containers[0].image`
//! - `.metadata.labels['app.kubernetes.io/name']` or `.metadata.labels.app\.kubernetes\.io/name`
//!
//! Every accessor returns `Option`; an unresolvable path is never an error for
//! callers, it simply means "absent".

use chrono::{DateTime, TimeZone, Utc};
use kube::api::DynamicObject;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldPathError {
    #[error("field path is empty")]
    Empty,

    #[error("field path '{path}' has an empty segment")]
    EmptySegment { path: String },

    #[error("field path '{path}' has an unterminated bracket")]
    UnterminatedBracket { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parsed field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, FieldPathError> {
        let raw = path.to_string();
        let mut body = path.trim();
        if let Some(inner) = body.strip_prefix('{').and_then(|b| b.strip_suffix('}')) {
            body = inner.trim();
        }
        if let Some(rest) = body.strip_prefix('$') {
            body = rest;
        }
        if body.is_empty() || body == "." {
            return Err(FieldPathError::Empty);
        }

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = body.chars();
        let mut prev_dot = false;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if prev_dot {
                        return Err(FieldPathError::EmptySegment { path: raw });
                    }
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    prev_dot = true;
                    continue;
                }
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => current.push('\\'),
                },
                '[' => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    let mut inner = String::new();
                    let mut closed = false;
                    for b in chars.by_ref() {
                        if b == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(b);
                    }
                    if !closed {
                        return Err(FieldPathError::UnterminatedBracket { path: raw });
                    }
                    segments.push(bracket_segment(inner.trim()));
                }
                _ => current.push(c),
            }
            prev_dot = false;
        }
        if prev_dot {
            return Err(FieldPathError::EmptySegment { path: raw });
        }
        if !current.is_empty() {
            segments.push(Segment::Key(current));
        }
        if segments.is_empty() {
            return Err(FieldPathError::Empty);
        }

        Ok(Self { raw, segments })
    }

    /// The path as written in the policy
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut node = doc;
        for segment in &self.segments {
            node = match (segment, node) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        if node.is_null() {
            None
        } else {
            Some(node)
        }
    }
}

fn bracket_segment(inner: &str) -> Segment {
    let unquoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    match unquoted {
        Some(key) => Segment::Key(key.to_string()),
        None => match inner.parse::<usize>() {
            Ok(idx) => Segment::Index(idx),
            Err(_) => Segment::Key(inner.to_string()),
        },
    }
}

/// Parses and resolves in one step; malformed paths resolve to `None`.
#[must_use]
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    FieldPath::parse(path).ok()?.resolve(doc)
}

/// Renders a resource as a plain JSON document for path resolution.
#[must_use]
pub fn document(obj: &DynamicObject) -> Value {
    serde_json::to_value(obj).unwrap_or(Value::Null)
}

/// Integer view of a value: JSON numbers (floats truncated) and numeric strings.
#[must_use]
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_f64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(truncate_f64))
        }
        _ => None,
    }
}

/// Float view of a value: JSON numbers and numeric strings.
#[must_use]
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// String view of a scalar value; objects and arrays have none.
#[must_use]
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Timestamp view of a value: RFC 3339 strings, or Unix seconds as number or string.
#[must_use]
pub fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Value::String(s) = value {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(s.trim()) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    let seconds = as_i64(value)?;
    Utc.timestamp_opt(seconds, 0).single()
}

#[allow(clippy::cast_possible_truncation)]
fn truncate_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f.trunc() as i64)
    } else {
        None
    }
}
