//! `{{ path }}` parameter substitution.
//!
//! A string that is exactly one placeholder resolves to the raw JSON value
//! at that path. Any other string has each placeholder rendered in place
//! (strings verbatim, everything else as compact JSON).

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// A `{{ dotted.path }}` placeholder anywhere in a string.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").unwrap()
});

/// A string consisting of exactly one placeholder.
static WHOLE_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}\s*$").unwrap()
});

/// Dotted lookup. Numeric segments index into arrays.
pub fn lookup<'a>(scope: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = scope.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve<'a>(scope: &'a Map<String, Value>, path: &str) -> Result<&'a Value> {
    lookup(scope, path).ok_or_else(|| Error::UnresolvedParameter {
        path: path.to_string(),
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render every placeholder in `template` into a string.
pub fn render_str(template: &str, scope: &Map<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&render(resolve(scope, path.as_str())?));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Substitute placeholders in a string, keeping the raw value for a lone
/// placeholder.
pub fn substitute_str(template: &str, scope: &Map<String, Value>) -> Result<Value> {
    if let Some(path) = WHOLE_PLACEHOLDER_RE
        .captures(template)
        .and_then(|c| c.get(1))
    {
        return resolve(scope, path.as_str()).cloned();
    }
    Ok(Value::String(render_str(template, scope)?))
}

/// Substitute placeholders throughout a JSON value.
pub fn substitute(value: &Value, scope: &Map<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => substitute_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => substitute_map(map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub fn substitute_map(map: &Map<String, Value>, scope: &Map<String, Value>) -> Result<Map<String, Value>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), substitute(v, scope)?)))
        .collect()
}

/// Substitute each string in a list, flattening array results.
pub fn substitute_list(items: &[String], scope: &Map<String, Value>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for item in items {
        match substitute_str(item, scope)? {
            Value::Array(values) => out.extend(values.iter().map(render)),
            Value::Null => {}
            other => out.push(render(&other)),
        }
    }
    Ok(out)
}
