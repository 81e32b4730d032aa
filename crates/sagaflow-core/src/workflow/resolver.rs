//! Reference resolution for task inputs.
//!
//! Walks an input value (scalars, lists, maps) and replaces references to
//! earlier step outputs:
//! - `$stepId` / `$stepId.path.0.field` -- whole-string reference
//! - `{{stepId}}` / `{{ stepId.path }}` -- whole-string template
//! - `$inputs.field` / `{{inputs.field}}` -- caller inputs
//! - `"order {{ reserve.id }} ready"` -- embedded templates, interpolated as text
//!
//! Whole-string references to missing or not-completed steps resolve to
//! `null`. Embedded templates that do not resolve are left untouched. A `$`
//! that is not followed by an identifier (`$5.00`) is a literal.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::context::ExecutionContext;

/// Namespace for caller inputs in references.
const INPUTS: &str = "inputs";

/// Resolve every reference inside `value` against `ctx`.
pub fn resolve_inputs(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_inputs(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_inputs(v, ctx)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, ctx: &ExecutionContext) -> Value {
    if let Some(path) = s.strip_prefix('$') {
        if is_reference_path(path) {
            return lookup(path, ctx).unwrap_or(Value::Null);
        }
        return Value::String(s.to_string());
    }

    if let Some(path) = whole_template(s) {
        return lookup(path, ctx).unwrap_or(Value::Null);
    }

    if s.contains("{{") {
        return Value::String(interpolate(s, ctx));
    }

    Value::String(s.to_string())
}

/// The inner path of a string that is exactly one `{{ path }}` template.
fn whole_template(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let path = inner.trim();
    is_reference_path(path).then_some(path)
}

/// Replace each resolvable `{{ path }}` inside `s` with its text form.
fn interpolate(s: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let raw = &rest[start..start + 2 + end + 2];
        let path = after[..end].trim();
        match is_reference_path(path).then(|| lookup(path, ctx)).flatten() {
            Some(value) if !value.is_null() => out.push_str(&value_to_string(&value)),
            _ => out.push_str(raw),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// `ident(.segment)*` where an identifier starts with a letter or `_` and
/// segments are identifiers or array indices.
fn is_reference_path(path: &str) -> bool {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return false;
    };
    let root_ok = root
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && root.chars().all(is_ident_char);
    root_ok && segments.all(|seg| !seg.is_empty() && seg.chars().all(is_ident_char))
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn lookup(path: &str, ctx: &ExecutionContext) -> Option<Value> {
    let (root, rest) = match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    };
    let base = if root == INPUTS {
        &ctx.inputs
    } else if ctx.is_completed(root) {
        ctx.output(root)?
    } else {
        return None;
    };
    match rest {
        Some(rest) => extract_path(base, rest).cloned(),
        None => Some(base.clone()),
    }
}

/// Follow a dot path into `value`. Numeric segments index arrays.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "." {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Shape a raw task result through an `outputs` mapping. Unresolvable paths
/// map to `null`.
pub fn map_outputs(raw: &Value, mapping: &BTreeMap<String, String>) -> Value {
    Value::Object(
        mapping
            .iter()
            .map(|(field, path)| {
                (
                    field.clone(),
                    extract_path(raw, path).cloned().unwrap_or(Value::Null),
                )
            })
            .collect(),
    )
}

/// Text form of a value for interpolation: strings raw, everything else JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
