//! Template parsing and resolution.
//!
//! Two reference syntaxes share one parser: `{name}` and `{{ path.to.field }}`.
//! A brace pair whose contents are not a valid dotted path (for example a
//! JSON literal) is plain text.
//!
//! Two resolution modes exist:
//! - [`render`] is lenient: an unresolvable reference stays in the output
//!   as its literal template text.
//! - [`resolve_strict`] and the typed helpers fail with a [`ResolutionError`].
//!
//! Neither mode mutates the store.

use serde_json::Value;

use super::variables::{VariableStore, kind_of, value_as_f64, value_to_text};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A template, formula, or typed value could not be resolved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("variable '{0}' is not defined")]
    UnknownVariable(String),

    #[error("path '{0}' does not resolve to a value")]
    MissingPath(String),

    #[error("'{path}' is not a list (found {found})")]
    NotAList { path: String, found: &'static str },

    #[error("{field}: '{value}' is not a number")]
    NotANumber { field: String, value: String },

    #[error("{field} resolved to an empty value")]
    Empty { field: String },

    #[error("formula syntax error at position {position}: {message}")]
    FormulaSyntax { position: usize, message: String },

    #[error("division by zero at position {position}")]
    DivisionByZero { position: usize },

    #[error("formula result is not a finite number")]
    NonFinite,

    #[error("invalid date '{0}': expected YYYY-MM-DD, 'today', or '+N days'")]
    InvalidDate(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Reference {
        /// Dotted path, whitespace trimmed.
        path: String,
        /// The original text including braces.
        raw: String,
    },
}

/// Split a template into literal text and references.
pub fn parse(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        literal.push_str(&rest[..open]);
        let tail = &rest[open..];

        match match_reference(tail) {
            Some((path, len)) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Reference {
                    path,
                    raw: tail[..len].to_string(),
                });
                rest = &tail[len..];
            }
            None => {
                literal.push('{');
                rest = &tail[1..];
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Try to read a reference at the start of `s` (which begins with `{`).
/// Returns the trimmed path and the number of bytes consumed.
fn match_reference(s: &str) -> Option<(String, usize)> {
    if let Some(inner) = s.strip_prefix("{{") {
        if let Some(close) = inner.find("}}") {
            let path = inner[..close].trim();
            if is_valid_path(path) {
                return Some((path.to_string(), close + 4));
            }
        }
    }
    let inner = &s[1..];
    let close = inner.find('}')?;
    let path = inner[..close].trim();
    if is_valid_path(path) {
        Some((path.to_string(), close + 2))
    } else {
        None
    }
}

fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// The reference paths a template contains, in order.
pub fn references(template: &str) -> Vec<String> {
    parse(template)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference { path, .. } => Some(path),
            Segment::Literal(_) => None,
        })
        .collect()
}

/// If the trimmed template is exactly one reference, its path.
fn sole_reference(template: &str) -> Option<String> {
    let mut segments = parse(template.trim());
    if segments.len() != 1 {
        return None;
    }
    match segments.pop() {
        Some(Segment::Reference { path, .. }) => Some(path),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Look up a path, distinguishing an unknown root from a missing field.
pub fn lookup<'a>(path: &str, store: &'a VariableStore) -> Result<&'a Value, ResolutionError> {
    if let Some(value) = store.resolve_path(path) {
        return Ok(value);
    }
    let root = path.split('.').next().unwrap_or(path);
    if store.contains(root) {
        Err(ResolutionError::MissingPath(path.to_string()))
    } else {
        Err(ResolutionError::UnknownVariable(root.to_string()))
    }
}

/// Interpolate a template, leaving unresolvable references as literal text.
pub fn render(template: &str, store: &VariableStore) -> String {
    parse(template)
        .into_iter()
        .map(|segment| match segment {
            Segment::Literal(text) => text,
            Segment::Reference { path, raw } => match store.resolve_path(&path) {
                Some(value) => value_to_text(value),
                None => raw,
            },
        })
        .collect()
}

/// Resolve a template, failing on the first unresolvable reference.
///
/// A template that is exactly one reference yields the referenced value with
/// its original type; anything else yields a string.
pub fn resolve_strict(template: &str, store: &VariableStore) -> Result<Value, ResolutionError> {
    if let Some(path) = sole_reference(template) {
        return lookup(&path, store).cloned();
    }
    let mut out = String::new();
    for segment in parse(template) {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Reference { path, .. } => out.push_str(&value_to_text(lookup(&path, store)?)),
        }
    }
    Ok(Value::String(out))
}

/// Leniently resolve every string inside a JSON value.
///
/// Strings that are exactly one resolvable reference are replaced by the
/// referenced value (keeping its type); other strings are rendered.
pub fn resolve_value(value: &Value, store: &VariableStore) -> Value {
    match value {
        Value::String(s) => match sole_reference(s).and_then(|p| store.resolve_path(&p)) {
            Some(resolved) => resolved.clone(),
            None => Value::String(render(s, store)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, store)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, store)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a configured value to a number.
///
/// Numbers pass through; strings are resolved strictly and must then read
/// as a number. Nothing is silently defaulted.
pub fn resolve_number(
    value: &Value,
    field: &str,
    store: &VariableStore,
) -> Result<f64, ResolutionError> {
    let resolved = match value {
        Value::String(s) => resolve_strict(s, store)?,
        other => other.clone(),
    };
    value_as_f64(&resolved).ok_or_else(|| ResolutionError::NotANumber {
        field: field.to_string(),
        value: value_to_text(&resolved),
    })
}

/// Resolve a template strictly to a non-empty string.
pub fn resolve_text(
    template: &str,
    field: &str,
    store: &VariableStore,
) -> Result<String, ResolutionError> {
    let text = value_to_text(&resolve_strict(template, store)?);
    if text.trim().is_empty() {
        return Err(ResolutionError::Empty {
            field: field.to_string(),
        });
    }
    Ok(text)
}

/// Resolve a variable path (with or without braces) to a non-empty string.
pub fn resolve_path_text(
    source: &str,
    field: &str,
    store: &VariableStore,
) -> Result<String, ResolutionError> {
    let path = sole_reference(source).unwrap_or_else(|| source.trim().to_string());
    let text = value_to_text(lookup(&path, store)?);
    if text.trim().is_empty() {
        return Err(ResolutionError::Empty {
            field: field.to_string(),
        });
    }
    Ok(text)
}

/// Resolve a variable path (with or without braces) to a list.
pub fn resolve_list(source: &str, store: &VariableStore) -> Result<Vec<Value>, ResolutionError> {
    let path = sole_reference(source).unwrap_or_else(|| source.trim().to_string());
    match lookup(&path, store)? {
        Value::Array(items) => Ok(items.clone()),
        other => Err(ResolutionError::NotAList {
            path,
            found: kind_of(other),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
