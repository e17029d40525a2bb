//! Per-run variable store.
//!
//! `VariableStore` holds the named values produced by steps during one run,
//! plus the stack of `currentItem` bindings for active `for_each` loops.
//! Lookups are read-only; only the runner writes to the store.

use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Name of the loop-local binding inside `for_each` child steps.
pub const CURRENT_ITEM: &str = "currentItem";

/// Name under which the full trigger payload is stored.
pub const TRIGGER: &str = "trigger";

// ---------------------------------------------------------------------------
// VariableStore
// ---------------------------------------------------------------------------

/// The variable environment of a single execution run.
#[derive(Debug, Clone)]
pub struct VariableStore {
    vars: Map<String, Value>,
    /// Innermost loop item last. Never part of `vars`.
    items: Vec<Value>,
    workflow_name: String,
    run_id: Uuid,
}

impl VariableStore {
    pub fn new(workflow_name: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            vars: Map::new(),
            items: Vec::new(),
            workflow_name: workflow_name.into(),
            run_id,
        }
    }

    /// Seed the store with the trigger payload.
    ///
    /// The payload is available as `trigger`; when it is an object, each of
    /// its top-level fields is also bound under its own name.
    pub fn seed_trigger(&mut self, payload: &Value) {
        if let Value::Object(fields) = payload {
            for (k, v) in fields {
                if k != CURRENT_ITEM {
                    self.vars.insert(k.clone(), v.clone());
                }
            }
        }
        self.vars.insert(TRIGGER.to_string(), payload.clone());
    }

    /// Bind `name` to `value`. A later write to the same name wins.
    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        if name == CURRENT_ITEM {
            return self.items.last();
        }
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Look up a dotted path such as `leadCount` or `currentItem.address.city`.
    ///
    /// Numeric segments index into lists.
    pub fn resolve_path(&self, path: &str) -> Option<&Value> {
        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };
        let base = self.get(root)?;
        match rest {
            Some(rest) => lookup_path(base, rest),
            None => Some(base),
        }
    }

    /// Bind `currentItem` for a loop iteration, shadowing any outer item.
    pub fn enter_loop(&mut self, item: Value) {
        self.items.push(item);
    }

    /// Drop the innermost `currentItem`, restoring the outer one (if any).
    pub fn exit_loop(&mut self) {
        self.items.pop();
    }

    pub fn loop_depth(&self) -> usize {
        self.items.len()
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// All named variables as a JSON object. Loop items are excluded.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.vars.clone())
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Walk a dotted path into a JSON value. An empty path returns the value itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Read a value as a number: JSON numbers and numeric strings qualify.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Convert a number to JSON, keeping whole numbers as integers.
pub fn number_to_value(n: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() < MAX_EXACT {
        json!(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Text form of a value for string interpolation.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Short name of a JSON value's kind, for error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}

/// Replace an oversized value with a truncation marker.
///
/// Returns the value unchanged when its serialized size is within `max_bytes`.
pub fn truncate_output(value: Value, max_bytes: usize) -> Value {
    let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
    if size > max_bytes {
        tracing::warn!(size, max = max_bytes, "step output exceeds size limit, truncating");
        json!({ "_truncated": true, "_original_size": size })
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
