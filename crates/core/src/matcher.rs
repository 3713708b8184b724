//! Structural matching of filter documents against record sections.
//!
//! A filter is a pattern: it matches a target when every part of it can be
//! found in the target with the same shape. Maps match key by key (extra
//! target keys are ignored), lists match as multiset containment and scalars
//! match on equal values of the same primitive type.

#![forbid(unsafe_code)]

use serde_json::{Number, Value};

/// Returns true when `filter` is structurally contained in `target`.
///
/// Never fails: a missing key or a shape mismatch is a plain `false`.
pub fn matches(filter: &Value, target: &Value) -> bool {
    match (filter, target) {
        (Value::Object(f), Value::Object(t)) => f
            .iter()
            .all(|(key, fv)| t.get(key).is_some_and(|tv| matches(fv, tv))),
        // Each filter element needs a counterpart somewhere in the target.
        // Target elements are not consumed, so duplicates in the filter can
        // all be satisfied by a single target element.
        (Value::Array(f), Value::Array(t)) => {
            f.len() <= t.len() && f.iter().all(|fv| t.iter().any(|tv| matches(fv, tv)))
        }
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

/// Section-level entry point: an absent filter matches every target.
pub fn matches_section(filter: Option<&Value>, target: &Value) -> bool {
    filter.map_or(true, |f| matches(f, target))
}

// YAML criteria and JSON records do not agree on integer vs float encoding,
// so numbers compare by value rather than by representation.
fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
