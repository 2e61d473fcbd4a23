//! Structural comparison between a desired object and its live counterpart.
//!
//! The live object carries fields the store fills in on its own (uids,
//! resource versions, defaulted container fields, status). Desired state is
//! therefore compared as a *subset* of the live object, and updates overlay
//! the desired fields on top of the live object instead of replacing it.

use serde_json::{Map, Value};

/// Whether every field set in `desired` has the same value in `live`.
///
/// Objects are compared key by key, arrays element by element (lengths must
/// match), nulls in `desired` are ignored. Keys present only in `live` never
/// count as a difference.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Null, _) => true,
        (Value::Object(desired), Value::Object(live)) => desired
            .iter()
            .all(|(key, value)| match live.get(key) {
                Some(live) => is_subset(value, live),
                None => value.is_null(),
            }),
        (Value::Array(desired), Value::Array(live)) => {
            desired.len() == live.len()
                && desired
                    .iter()
                    .zip(live.iter())
                    .all(|(desired, live)| is_subset(desired, live))
        }
        (desired, live) => desired == live,
    }
}

/// Overlays `desired` on `live`, keeping every live field `desired` does not
/// mention. Arrays of equal length are overlaid element-wise, otherwise the
/// desired array wins.
pub fn overlay(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (live, Value::Null) => live.clone(),
        (Value::Object(live), Value::Object(desired)) => {
            let mut merged = live.clone();
            for (key, value) in desired {
                let next = match live.get(key) {
                    Some(current) => overlay(current, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Array(live), Value::Array(desired)) if live.len() == desired.len() => Value::Array(
            live.iter()
                .zip(desired.iter())
                .map(|(live, desired)| overlay(live, desired))
                .collect(),
        ),
        (_, desired) => desired.clone(),
    }
}

/// Applies a JSON merge patch (RFC 7386) to `target` in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
