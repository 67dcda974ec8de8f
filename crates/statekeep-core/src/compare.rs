// ABOUTME: Structural comparison helpers for JSON state values.
// ABOUTME: Lets consumers keep the previous value when a freshly loaded one is deeply equal.

use std::borrow::Cow;

use serde_json::{Map, Value};

/// Returns `a` (borrowed) when `b` is deeply equal to it. Otherwise returns
/// an owned value equal to `b` in which every child deeply equal to the
/// matching child of `a` was taken from `a`.
///
/// Arrays are matched by index and objects by key; all other values are
/// compared by value.
pub fn replace_equal_deep<'a>(a: &'a Value, b: &'a Value) -> Cow<'a, Value> {
    match (a, b) {
        (Value::Array(a_items), Value::Array(b_items)) => {
            let mut equal_items = 0;
            let mut copy = Vec::with_capacity(b_items.len());
            for (index, b_item) in b_items.iter().enumerate() {
                match a_items.get(index) {
                    Some(a_item) => {
                        let merged = replace_equal_deep(a_item, b_item);
                        if matches!(merged, Cow::Borrowed(_)) {
                            equal_items += 1;
                        }
                        copy.push(merged.into_owned());
                    }
                    None => copy.push(b_item.clone()),
                }
            }
            if a_items.len() == b_items.len() && equal_items == a_items.len() {
                Cow::Borrowed(a)
            } else {
                Cow::Owned(Value::Array(copy))
            }
        }
        (Value::Object(a_map), Value::Object(b_map)) => {
            let mut equal_items = 0;
            let mut copy = Map::with_capacity(b_map.len());
            for (key, b_value) in b_map {
                match a_map.get(key) {
                    Some(a_value) => {
                        let merged = replace_equal_deep(a_value, b_value);
                        if matches!(merged, Cow::Borrowed(_)) {
                            equal_items += 1;
                        }
                        copy.insert(key.clone(), merged.into_owned());
                    }
                    None => {
                        copy.insert(key.clone(), b_value.clone());
                    }
                }
            }
            if a_map.len() == b_map.len() && equal_items == a_map.len() {
                Cow::Borrowed(a)
            } else {
                Cow::Owned(Value::Object(copy))
            }
        }
        _ if a == b => Cow::Borrowed(a),
        _ => Cow::Borrowed(b),
    }
}

/// Shallow comparison of two objects: same number of keys and, for every
/// key of `a`, the same entry in `b`. Scalars compare by value; arrays and
/// objects only match when they are the very same allocation.
pub fn shallow_equal_objects(a: &Map<String, Value>, b: Option<&Map<String, Value>>) -> bool {
    let Some(b) = b else {
        return false;
    };
    if a.len() != b.len() {
        return false;
    }

    a.iter().all(|(key, a_value)| match b.get(key) {
        Some(b_value) => same_entry(a_value, b_value),
        None => false,
    })
}

fn same_entry(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            std::ptr::eq(a, b)
        }
        _ => a == b,
    }
}
