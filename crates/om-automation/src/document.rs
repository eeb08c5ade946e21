//! Helpers for the schemaless JSON documents exchanged with Ops Manager.
//!
//! Ops Manager owns the schema of the automation config, so everything that is
//! not explicitly modelled by this crate is kept as an open [`Object`] and
//! round-tripped untouched. The functions in here are the building blocks the
//! typed views use to read and write into those objects.

use serde_json::{Map, Value};
use snafu::{OptionExt, Snafu};

/// A JSON object as it is decoded from (and encoded back to) Ops Manager.
pub type Object = Map<String, Value>;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed-input errors. These indicate that the document handed to the
/// merge engine is internally inconsistent, not that a merge was refused.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("required field {field:?} is missing"))]
    MissingField { field: String },

    #[snafu(display("field {field:?} is expected to be {expected}"))]
    UnexpectedType {
        field: String,
        expected: &'static str,
    },

    #[snafu(display("field {field:?} has unsupported value {value:?}"))]
    InvalidValue { field: String, value: String },

    #[snafu(display("failed to serialize {what}"))]
    Serialize {
        source: serde_json::Error,
        what: &'static str,
    },

    #[snafu(display("failed to deserialize {what}"))]
    Deserialize {
        source: serde_json::Error,
        what: &'static str,
    },
}

/// Returns the object stored at `key`, inserting an empty one if the key is
/// missing or `null`.
pub fn read_or_create_map<'a>(parent: &'a mut Object, key: &str) -> Result<&'a mut Object> {
    let value = parent
        .entry(key)
        .or_insert_with(|| Value::Object(Object::new()));
    if value.is_null() {
        *value = Value::Object(Object::new());
    }

    value.as_object_mut().context(UnexpectedTypeSnafu {
        field: key,
        expected: "an object",
    })
}

/// Returns the object stored at `key`, or [`None`] if the key is missing or `null`.
pub fn get_map<'a>(parent: &'a Object, key: &str) -> Result<Option<&'a Object>> {
    match parent.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(object)) => Ok(Some(object)),
        Some(_) => UnexpectedTypeSnafu {
            field: key,
            expected: "an object",
        }
        .fail(),
    }
}

pub fn get_map_mut<'a>(parent: &'a mut Object, key: &str) -> Result<Option<&'a mut Object>> {
    match parent.get_mut(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(object)) => Ok(Some(object)),
        Some(_) => UnexpectedTypeSnafu {
            field: key,
            expected: "an object",
        }
        .fail(),
    }
}

/// Returns the string stored at `key`, or [`None`] if the key is missing or `null`.
pub fn get_str<'a>(parent: &'a Object, key: &str) -> Result<Option<&'a str>> {
    match parent.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => UnexpectedTypeSnafu {
            field: key,
            expected: "a string",
        }
        .fail(),
    }
}

pub fn require_str<'a>(parent: &'a Object, key: &str) -> Result<&'a str> {
    get_str(parent, key)?.context(MissingFieldSnafu { field: key })
}

/// Follows `path` through nested objects, returning [`None`] as soon as a
/// segment is missing or not an object.
pub fn read_path<'a>(root: &'a Object, path: &[&str]) -> Option<&'a Value> {
    let (last, parents) = path.split_last()?;
    let mut current = root;
    for segment in parents {
        current = current.get(*segment)?.as_object()?;
    }
    current.get(*last)
}

/// Reads a number the way Ops Manager is known to send them: as an integer, a
/// float or a numeric string.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Recursively merges `overlay` into `target`.
///
/// Keys holding objects on both sides are merged, every other value from
/// `overlay` replaces the value in `target`. Keys only present in `target`
/// are kept.
pub fn deep_merge(target: &mut Object, overlay: &Object) {
    for (key, value) in overlay {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Same as [`deep_merge`], but for a single value that is consumed.
pub fn merge_value(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (target, incoming) => *target = incoming,
    }
}

/// Lists the paths of all leaves in `object`. Empty objects count as leaves.
pub fn leaf_paths(object: &Object) -> Vec<Vec<String>> {
    let mut paths = Vec::new();
    collect_leaf_paths(object, &mut Vec::new(), &mut paths);
    paths
}

fn collect_leaf_paths(object: &Object, prefix: &mut Vec<String>, paths: &mut Vec<Vec<String>>) {
    for (key, value) in object {
        prefix.push(key.clone());
        match value {
            Value::Object(child) if !child.is_empty() => collect_leaf_paths(child, prefix, paths),
            _ => paths.push(prefix.clone()),
        }
        prefix.pop();
    }
}

/// Removes every leaf that was part of the `previous` desired config but is no
/// longer part of the `current` one.
///
/// Paths that changed their shape between the two (a leaf that became an
/// object or the other way around) are skipped, the merge has already
/// written the current shape. Objects emptied by a removal are pruned.
pub fn remove_fields_based_on_desired_and_previous(
    target: &mut Object,
    current: &Object,
    previous: &Object,
) {
    let current_paths = leaf_paths(current);
    for path in leaf_paths(previous) {
        let still_owned = current_paths
            .iter()
            .any(|current| current.starts_with(&path) || path.starts_with(current));
        if !still_owned {
            remove_path(target, &path);
        }
    }
}

/// Removes the value at `path`. Returns whether `object` became empty because
/// of the removal.
fn remove_path(object: &mut Object, path: &[String]) -> bool {
    let Some((first, rest)) = path.split_first() else {
        return false;
    };

    if rest.is_empty() {
        return object.remove(first).is_some() && object.is_empty();
    }

    let child_emptied = match object.get_mut(first) {
        Some(Value::Object(child)) => remove_path(child, rest),
        _ => false,
    };
    if child_emptied {
        object.remove(first);
        return object.is_empty();
    }
    false
}

/// Compares two documents, treating numbers as equal when they hold the same
/// value regardless of their integer or float representation.
pub fn semantically_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => l == r,
            _ => l.as_f64() == r.as_f64(),
        },
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(l, r)| semantically_equal(l, r))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter()
                    .all(|(key, l)| r.get(key).is_some_and(|r| semantically_equal(l, r)))
        }
        (l, r) => l == r,
    }
}
