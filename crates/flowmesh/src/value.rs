//! Dot-path dynamic value tree used for `emittedEvents` and index metadata merges.
//!
//! The orchestrator needs to write things like `"order.validated" -> ts` into a
//! nested JSON object, and to delete fields via an explicit `null` marker
//! during optimistic-concurrency merges. `serde_json::Value` already models
//! the tagged-union (map/array/scalar) tree; this module only adds the
//! dot-path walk/merge semantics on top of it.

use serde_json::{Map, Value};

/// Error returned when a dot-path is malformed or collides with a non-object.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    /// The path was empty.
    #[error("empty path")]
    Empty,

    /// A path segment is empty (e.g. `"a..b"`).
    #[error("empty path segment in {0:?}")]
    EmptySegment(String),

    /// A path segment would overwrite a non-object value with nested data.
    #[error("path segment {segment:?} of {path:?} traverses a non-object value")]
    NotAnObject { path: String, segment: String },
}

/// Split a dot-path into segments, rejecting empty segments.
///
/// Literal `.` inside a key is not supported — callers must not construct
/// paths from untrusted segments that may contain `.`.
pub fn split_path(path: &str) -> Result<Vec<&str>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(segments)
}

/// Set `value` at `path` inside `root`, creating intermediate objects as needed.
///
/// A `Value::Null` leaf is written as-is (callers use this to record a
/// deletion marker during merges; see [`merge_deep`]).
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segments = split_path(path)?;
    set_segments(root, &segments, value, path)
}

fn set_segments(root: &mut Value, segments: &[&str], value: Value, full_path: &str) -> Result<(), PathError> {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let obj = root.as_object_mut().expect("just coerced to object");

    let (head, rest) = segments.split_first().expect("non-empty by construction");
    if rest.is_empty() {
        obj.insert((*head).to_string(), value);
        return Ok(());
    }

    let entry = obj
        .entry((*head).to_string())
        .or_insert_with(|| Value::Object(Map::new()));

    if !entry.is_object() && !entry.is_null() {
        return Err(PathError::NotAnObject {
            path: full_path.to_string(),
            segment: (*head).to_string(),
        });
    }
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    set_segments(entry, rest, value, full_path)
}

/// Read the value at `path`, or `None` if any segment is missing.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = split_path(path).ok()?;
    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Deep-merge `updates` into `base`, "updates win" semantics.
///
/// - Objects are merged key-by-key, recursively.
/// - A `Value::Null` leaf in `updates` deletes the corresponding key in
///   `base` (used by `index.update`'s deletion-marker convention).
/// - Any other value (scalar, array, or object replacing a non-object)
///   overwrites the base value outright.
pub fn merge_deep(base: &mut Value, updates: &Value) {
    match (base.as_object_mut(), updates.as_object()) {
        (Some(base_obj), Some(updates_obj)) => {
            for (key, update_value) in updates_obj {
                if update_value.is_null() {
                    base_obj.remove(key);
                    continue;
                }
                match base_obj.get_mut(key) {
                    Some(existing) if existing.is_object() && update_value.is_object() => {
                        merge_deep(existing, update_value);
                    }
                    _ => {
                        base_obj.insert(key.clone(), update_value.clone());
                    }
                }
            }
        }
        _ => {
            *base = updates.clone();
        }
    }
}

/// Build a single-leaf nested object from a dot-path and a leaf value.
///
/// `nest("order.validated", json!(1700000000000))` produces
/// `{"order": {"validated": 1700000000000}}`.
pub fn nest(path: &str, leaf: Value) -> Result<Value, PathError> {
    let mut root = Value::Object(Map::new());
    set_path(&mut root, path, leaf)?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut root = json!({});
        set_path(&mut root, "a.b.c", json!(1)).unwrap();
        assert_eq!(root, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn get_path_reads_nested_value() {
        let root = json!({"a": {"b": {"c": 42}}});
        assert_eq!(get_path(&root, "a.b.c"), Some(&json!(42)));
        assert_eq!(get_path(&root, "a.b.missing"), None);
        assert_eq!(get_path(&root, "x.y"), None);
    }

    #[test]
    fn empty_path_is_rejected() {
        let mut root = json!({});
        assert_eq!(set_path(&mut root, "", json!(1)), Err(PathError::Empty));
        assert!(matches!(
            set_path(&mut root, "a..b", json!(1)),
            Err(PathError::EmptySegment(_))
        ));
    }

    #[test]
    fn merge_deep_overwrites_scalars_and_merges_objects() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let updates = json!({"a": 2, "nested": {"y": 3, "z": 4}});
        merge_deep(&mut base, &updates);
        assert_eq!(base, json!({"a": 2, "nested": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn merge_deep_null_deletes_field() {
        let mut base = json!({"a": 1, "b": 2});
        let updates = json!({"a": null});
        merge_deep(&mut base, &updates);
        assert_eq!(base, json!({"b": 2}));
    }

    #[test]
    fn merge_deep_into_emitted_events_tree() {
        let mut emitted = json!({});
        merge_deep(&mut emitted, &nest("order.validated", json!(1000)).unwrap());
        merge_deep(&mut emitted, &nest("order.shipped", json!(2000)).unwrap());
        merge_deep(&mut emitted, &nest("payment.captured", json!(1500)).unwrap());
        assert_eq!(
            emitted,
            json!({
                "order": {"validated": 1000, "shipped": 2000},
                "payment": {"captured": 1500},
            })
        );
    }

    #[test]
    fn nest_builds_single_leaf_tree() {
        assert_eq!(
            nest("a.b", json!("leaf")).unwrap(),
            json!({"a": {"b": "leaf"}})
        );
    }
}
