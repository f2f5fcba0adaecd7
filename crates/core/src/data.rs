//! Dotted-path access into a nested key/value tree.
//!
//! Paths are split on `.`; empty segments are ignored, so `"a..b"` and
//! `"a.b"` address the same node. A `null` node reads as absent.
//!
//! `set` merges rather than replaces when both the incoming value and the
//! existing node are mappings and the existing node is non-empty. In every
//! other case the target node is replaced.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AuthError, AuthResult};

pub const SEPARATOR: char = '.';

fn segments(path: &str) -> Vec<&str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty()).collect()
}

fn object_slot(slot: &mut Value) -> &mut Map<String, Value> {
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was reset to an object"),
    }
}

fn merge_or_replace(parent: &mut Map<String, Value>, key: &str, value: Value) {
    let merge = matches!(
        (parent.get(key), &value),
        (Some(Value::Object(existing)), Value::Object(_)) if !existing.is_empty()
    );
    if merge {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) = (parent.get_mut(key), value) {
            existing.extend(incoming);
        }
    } else {
        parent.insert(key.to_string(), value);
    }
}

/// Read the node at `path`. The empty path reads as absent.
pub fn get<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let segs = segments(path);
    let Some((first, rest)) = segs.split_first() else {
        return None;
    };
    let mut current = root.get(*first)?;
    for seg in rest {
        current = match current {
            Value::Object(map) => map.get(*seg)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// Write `value` at `path`, creating intermediate mappings as needed.
///
/// Non-mapping intermediate nodes are replaced by empty mappings. The empty
/// path only accepts a mapping, which is merged into (or replaces) the root.
pub fn set(root: &mut Map<String, Value>, path: &str, value: Value) -> AuthResult<()> {
    let segs = segments(path);
    let Some((last, parents)) = segs.split_last() else {
        return match value {
            Value::Object(incoming) => {
                root.extend(incoming);
                Ok(())
            }
            _ => Err(AuthError::invalid_state(
                "only a mapping can be assigned to the root of a data bag",
            )),
        };
    };

    let mut current = root;
    for seg in parents {
        let slot = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = object_slot(slot);
    }
    merge_or_replace(current, last, value);
    Ok(())
}

/// Remove the node at `path`, returning it if it existed.
pub fn delete(root: &mut Map<String, Value>, path: &str) -> Option<Value> {
    let segs = segments(path);
    let (last, parents) = segs.split_last()?;
    let mut current = root;
    for seg in parents {
        current = match current.get_mut(*seg) {
            Some(Value::Object(map)) => map,
            _ => return None,
        };
    }
    current.remove(*last)
}

/// Arbitrary nested data attached to a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag(Map<String, Value>);

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get(&self.0, path)
    }

    /// Convenience accessor for string leaves.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> AuthResult<()> {
        set(&mut self.0, path, value.into())
    }

    pub fn delete(&mut self, path: &str) -> Option<Value> {
        delete(&mut self.0, path)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of the top-level mapping without the given keys.
    pub fn without(&self, keys: &[&str]) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(k, _)| !keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl From<Map<String, Value>> for DataBag {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn bag(value: Value) -> DataBag {
        match value {
            Value::Object(map) => DataBag::from_map(map),
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn set_merges_into_existing_mapping() {
        let mut data = bag(json!({"profile": {"age": 30}}));
        data.set("profile.city", "Sofia").unwrap();
        assert_eq!(
            Value::Object(data.into_map()),
            json!({"profile": {"age": 30, "city": "Sofia"}})
        );
    }

    #[test]
    fn setting_a_mapping_merges_shallowly() {
        let mut data = bag(json!({"profile": {"age": 30, "city": "Varna"}}));
        data.set("profile", json!({"city": "Sofia", "zip": "1000"})).unwrap();
        assert_eq!(
            data.get("profile"),
            Some(&json!({"age": 30, "city": "Sofia", "zip": "1000"}))
        );
    }

    #[test]
    fn mapping_onto_empty_or_scalar_replaces() {
        let mut data = bag(json!({"a": {}, "b": 5}));
        data.set("a", json!({"x": 1})).unwrap();
        data.set("b", json!({"y": 2})).unwrap();
        assert_eq!(data.get("a"), Some(&json!({"x": 1})));
        assert_eq!(data.get("b"), Some(&json!({"y": 2})));
    }

    #[test]
    fn scalar_replaces_mapping() {
        let mut data = bag(json!({"profile": {"age": 30}}));
        data.set("profile", "gone").unwrap();
        assert_eq!(data.get_str("profile"), Some("gone"));
    }

    #[test]
    fn intermediate_scalars_become_mappings() {
        let mut data = bag(json!({"a": 1}));
        data.set("a.b.c", true).unwrap();
        assert_eq!(data.get("a"), Some(&json!({"b": {"c": true}})));
    }

    #[test]
    fn get_treats_null_and_missing_alike() {
        let data = bag(json!({"a": null, "b": {"c": 1}}));
        assert_eq!(data.get("a"), None);
        assert_eq!(data.get("b.d"), None);
        assert_eq!(data.get("b.c.d"), None);
        assert_eq!(data.get("..b..c"), Some(&json!(1)));
    }

    #[test]
    fn delete_removes_leaf_only() {
        let mut data = bag(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(data.delete("a.b"), Some(json!(1)));
        assert_eq!(data.delete("a.b"), None);
        assert_eq!(data.get("a"), Some(&json!({"c": 2})));
    }

    #[test]
    fn root_accepts_only_mappings() {
        let mut data = bag(json!({"a": 1}));
        data.set("", json!({"b": 2})).unwrap();
        assert_eq!(data.get("b"), Some(&json!(2)));
        assert!(data.set("", 3).is_err());
    }

    #[test]
    fn without_drops_internal_keys() {
        let data = bag(json!({"usr": "1", "id": "1", "name": "Ana"}));
        let map = data.without(&["usr", "id"]);
        assert_eq!(Value::Object(map), json!({"name": "Ana"}));
    }

    proptest! {
        #[test]
        fn scalar_set_then_get(
            path in proptest::collection::vec("[a-z]{1,4}", 1..4),
            n in any::<i64>(),
        ) {
            let path = path.join(".");
            let mut data = DataBag::new();
            data.set(&path, n).unwrap();
            prop_assert_eq!(data.get(&path), Some(&json!(n)));
        }
    }
}
