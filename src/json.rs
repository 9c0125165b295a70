//! Path-addressed access to JSON trees.
//!
//! The server treats `serde_json::Value` as its document tree and only needs
//! a few operations on it: dotted-path get/set/remove and a blend that merges
//! one tree into another (used for layering configuration).

use serde_json::{Map, Value};

/// Looks up `path` (`"a.b.c"`, empty for the root).
pub fn get<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = tree;
    for key in path.split('.').filter(|k| !k.is_empty()) {
        node = match node {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

pub fn get_str<'a>(tree: &'a Value, path: &str) -> Option<&'a str> {
    get(tree, path).and_then(Value::as_str)
}

/// Reads a boolean, accepting `"true"`/`"false"` strings.
pub fn get_bool(tree: &Value, path: &str, default: bool) -> bool {
    match get(tree, path) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => default,
    }
}

pub fn get_int(tree: &Value, path: &str, default: i64) -> i64 {
    match get(tree, path) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Sets `path` to `value`, creating intermediate objects.
pub fn set(tree: &mut Value, path: &str, value: Value) {
    let keys: Vec<&str> = path.split('.').filter(|k| !k.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        *tree = value;
        return;
    };
    let mut node = tree;
    for key in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

/// Removes `path`, returning the removed value.
pub fn remove(tree: &mut Value, path: &str) -> Option<Value> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (parent, last),
        None => ("", path),
    };
    let mut node = tree;
    for key in parent.split('.').filter(|k| !k.is_empty()) {
        node = node.as_object_mut()?.get_mut(key)?;
    }
    node.as_object_mut()?.remove(last)
}

/// Merges `src` into `dest`. Objects merge recursively; other values replace
/// the destination only when `overwrite` is set or the key is absent.
pub fn blend(dest: &mut Value, src: &Value, overwrite: bool) {
    match (dest, src) {
        (Value::Object(dest), Value::Object(src)) => {
            for (key, value) in src {
                match dest.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        blend(existing, value, overwrite);
                    }
                    Some(existing) => {
                        if overwrite {
                            *existing = value.clone();
                        }
                    }
                    None => {
                        dest.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest, src) => {
            if overwrite {
                *dest = src.clone();
            }
        }
    }
}
