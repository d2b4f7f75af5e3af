use crate::core::value::{Document, Value};

/// Dotted field-path resolution. A missing field is `None`, which callers
/// fold to null or keep distinct (`$exists`, projection, unwind).
pub fn resolve(doc: &Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (first, rest) = segments.split_first()?;
    let value = doc.fields.get(*first)?;
    walk(value, rest)
}

fn walk(value: &Value, segments: &[&str]) -> Option<Value> {
    let (seg, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Some(value.clone()),
    };
    match value {
        Value::Object(map) => walk(map.get(*seg)?, rest),
        Value::Array(items) => {
            // A numeric segment indexes; anything else maps the remaining
            // path over the elements, flattening one level.
            if let Ok(idx) = seg.parse::<usize>() {
                return walk(items.get(idx)?, rest);
            }
            let mut out = Vec::new();
            for item in items {
                if let Some(found) = walk(item, segments) {
                    match found {
                        Value::Array(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
            }
            Some(Value::Array(out))
        }
        _ => None,
    }
}

/// Set a value at a dotted path, creating intermediate objects. A
/// non-object intermediate is replaced.
pub fn set(doc: &mut Document, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = &mut doc.fields;
    for seg in &segments[..segments.len() - 1] {
        let entry = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !matches!(entry, Value::Object(_)) {
            *entry = Value::Object(Default::default());
        }
        match entry {
            Value::Object(map) => current = map,
            _ => unreachable!(),
        }
    }
    current.insert(segments[segments.len() - 1].to_string(), value);
}

/// Remove the value at a dotted path. Returns true when something was
/// actually removed.
pub fn remove(doc: &mut Document, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    remove_in(&mut doc.fields, &segments)
}

fn remove_in(map: &mut std::collections::BTreeMap<String, Value>, segments: &[&str]) -> bool {
    match segments {
        [] => false,
        [last] => map.remove(*last).is_some(),
        [first, rest @ ..] => match map.get_mut(*first) {
            Some(Value::Object(inner)) => remove_in(inner, rest),
            _ => false,
        },
    }
}

/// Copy the value at `path` from `src` into `dst`, preserving the nested
/// shape. Used by inclusion projections.
pub fn copy_into(dst: &mut Document, src: &Document, path: &str) {
    if let Some(value) = resolve(src, path) {
        set(dst, path, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    #[test]
    fn test_simple_and_nested() {
        let d = doc(r#"{"a": 1, "b": {"c": {"d": "x"}}}"#);
        assert_eq!(resolve(&d, "a"), Some(Value::Int(1)));
        assert_eq!(resolve(&d, "b.c.d"), Some(Value::Str("x".to_string())));
        assert_eq!(resolve(&d, "b.z"), None);
        assert_eq!(resolve(&d, "missing"), None);
    }

    #[test]
    fn test_array_index_segment() {
        let d = doc(r#"{"a": [10, 20, 30]}"#);
        assert_eq!(resolve(&d, "a.1"), Some(Value::Int(20)));
        assert_eq!(resolve(&d, "a.9"), None);
    }

    #[test]
    fn test_array_mapping_flattens_one_level() {
        let d = doc(r#"{"a": [{"b": [1, 2]}, {"b": 3}, {"c": 4}]}"#);
        assert_eq!(
            resolve(&d, "a.b"),
            Some(Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );
    }

    #[test]
    fn test_set_and_remove() {
        let mut d = doc(r#"{"a": 1}"#);
        set(&mut d, "b.c", Value::Int(7));
        assert_eq!(resolve(&d, "b.c"), Some(Value::Int(7)));
        assert!(remove(&mut d, "b.c"));
        assert!(!remove(&mut d, "b.c"));
        assert_eq!(resolve(&d, "b"), Some(Value::Object(Default::default())));
    }

    #[test]
    fn test_copy_into_preserves_shape() {
        let src = doc(r#"{"a": {"b": 2, "c": 3}}"#);
        let mut dst = Document::new();
        copy_into(&mut dst, &src, "a.b");
        assert_eq!(dst, doc(r#"{"a": {"b": 2}}"#));
    }
}
