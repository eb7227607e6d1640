//! JSON traversal and canonicalisation helpers.
//!
//! Provider and model identity is keyed on serialised JSON, so everything
//! that lands in an identifier column goes through [`canonical_string`].

use serde_json::Value;

/// Walks nested objects, returning `None` if any key is absent.
///
/// Only handles objects, no arrays.
pub fn safe_get<'a>(parent: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut current = parent;
    for key in keys {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Like [`safe_get`], but resolves to a non-empty string slice.
pub fn safe_str<'a>(parent: &'a Value, keys: &[&str]) -> Option<&'a str> {
    safe_get(parent, keys)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Serialises with object keys in lexical order, so equal values always
/// produce byte-equal strings.
///
/// serde_json's default `Map` is ordered, which makes this a plain
/// `to_string`; the function exists so call sites say what they mean.
pub fn canonical_string(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn safe_get_walks_nested_objects() {
        let v = json!({"message": {"content": "hi", "role": "assistant"}});
        assert_eq!(
            safe_get(&v, &["message", "content"]),
            Some(&json!("hi"))
        );
        assert_eq!(safe_get(&v, &["message", "images"]), None);
        assert_eq!(safe_get(&v, &["missing"]), None);
    }

    #[test]
    fn safe_str_rejects_empty_strings() {
        let v = json!({"response": ""});
        assert_eq!(safe_str(&v, &["response"]), None);
    }

    #[test]
    fn canonical_string_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":2,"b":1}"#);
    }
}
