use serde_json::Value;

/// Checks that every key and value in `expected` is also in `actual`. Objects may carry extra keys; arrays must match
/// element for element. Returns a description of the first difference found.
pub fn json_mismatch(expected: &str, actual: &str) -> Option<String> {
    let expected = match serde_json::from_str::<Value>(expected) {
        Ok(v) => v,
        Err(e) => return Some(format!("expected value is not JSON. {e}")),
    };
    let actual = match serde_json::from_str::<Value>(actual) {
        Ok(v) => v,
        Err(e) => return Some(format!("actual value is not JSON. {e}")),
    };
    value_mismatch("$", &expected, &actual)
}

pub fn value_mismatch(path: &str, expected: &Value, actual: &Value) -> Option<String> {
    match (expected, actual) {
        (Value::Null, _) => None,
        (Value::Object(expected), Value::Object(actual)) => expected.iter().find_map(|(key, value)| {
            let path = format!("{path}.{key}");
            match actual.get(key) {
                Some(actual) => value_mismatch(&path, value, actual),
                None => Some(format!("{path} is missing")),
            }
        }),
        (Value::Array(expected), Value::Array(actual)) if expected.len() == actual.len() => expected
            .iter()
            .zip(actual)
            .enumerate()
            .find_map(|(i, (e, a))| value_mismatch(&format!("{path}[{i}]"), e, a)),
        (Value::Array(expected), Value::Array(actual)) => {
            Some(format!("{path} has {} elements, not {}", actual.len(), expected.len()))
        },
        (expected, actual) if expected == actual => None,
        (expected, actual) => Some(format!("{path} is {actual}, not {expected}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalars_and_nulls() {
        assert_eq!(json_mismatch("1", "1"), None);
        assert_eq!(json_mismatch("1", "2"), Some("$ is 2, not 1".to_string()));
        assert_eq!(json_mismatch("null", "true"), None);
        assert!(json_mismatch("{", "1").is_some());
    }

    #[test]
    fn objects_may_have_extra_keys() {
        let index = r#"{"oak-chair": {"count": 1, "average": 4.4, "ratings": ["ab12"]}, "stool": {"count": 3}}"#;
        assert_eq!(json_mismatch(r#"{"oak-chair": {"count": 1}}"#, index), None);
        assert_eq!(
            json_mismatch(r#"{"oak-chair": {"count": 2}}"#, index),
            Some("$.oak-chair.count is 1, not 2".to_string())
        );
        assert_eq!(json_mismatch(r#"{"table": {}}"#, index), Some("$.table is missing".to_string()));
    }

    #[test]
    fn arrays_match_exactly() {
        assert_eq!(json_mismatch("[1, 2]", "[1, 2]"), None);
        assert_eq!(json_mismatch("[1, 2]", "[1, 2, 3]"), Some("$ has 3 elements, not 2".to_string()));
        let nested = json_mismatch(r#"{"a": [1, {"b": 2}]}"#, r#"{"a": [1, {"b": 3}]}"#);
        assert_eq!(nested, Some("$.a[1].b is 3, not 2".to_string()));
    }
}
