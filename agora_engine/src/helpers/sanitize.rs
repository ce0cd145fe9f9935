//! HTML sanitisation for user-supplied text.
//!
//! Free-text fields (memos, reviews, dispute claims, shipping notes) end up in public files and notifications, so
//! they are cleaned before a local node signs or publishes them. The pass runs once over a decoded JSON tree so that
//! every string, however deeply nested, is treated the same way. Object keys are left alone.
use std::collections::HashSet;

use ammonia::Builder;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

const ALLOWED_URL_SCHEMES: [&str; 6] = ["http", "https", "mailto", "ipfs", "ipns", "magnet"];

pub fn sanitize_text(text: &str) -> String {
    let schemes = ALLOWED_URL_SCHEMES.iter().copied().collect::<HashSet<_>>();
    Builder::default().url_schemes(schemes).clean(text).to_string()
}

pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            let clean = sanitize_text(s);
            if clean != *s {
                *s = clean;
            }
        },
        Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        Value::Object(map) => map.values_mut().for_each(sanitize_value),
        Value::Null | Value::Bool(_) | Value::Number(_) => {},
    }
}

/// Round-trips `item` through a JSON tree, cleaning every string on the way.
pub fn sanitize<T: Serialize + DeserializeOwned>(item: &T) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(item)?;
    sanitize_value(&mut value);
    serde_json::from_value(value)
}

#[cfg(test)]
mod test {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[test]
    fn strips_scripts_and_bad_links() {
        assert_eq!(sanitize_text("hello <script>alert(1)</script>world"), "hello world");
        let clean = sanitize_text(r#"<a href="javascript:alert(1)">x</a>"#);
        assert!(!clean.contains("javascript"));
        let clean = sanitize_text(r#"<a href="ipfs://QmHash">x</a>"#);
        assert!(clean.contains("ipfs://QmHash"));
        assert_eq!(sanitize_text("Great product"), "Great product");
    }

    #[test]
    fn cleans_nested_values() {
        let mut v = json!({
            "memo": "<img src=x onerror=alert(1)>",
            "items": [{"note": "<b>ok</b><script>x</script>"}],
            "<keys>": 12
        });
        sanitize_value(&mut v);
        assert_eq!(v["memo"], json!("<img src=\"x\">"));
        assert_eq!(v["items"][0]["note"], json!("<b>ok</b>"));
        assert_eq!(v["<keys>"], json!(12));
    }

    #[test]
    fn typed_round_trip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Review {
            text: String,
            stars: u8,
        }
        let r = Review { text: "<script>boo</script>nice".into(), stars: 5 };
        assert_eq!(sanitize(&r).unwrap(), Review { text: "nice".into(), stars: 5 });
    }
}
