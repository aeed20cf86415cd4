//! Cache fingerprints.

use crate::core::{Parameters, Row};
use sha2::{Digest, Sha256};

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Serializes JSON with object keys sorted, so equal documents hash equally
/// regardless of key order.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 of the canonical form of a JSON value, hex encoded.
#[must_use]
pub fn fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of a row set. Row order is significant.
#[must_use]
pub fn rows_fingerprint(rows: &[Row]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        let json = serde_json::Value::Object(
            row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        );
        hasher.update(canonical_json(&json).as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Cache key of one step: its kind, resolved config and the fingerprints of
/// the row sets it reads.
#[must_use]
pub fn step_cache_key(step_type: &str, config: &serde_json::Value, upstream: &[String]) -> String {
    let material = serde_json::json!({
        "type": step_type,
        "config": config,
        "upstream": upstream,
    });
    format!("uqm:step:{}", fingerprint(&material))
}

/// Cache key of a whole run: resolved document, parameters and pagination.
#[must_use]
pub fn pipeline_cache_key(
    document: &serde_json::Value,
    params: &Parameters,
    page: Option<u64>,
    page_size: Option<u64>,
) -> String {
    let params: serde_json::Map<String, serde_json::Value> =
        params.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    let material = serde_json::json!({
        "document": document,
        "parameters": params,
        "page": page,
        "page_size": page_size,
    });
    format!("uqm:pipeline:{}", fingerprint(&material))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{row_from_pairs, Value};
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
        assert_ne!(fingerprint(&a), fingerprint(&json!({"b": 2})));
    }

    #[test]
    fn test_step_key_depends_on_upstream() {
        let config = json!({"source": "a"});
        let up1 = rows_fingerprint(&[row_from_pairs([("v", Value::Int(1))])]);
        let up2 = rows_fingerprint(&[row_from_pairs([("v", Value::Int(2))])]);

        let k1 = step_cache_key("unpivot", &config, &[up1.clone()]);
        assert_eq!(k1, step_cache_key("unpivot", &config, &[up1]));
        assert_ne!(k1, step_cache_key("unpivot", &config, &[up2]));
        assert!(k1.starts_with("uqm:step:"));
    }

    #[test]
    fn test_pipeline_key_includes_pagination() {
        let doc = json!({"steps": []});
        let params = Parameters::new();
        assert_ne!(
            pipeline_cache_key(&doc, &params, Some(1), Some(10)),
            pipeline_cache_key(&doc, &params, Some(2), Some(10))
        );
    }
}
