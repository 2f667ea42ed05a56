//! Conversion of run parameters to the engine's snake_case idiom.

use serde_json::{Map, Value};

/// Convert a camelCase or PascalCase identifier to snake_case.
///
/// Runs of uppercase letters are treated as acronyms: `apiURL` becomes
/// `api_url`, not `api_u_r_l`. Keys that already contain underscores or are
/// fully lowercase pass through untouched.
pub fn to_snake(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && chars[i - 1].is_lowercase();
            let next_lower = i + 1 < chars.len() && chars[i + 1].is_lowercase();
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

/// Recursively convert all map keys to snake_case, descending through nested
/// maps and arrays. Values are left alone.
pub fn map_to_snake(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (to_snake(k), value_to_snake(v)))
        .collect()
}

fn value_to_snake(value: &Value) -> Value {
    match value {
        Value::Object(m) => Value::Object(map_to_snake(m)),
        Value::Array(a) => Value::Array(a.iter().map(value_to_snake).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snake_cases_identifiers() {
        assert_eq!(to_snake("replicaCount"), "replica_count");
        assert_eq!(to_snake("CamelCaseKey"), "camel_case_key");
        assert_eq!(to_snake("apiURL"), "api_url");
        assert_eq!(to_snake("HTTPServer"), "http_server");
        assert_eq!(to_snake("already_snake"), "already_snake");
        assert_eq!(to_snake("lowercase"), "lowercase");
    }

    #[test]
    fn converts_nested_keys() {
        let input = json!({
            "camelCaseKey": {"innerValue": 1, "deepList": [{"leafKey": true}]},
            "meta": {"namespace": "ns", "name": "foo1"},
        });
        let expected = json!({
            "camel_case_key": {"inner_value": 1, "deep_list": [{"leaf_key": true}]},
            "meta": {"namespace": "ns", "name": "foo1"},
        });
        let got = map_to_snake(input.as_object().unwrap());
        assert_eq!(Value::Object(got), expected);
    }

    #[test]
    fn synthetic_keys_pass_through() {
        let input = json!({"_app_example_com_database": {"specValue": 2}});
        let got = map_to_snake(input.as_object().unwrap());
        let inner = got["_app_example_com_database"].as_object().unwrap();
        assert!(inner.contains_key("spec_value"));
    }
}
