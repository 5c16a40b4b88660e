//! Flattening of OTLP attribute values into ClickHouse `Map(String, String)`.

use std::collections::BTreeMap;

use base64::Engine;
use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue};

pub const SERVICE_NAME: &str = "service.name";
pub const SCOPE_NAME: &str = "otel.scope.name";
pub const SCOPE_VERSION: &str = "otel.scope.version";

pub type AttributeMap = BTreeMap<String, String>;

pub fn attributes_to_map(attrs: &[KeyValue]) -> AttributeMap {
    attrs
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.as_ref().map(value_to_string).unwrap_or_default()))
        .collect()
}

/// Record attributes plus the non-empty instrumentation scope name/version.
pub fn attributes_with_scope(attrs: &[KeyValue], scope: Option<&InstrumentationScope>) -> AttributeMap {
    let mut res = attributes_to_map(attrs);
    if let Some(scope) = scope {
        if !scope.name.is_empty() {
            res.insert(SCOPE_NAME.to_string(), scope.name.clone());
        }
        if !scope.version.is_empty() {
            res.insert(SCOPE_VERSION.to_string(), scope.version.clone());
        }
    }
    res
}

pub fn value_to_string(value: &AnyValue) -> String {
    let Some(v) = &value.value else {
        return String::new();
    };
    match v {
        Value::StringValue(s) => s.clone(),
        Value::BoolValue(b) => b.to_string(),
        Value::IntValue(i) => i.to_string(),
        Value::DoubleValue(d) => format_double(*d),
        Value::BytesValue(b) => base64::engine::general_purpose::STANDARD.encode(b),
        Value::ArrayValue(arr) => {
            let items: Vec<String> = arr.values.iter().map(value_to_string).collect();
            serde_json::to_string(&items).unwrap_or_default()
        }
        Value::KvlistValue(kvs) => {
            let items: BTreeMap<&str, String> = kvs
                .values
                .iter()
                .map(|kv| (kv.key.as_str(), kv.value.as_ref().map(value_to_string).unwrap_or_default()))
                .collect();
            serde_json::to_string(&items).unwrap_or_default()
        }
    }
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_string()
    } else if d == f64::INFINITY {
        "+Inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        d.to_string()
    }
}

/// Value of the `service.name` resource attribute, empty if absent.
pub fn service_name(resource_attrs: &AttributeMap) -> String {
    resource_attrs.get(SERVICE_NAME).cloned().unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{ArrayValue, KeyValueList};
    use test_case::test_case;

    pub(crate) fn kv(key: &str, value: Value) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue { value: Some(value) }),
        }
    }

    #[test_case(Value::StringValue("GET".into()), "GET")]
    #[test_case(Value::BoolValue(true), "true")]
    #[test_case(Value::IntValue(-42), "-42")]
    #[test_case(Value::DoubleValue(0.25), "0.25")]
    #[test_case(Value::DoubleValue(f64::NAN), "NaN")]
    #[test_case(Value::DoubleValue(f64::INFINITY), "+Inf")]
    #[test_case(Value::DoubleValue(f64::NEG_INFINITY), "-Inf")]
    #[test_case(Value::BytesValue(vec![0xde, 0xad, 0xbe, 0xef]), "3q2+7w==")]
    fn test_scalar_values(value: Value, expected: &str) {
        assert_eq!(value_to_string(&AnyValue { value: Some(value) }), expected);
    }

    #[test]
    fn test_nested_values() {
        let arr = AnyValue {
            value: Some(Value::ArrayValue(ArrayValue {
                values: vec![
                    AnyValue {
                        value: Some(Value::StringValue("a".into())),
                    },
                    AnyValue {
                        value: Some(Value::IntValue(1)),
                    },
                ],
            })),
        };
        assert_eq!(value_to_string(&arr), r#"["a","1"]"#);

        let kvlist = AnyValue {
            value: Some(Value::KvlistValue(KeyValueList {
                values: vec![kv("b", Value::BoolValue(false)), kv("a", Value::StringValue("x".into()))],
            })),
        };
        assert_eq!(value_to_string(&kvlist), r#"{"a":"x","b":"false"}"#);
        assert_eq!(value_to_string(&AnyValue { value: None }), "");
    }

    #[test]
    fn test_scope_attributes() {
        let scope = InstrumentationScope {
            name: "io.opentelemetry.jdbc".into(),
            version: String::new(),
            ..Default::default()
        };
        let attrs = attributes_with_scope(&[kv("db.system", Value::StringValue("postgresql".into()))], Some(&scope));
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[SCOPE_NAME], "io.opentelemetry.jdbc");
        assert!(!attrs.contains_key(SCOPE_VERSION));
    }
}
