//! Record values.
//!
//! A record is a MessagePack map from string keys to arbitrary values,
//! addressed by the string form of its key-field value. Records are stored
//! as raw MessagePack and never interpreted beyond the key field, so the
//! store enforces no schema.

use rmpv::Value;

use crate::store::StoreError;

/// Normalize a value for storage or the wire.
///
/// Map keys become strings, ext values are dropped (they have no meaning
/// outside the producing runtime), everything else passes through.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (Value::String(stringify_key(&k).into()), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Ext(..) => Value::Nil,
        other => other,
    }
}

fn stringify_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.as_str().unwrap_or_default().to_string(),
        other => other.to_string(),
    }
}

/// Coerce a scalar to the key-string form. Non-scalars have no key form.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => s.as_str().map(str::to_string),
        Value::Integer(i) => Some(i.to_string()),
        Value::F64(f) => Some(f.to_string()),
        Value::F32(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Look up a field in a record map.
pub fn get_field<'a>(record: &'a Value, field: &str) -> Option<&'a Value> {
    record.as_map().and_then(|pairs| {
        pairs
            .iter()
            .find(|(k, _)| k.as_str() == Some(field))
            .map(|(_, v)| v)
    })
}

/// Extract the primary key of a record under the table's declared key field.
pub fn record_key(record: &Value, key_field: &str) -> Result<String, StoreError> {
    get_field(record, key_field)
        .and_then(key_string)
        .ok_or_else(|| StoreError::MissingKey(key_field.to_string()))
}

/// Whether a record matches a pattern map.
///
/// Every pattern key must be present in the record with an equal value; a
/// scalar pattern value also matches membership in an array field. The empty
/// pattern matches every record.
pub fn matches(record: &Value, pattern: &Value) -> bool {
    let Some(wanted) = pattern.as_map() else {
        return false;
    };
    wanted.iter().all(|(key, want)| {
        let Some(field) = key.as_str().and_then(|k| get_field(record, k)) else {
            return false;
        };
        if field == want {
            return true;
        }
        match field {
            Value::Array(items) if !matches!(want, Value::Array(_)) => items.contains(want),
            _ => false,
        }
    })
}

pub fn encode(record: &Value) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, record)
        .map_err(|e| StoreError::Internal(format!("record encode: {e}")))?;
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Value, StoreError> {
    let mut cursor = bytes;
    rmpv::decode::read_value(&mut cursor)
        .map_err(|e| StoreError::Internal(format!("record decode: {e}")))
}

/// JSON → MessagePack, for callers that naturally hold JSON (fixtures, CLIs).
pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else if let Some(f) = n.as_f64() {
                Value::F64(f)
            } else {
                Value::Nil
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone().into()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(obj) => Value::Map(
            obj.iter()
                .map(|(k, v)| (Value::String(k.clone().into()), from_json(v)))
                .collect(),
        ),
    }
}

/// MessagePack → JSON, lossy on non-JSON types (binary becomes a string).
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil | Value::Ext(..) => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => i
            .as_i64()
            .map(serde_json::Value::from)
            .or_else(|| i.as_u64().map(serde_json::Value::from))
            .unwrap_or(serde_json::Value::Null),
        Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.as_str().unwrap_or_default().to_string()),
        Value::Binary(b) => serde_json::Value::String(String::from_utf8_lossy(b).to_string()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => serde_json::Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (stringify_key(k), to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: serde_json::Value) -> Value {
        from_json(&json)
    }

    #[test]
    fn key_extraction_and_coercion() {
        let r = record(serde_json::json!({"id": "u1", "n": 7}));
        assert_eq!(record_key(&r, "id").unwrap(), "u1");
        assert_eq!(record_key(&r, "n").unwrap(), "7");
        assert!(matches!(
            record_key(&r, "absent"),
            Err(StoreError::MissingKey(_))
        ));
        // Nested values have no key form.
        let r = record(serde_json::json!({"id": {"nested": true}}));
        assert!(record_key(&r, "id").is_err());
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let r = record(serde_json::json!({"id": "u1"}));
        assert!(matches(&r, &record(serde_json::json!({}))));
    }

    #[test]
    fn pattern_equality_and_missing_keys() {
        let r = record(serde_json::json!({"id": "u1", "name": "alice"}));
        assert!(matches(&r, &record(serde_json::json!({"name": "alice"}))));
        assert!(!matches(&r, &record(serde_json::json!({"name": "bob"}))));
        // Missing keys never match.
        assert!(!matches(&r, &record(serde_json::json!({"email": "a@b"}))));
    }

    #[test]
    fn scalar_pattern_matches_array_membership() {
        let r = record(serde_json::json!({"id": "u1", "tags": ["a", "b"]}));
        assert!(matches(&r, &record(serde_json::json!({"tags": "a"}))));
        assert!(!matches(&r, &record(serde_json::json!({"tags": "c"}))));
        // Array pattern against array field is plain equality.
        assert!(matches(&r, &record(serde_json::json!({"tags": ["a", "b"]}))));
        assert!(!matches(&r, &record(serde_json::json!({"tags": ["a"]}))));
    }

    #[test]
    fn normalize_stringifies_map_keys_and_drops_ext() {
        let v = Value::Map(vec![
            (Value::Integer(1.into()), Value::Ext(4, vec![1, 2])),
            (Value::String("k".into()), Value::Boolean(true)),
        ]);
        let n = normalize(v);
        let pairs = n.as_map().unwrap();
        assert_eq!(pairs[0].0.as_str(), Some("1"));
        assert_eq!(pairs[0].1, Value::Nil);
        assert_eq!(pairs[1].1, Value::Boolean(true));
    }

    #[test]
    fn codec_roundtrip() {
        let r = record(serde_json::json!({"id": "u1", "n": [1, 2, {"x": null}]}));
        let bytes = encode(&r).unwrap();
        assert_eq!(decode(&bytes).unwrap(), r);
    }
}
