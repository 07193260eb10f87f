//! Conversion between JSON documents and MessagePack values.
//!
//! Job metadata travels as MessagePack maps; envelopes are described with
//! serde/JSON. Only string map keys survive the trip.

use rmpv::Value;
use serde_json::{Map, Number, Value as JsonValue};

pub fn from_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::from(s.as_str()),
        JsonValue::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        JsonValue::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::from(k.as_str()), from_json(v)))
                .collect(),
        ),
    }
}

pub fn to_json(value: &Value) -> Result<JsonValue, String> {
    Ok(match value {
        Value::Nil => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Integer(i) => {
            if let Some(u) = i.as_u64() {
                JsonValue::from(u)
            } else if let Some(n) = i.as_i64() {
                JsonValue::from(n)
            } else {
                return Err(format!("integer {} out of range", i));
            }
        }
        Value::F32(f) => float(f64::from(*f))?,
        Value::F64(f) => float(*f)?,
        Value::String(s) => JsonValue::String(
            s.as_str()
                .ok_or_else(|| "string is not valid UTF-8".to_string())?
                .to_string(),
        ),
        Value::Binary(bytes) => JsonValue::String(
            String::from_utf8(bytes.clone()).map_err(|_| "binary value is not UTF-8".to_string())?,
        ),
        Value::Array(items) => {
            JsonValue::Array(items.iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = k
                    .as_str()
                    .ok_or_else(|| format!("map key {} is not a string", k))?;
                map.insert(key.to_string(), to_json(v)?);
            }
            JsonValue::Object(map)
        }
        Value::Ext(kind, _) => return Err(format!("extension type {} is not supported", kind)),
    })
}

fn float(f: f64) -> Result<JsonValue, String> {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .ok_or_else(|| format!("float {} has no JSON representation", f))
}
