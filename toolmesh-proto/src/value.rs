//! Conversion between the wire value model and `serde_json::Value`
//!
//! Tool arguments and structured results travel as `google.protobuf.Value`
//! (null, string, number, bool, list, struct). Numbers on the wire are
//! always doubles; integral doubles inside the exactly-representable range
//! come back as JSON integers so `{"n": 3}` survives a round trip as `3`
//! rather than `3.0`.

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};
use serde_json::{Map, Number, Value as Json};

/// Largest integer magnitude a double represents exactly (2^53).
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Convert a JSON value to a wire value.
///
/// Numbers that cannot be expressed as a double fall back to their string
/// rendering instead of failing.
#[must_use]
pub fn to_value(json: &Json) -> Value {
    let kind = match json {
        Json::Null => Kind::NullValue(0),
        Json::Bool(b) => Kind::BoolValue(*b),
        Json::Number(n) => match n.as_f64() {
            Some(f) => Kind::NumberValue(f),
            None => Kind::StringValue(n.to_string()),
        },
        Json::String(s) => Kind::StringValue(s.clone()),
        Json::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(to_value).collect(),
        }),
        Json::Object(map) => Kind::StructValue(to_struct(map)),
    };
    Value { kind: Some(kind) }
}

/// Convert a JSON object to a wire struct.
#[must_use]
pub fn to_struct(map: &Map<String, Json>) -> Struct {
    Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), to_value(v)))
            .collect(),
    }
}

/// Convert a wire value to JSON.
///
/// Non-finite numbers have no JSON form and are rendered as strings.
#[must_use]
pub fn from_value(value: &Value) -> Json {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Json::Null,
        Some(Kind::BoolValue(b)) => Json::Bool(*b),
        Some(Kind::NumberValue(f)) => number_to_json(*f),
        Some(Kind::StringValue(s)) => Json::String(s.clone()),
        Some(Kind::ListValue(list)) => Json::Array(list.values.iter().map(from_value).collect()),
        Some(Kind::StructValue(s)) => Json::Object(from_struct(s)),
    }
}

/// Convert a wire struct to a JSON object.
#[must_use]
pub fn from_struct(s: &Struct) -> Map<String, Json> {
    s.fields
        .iter()
        .map(|(k, v)| (k.clone(), from_value(v)))
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(f: f64) -> Json {
    if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_INT {
        return Json::Number(Number::from(f as i64));
    }
    Number::from_f64(f).map_or_else(|| Json::String(f.to_string()), Json::Number)
}
