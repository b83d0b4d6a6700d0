// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type casting of raw stored values by field schema.
//!
//! Storage hands values back loosely typed (numbers may come back as strings,
//! booleans as `0`/`1`). Casting normalises them to the JSON shape of the field
//! type and resolves text fields to the requested language.
use serde_json::{Map, Number, Value};

use crate::schema::{FieldSchema, FieldType};

/// Language selection for text fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lang<'a> {
    /// Requested language.
    pub requested: Option<&'a str>,
    /// Schema languages in fallback order.
    pub fallback: &'a [String],
}

/// Casts `value` to the shape of `field`. `None` means "no value".
pub fn cast(value: Value, field: &FieldSchema, lang: Lang<'_>) -> Option<Value> {
    if value.is_null() {
        return None;
    }
    match field.field_type {
        FieldType::Id
        | FieldType::Type
        | FieldType::String
        | FieldType::Url
        | FieldType::Digest
        | FieldType::Email
        | FieldType::Phone
        | FieldType::Reference => to_string(value),
        FieldType::Number | FieldType::Float => to_float(&value),
        FieldType::Int | FieldType::Timestamp => to_int(&value),
        FieldType::Boolean => to_bool(&value),
        FieldType::Text => text(value, lang),
        FieldType::Object => match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, raw) in map {
                    let casted = match field.properties.get(&key) {
                        Some(prop) => cast(raw, prop, lang),
                        None => Some(raw),
                    };
                    if let Some(v) = casted {
                        out.insert(key, v);
                    }
                }
                Some(Value::Object(out))
            }
            _ => None,
        },
        FieldType::Record => match value {
            Value::Object(map) => Some(Value::Object(
                map.into_iter()
                    .filter_map(|(k, v)| item(v, field, lang).map(|v| (k, v)))
                    .collect(),
            )),
            _ => None,
        },
        FieldType::Set | FieldType::Array | FieldType::References => match value {
            Value::Array(items) => Some(Value::Array(
                items.into_iter().filter_map(|v| item(v, field, lang)).collect(),
            )),
            other => item(other, field, lang).map(|v| Value::Array(vec![v])),
        },
        FieldType::Json => match value {
            Value::String(s) => serde_json::from_str(&s).ok().or(Some(Value::String(s))),
            other => Some(other),
        },
    }
}

/// `true` for values a `$field` fallback chain skips over.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn item(value: Value, field: &FieldSchema, lang: Lang<'_>) -> Option<Value> {
    match &field.items {
        Some(items) => cast(value, items, lang),
        None => Some(value),
    }
}

fn text(value: Value, lang: Lang<'_>) -> Option<Value> {
    let Value::Object(map) = value else {
        // A bare string is a text value without language information.
        return match value {
            Value::String(s) => Some(Value::String(s)),
            _ => None,
        };
    };
    let Some(requested) = lang.requested else {
        return Some(Value::Object(map));
    };
    let pick = |l: &str| match map.get(l) {
        Some(Value::String(s)) if !s.is_empty() => Some(Value::String(s.clone())),
        _ => None,
    };
    pick(requested).or_else(|| lang.fallback.iter().find_map(|l| pick(l)))
}

fn to_string(value: Value) -> Option<Value> {
    match value {
        Value::String(_) => Some(value),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(|n| normalise(&n)),
        Value::Bool(b) => Some(Value::from(u8::from(*b))),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_int(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Value::from)
            .or_else(|| n.as_f64().map(|f| Value::from(f.trunc() as i64))),
        Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
        Value::Bool(b) => Some(Value::from(i64::from(*b))),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::Number(n) => Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" | "" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

// Integral floats parsed from strings come back as integers so `"5"` and `5`
// hash identically.
#[allow(clippy::cast_possible_truncation)]
fn normalise(n: &Number) -> Value {
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
        _ => Value::Number(n.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn langs() -> Vec<String> {
        vec!["en".into(), "de".into()]
    }

    #[test]
    fn text_falls_back_through_languages() {
        let field = FieldSchema::of(FieldType::Text);
        let fallback = langs();
        let value = json!({ "de": "Hallo", "en": "" });
        let lang = Lang {
            requested: Some("nl"),
            fallback: &fallback,
        };
        assert_eq!(cast(value.clone(), &field, lang), Some(json!("Hallo")));

        let lang = Lang {
            requested: Some("en"),
            fallback: &[],
        };
        assert_eq!(cast(value.clone(), &field, lang), None);

        assert_eq!(cast(value.clone(), &field, Lang::default()), Some(value));
    }

    #[test]
    fn scalars_are_normalised() {
        assert_eq!(cast(json!("5"), &FieldSchema::of(FieldType::Number), Lang::default()), Some(json!(5)));
        assert_eq!(cast(json!("2.5"), &FieldSchema::of(FieldType::Float), Lang::default()), Some(json!(2.5)));
        assert_eq!(cast(json!(7.9), &FieldSchema::of(FieldType::Int), Lang::default()), Some(json!(7)));
        assert_eq!(cast(json!(1), &FieldSchema::of(FieldType::Boolean), Lang::default()), Some(json!(true)));
        assert_eq!(cast(json!(12), &FieldSchema::of(FieldType::String), Lang::default()), Some(json!("12")));
        assert_eq!(cast(json!(null), &FieldSchema::of(FieldType::String), Lang::default()), None);
    }

    #[test]
    fn objects_cast_their_properties() {
        let mut field = FieldSchema::of(FieldType::Object);
        field.properties.insert("n".into(), FieldSchema::of(FieldType::Int));
        field.properties.insert("t".into(), FieldSchema::of(FieldType::Text));
        let fallback = langs();
        let lang = Lang {
            requested: Some("de"),
            fallback: &fallback,
        };
        let out = cast(json!({ "n": "3", "t": { "en": "hi" }, "x": 1 }), &field, lang);
        assert_eq!(out, Some(json!({ "n": 3, "t": "hi", "x": 1 })));
    }

    #[test]
    fn sets_wrap_single_values() {
        let mut field = FieldSchema::of(FieldType::Set);
        field.items = Some(Box::new(FieldSchema::of(FieldType::Number)));
        assert_eq!(cast(json!("4"), &field, Lang::default()), Some(json!([4])));
        assert_eq!(cast(json!([1, "2"]), &field, Lang::default()), Some(json!([1, 2])));
    }

    #[test]
    fn empty_values() {
        assert!(is_empty(&json!("")));
        assert!(is_empty(&json!([])));
        assert!(!is_empty(&json!(0)));
        assert!(!is_empty(&json!(false)));
    }
}
