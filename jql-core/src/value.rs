use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An ordered column-name to value mapping: one returned row or one write payload.
pub type Record = IndexMap<String, Value>;

/// A pointer to a value produced by an earlier transaction step, written `$alias.field` in JQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// The `as` alias of the earlier step.
    pub alias: String,
    /// `id`, `affected`, `count`, or a column of the step's first returned row.
    pub field: String,
}

impl Reference {
    pub fn new(alias: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            field: field.into(),
        }
    }

    /// Parses `$alias.field`. Anything else (including `$5.00`) is not a reference.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix('$')?;
        let (alias, field) = rest.split_once('.')?;
        if !is_identifier(alias) || !is_identifier(field) {
            return None;
        }
        Some(Self::new(alias, field))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{}", self.alias, self.field)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The closed set of values a JQL document can carry and a row can return.
///
/// Every compilation site matches on this exhaustively. Parsed JSON strings are always
/// `Text`; `Ref` is only built in code, and transaction steps also read `"$alias.field"`
/// text as a reference before binding.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Driver-native timestamps; serialised as RFC 3339 text.
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Object(Record),
    Ref(Reference),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Record> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Finds the first unresolved reference anywhere inside this value.
    pub fn find_ref(&self) -> Option<&Reference> {
        match self {
            Value::Ref(r) => Some(r),
            Value::Array(items) => items.iter().find_map(Value::find_ref),
            Value::Object(map) => map.values().find_map(Value::find_ref),
            _ => None,
        }
    }

    /// Key used to pair rows across relation queries. `Int(1)` and `Text("1")` match.
    pub(crate) fn match_key(&self) -> Option<String> {
        match self {
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) if v.fract() == 0.0 => Some((*v as i64).to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Timestamp(t) => Some(t.to_rfc3339()),
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Ref(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Ref(r) => serde_json::Value::String(r.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Ref(r) => write!(f, "{}", r),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Timestamp(t) => serializer.serialize_str(&t.to_rfc3339()),
            Value::Array(items) => items.serialize(serializer),
            Value::Object(map) => map.serialize(serializer),
            Value::Ref(r) => serializer.serialize_str(&r.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Value::Ref(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_parse_accepts_alias_dot_field() {
        let r = Reference::parse("$user.id").unwrap();
        assert_eq!(r.alias, "user");
        assert_eq!(r.field, "id");
        assert_eq!(r.to_string(), "$user.id");
    }

    #[test]
    fn reference_parse_rejects_prices_and_plain_text() {
        assert!(Reference::parse("$5.00").is_none());
        assert!(Reference::parse("user.id").is_none());
        assert!(Reference::parse("$user").is_none());
        assert!(Reference::parse("$user.").is_none());
        assert!(Reference::parse("$us er.id").is_none());
    }

    #[test]
    fn json_strings_stay_text_even_when_shaped_like_a_reference() {
        let v: Value = serde_json::from_str(r#"["$order.id", "$9.99", "plain"]"#).unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(items[0], Value::Text("$order.id".into()));
        assert_eq!(items[1], Value::Text("$9.99".into()));
        assert_eq!(items[2], Value::Text("plain".into()));
        assert!(v.find_ref().is_none());
    }

    #[test]
    fn objects_keep_document_order() {
        let v: Value = serde_json::from_str(r#"{"zeta": 1, "alpha": 2, "mid": 3}"#).unwrap();
        let keys: Vec<_> = v.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn numbers_split_into_int_and_float() {
        let v: Value = serde_json::from_str("[18, 2.5, -3]").unwrap();
        assert_eq!(
            v,
            Value::Array(vec![Value::Int(18), Value::Float(2.5), Value::Int(-3)])
        );
    }

    #[test]
    fn find_ref_walks_nested_values() {
        let mut payload = Record::new();
        payload.insert("name".into(), Value::from("x"));
        payload.insert(
            "tags".into(),
            Value::Array(vec![Value::Ref(Reference::new("a", "id"))]),
        );
        let v = Value::Object(payload);
        assert_eq!(v.find_ref(), Some(&Reference::new("a", "id")));
        assert!(Value::from(3).find_ref().is_none());
    }

    #[test]
    fn match_key_treats_int_and_numeric_text_alike() {
        assert_eq!(Value::Int(7).match_key(), Value::Text("7".into()).match_key());
        assert_eq!(Value::Float(7.0).match_key(), Some("7".into()));
        assert!(Value::Null.match_key().is_none());
    }

    #[test]
    fn serialize_round_trips_through_json_text() {
        let v = Value::Array(vec![Value::Null, Value::Bool(true), Value::Ref(Reference::new("a", "b"))]);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"[null,true,"$a.b"]"#);
    }
}
