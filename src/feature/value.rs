use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, collections::HashMap, fmt};

use super::{FieldType, ScalarType};

/// A row returned by a backend or assembled by the join engine, keyed by
/// field name. Schemas are declared at runtime, so rows stay untyped maps.
pub type Row = HashMap<String, FeatureValue>;

/// Key of a map-typed feature.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
pub enum MapKey {
    Int32(i32),
    Int64(i64),
    String(String),
}

/// Closed set of values a feature can take.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum FeatureValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    FloatMatrix(Vec<Vec<f32>>),
    Map(BTreeMap<MapKey, FeatureValue>),
}

impl FeatureValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }

    /// String form used to correlate keys across backends. `None` for null and
    /// empty values, which never take part in a join.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            FeatureValue::Null => None,
            FeatureValue::String(s) if s.is_empty() => None,
            other => Some(other.to_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Int32(v) => Some(*v as i64),
            FeatureValue::Int64(v) => Some(*v),
            FeatureValue::Float(v) => Some(*v as i64),
            FeatureValue::Double(v) => Some(*v as i64),
            FeatureValue::Bool(v) => Some(*v as i64),
            FeatureValue::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
                s.trim().parse::<f64>().ok().map(|f| f as i64)
            }),
            FeatureValue::Timestamp(t) => Some(t.timestamp()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Int32(v) => Some(*v as f64),
            FeatureValue::Int64(v) => Some(*v as f64),
            FeatureValue::Float(v) => Some(*v as f64),
            FeatureValue::Double(v) => Some(*v),
            FeatureValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interprets a textual value from a backend according to the declared
    /// field type. Unparseable input is kept as a string.
    pub fn parse_typed(raw: &str, field_type: FieldType) -> FeatureValue {
        let parsed = match field_type {
            FieldType::Int32 => raw.trim().parse::<i32>().ok().map(FeatureValue::Int32),
            FieldType::Int64 => raw.trim().parse::<i64>().ok().map(FeatureValue::Int64),
            FieldType::Float => raw.trim().parse::<f32>().ok().map(FeatureValue::Float),
            FieldType::Double => raw.trim().parse::<f64>().ok().map(FeatureValue::Double),
            FieldType::Boolean => match raw.trim() {
                "true" | "1" => Some(FeatureValue::Bool(true)),
                "false" | "0" => Some(FeatureValue::Bool(false)),
                _ => None,
            },
            FieldType::Timestamp => parse_timestamp(raw).map(FeatureValue::Timestamp),
            FieldType::ArrayString => Some(FeatureValue::StringArray(
                split_list(raw).map(str::to_string).collect(),
            )),
            FieldType::ArrayInt32 => split_list(raw)
                .map(|s| s.parse::<i32>().ok())
                .collect::<Option<Vec<_>>>()
                .map(FeatureValue::Int32Array),
            FieldType::ArrayInt64 => split_list(raw)
                .map(|s| s.parse::<i64>().ok())
                .collect::<Option<Vec<_>>>()
                .map(FeatureValue::Int64Array),
            FieldType::ArrayFloat => split_list(raw)
                .map(|s| s.parse::<f32>().ok())
                .collect::<Option<Vec<_>>>()
                .map(FeatureValue::FloatArray),
            FieldType::ArrayDouble => split_list(raw)
                .map(|s| s.parse::<f64>().ok())
                .collect::<Option<Vec<_>>>()
                .map(FeatureValue::DoubleArray),
            _ => None,
        };
        parsed.unwrap_or_else(|| FeatureValue::String(raw.to_string()))
    }

    /// Coerces a value into a number for graph responses, falling back to
    /// `default` when the value is not numeric.
    pub fn coerce_float(&self, default: f64) -> FeatureValue {
        FeatureValue::Double(self.as_f64().unwrap_or(default))
    }

    pub fn coerce_int(&self, default: i64) -> FeatureValue {
        FeatureValue::Int64(self.as_i64().unwrap_or(default))
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.trim_matches(|c: char| c == '[' || c == ']')
        .split(|c: char| c == ',' || c == ';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parses the timestamp encodings seen across backends: local wall-clock
/// `%Y-%m-%d %H:%M:%S`, RFC 3339 and unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return chrono::Local
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int32(v) => write!(f, "{v}"),
            MapKey::Int64(v) => write!(f, "{v}"),
            MapKey::String(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
        match self {
            FeatureValue::Null => Ok(()),
            FeatureValue::Bool(v) => write!(f, "{v}"),
            FeatureValue::Int32(v) => write!(f, "{v}"),
            FeatureValue::Int64(v) => write!(f, "{v}"),
            FeatureValue::Float(v) => write!(f, "{v}"),
            FeatureValue::Double(v) => write!(f, "{v}"),
            FeatureValue::String(v) => write!(f, "{v}"),
            FeatureValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
            FeatureValue::Int32Array(v) => write!(f, "[{}]", join(v)),
            FeatureValue::Int64Array(v) => write!(f, "[{}]", join(v)),
            FeatureValue::FloatArray(v) => write!(f, "[{}]", join(v)),
            FeatureValue::DoubleArray(v) => write!(f, "[{}]", join(v)),
            FeatureValue::StringArray(v) => write!(f, "[{}]", v.join(",")),
            FeatureValue::FloatMatrix(v) => {
                let inner = v
                    .iter()
                    .map(|row| format!("[{}]", join(row)))
                    .collect::<Vec<_>>();
                write!(f, "[{}]", inner.join(","))
            }
            FeatureValue::Map(m) => {
                let pairs = m
                    .iter()
                    .map(|(k, v)| format!("{k}:{v}"))
                    .collect::<Vec<_>>();
                write!(f, "{{{}}}", pairs.join(","))
            }
        }
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        FeatureValue::String(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        FeatureValue::String(value)
    }
}

impl From<i32> for FeatureValue {
    fn from(value: i32) -> Self {
        FeatureValue::Int32(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        FeatureValue::Int64(value)
    }
}

impl From<f32> for FeatureValue {
    fn from(value: f32) -> Self {
        FeatureValue::Float(value)
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        FeatureValue::Double(value)
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        FeatureValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FeatureValue {
    fn from(value: DateTime<Utc>) -> Self {
        FeatureValue::Timestamp(value)
    }
}

impl From<serde_json::Value> for FeatureValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FeatureValue::Null,
            Value::Bool(b) => FeatureValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FeatureValue::Int64(i),
                None => FeatureValue::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => FeatureValue::String(s),
            other => FeatureValue::String(other.to_string()),
        }
    }
}

impl ScalarType {
    pub(crate) fn map_key(self, value: FeatureValue) -> Option<MapKey> {
        match (self, value) {
            (ScalarType::Int32, FeatureValue::Int32(v)) => Some(MapKey::Int32(v)),
            (ScalarType::Int64, FeatureValue::Int64(v)) => Some(MapKey::Int64(v)),
            (ScalarType::String, FeatureValue::String(v)) => Some(MapKey::String(v)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_string_normalization() {
        assert_eq!(FeatureValue::from("u1").to_key_string(), Some("u1".into()));
        assert_eq!(FeatureValue::Int64(42).to_key_string(), Some("42".into()));
        assert_eq!(FeatureValue::Int32(42).to_key_string(), Some("42".into()));
        assert_eq!(FeatureValue::from("").to_key_string(), None);
        assert_eq!(FeatureValue::Null.to_key_string(), None);
    }

    #[test]
    fn test_parse_typed() {
        assert_eq!(
            FeatureValue::parse_typed("12", FieldType::Int64),
            FeatureValue::Int64(12)
        );
        assert_eq!(
            FeatureValue::parse_typed("1.5", FieldType::Double),
            FeatureValue::Double(1.5)
        );
        assert_eq!(
            FeatureValue::parse_typed("a,b", FieldType::ArrayString),
            FeatureValue::StringArray(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            FeatureValue::parse_typed("[1,2,3]", FieldType::ArrayInt32),
            FeatureValue::Int32Array(vec![1, 2, 3])
        );
        assert_eq!(
            FeatureValue::parse_typed("abc", FieldType::Int32),
            FeatureValue::String("abc".into())
        );
    }

    #[test]
    fn test_numeric_coercion_fallback() {
        assert_eq!(
            FeatureValue::from("oops").coerce_int(-1024),
            FeatureValue::Int64(-1024)
        );
        assert_eq!(
            FeatureValue::from("3.25").coerce_float(-1024.0),
            FeatureValue::Double(3.25)
        );
    }

    #[test]
    fn test_serialize_row() {
        let mut row = Row::new();
        row.insert("age".into(), FeatureValue::Int64(30));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json, serde_json::json!({"age": 30}));

        let mut map = BTreeMap::new();
        map.insert(MapKey::Int32(1), FeatureValue::Float(0.5));
        let json = serde_json::to_string(&FeatureValue::Map(map)).unwrap();
        assert_eq!(json, r#"{"1":0.5}"#);
    }
}
