use serde::{Deserialize, Serialize};
use std::{fmt::Debug, str::FromStr};
use strum::{Display, EnumString};

use crate::error::FeatureStoreError;

/// Semantic type of a feature view field. The numeric codes are the ones the
/// control plane sends on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(try_from = "i32", into = "i32")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Int32,
    Int64,
    Float,
    Double,
    String,
    Boolean,
    Timestamp,
    ArrayInt32,
    ArrayInt64,
    ArrayFloat,
    ArrayDouble,
    ArrayString,
    ArrayArrayFloat,
    MapInt32Int32,
    MapInt32Int64,
    MapInt32Float,
    MapInt32Double,
    MapInt32String,
    MapInt64Int32,
    MapInt64Int64,
    MapInt64Float,
    MapInt64Double,
    MapInt64String,
    MapStringInt32,
    MapStringInt64,
    MapStringFloat,
    MapStringDouble,
    MapStringString,
}

const ALL_TYPES: [FieldType; 28] = [
    FieldType::Int32,
    FieldType::Int64,
    FieldType::Float,
    FieldType::Double,
    FieldType::String,
    FieldType::Boolean,
    FieldType::Timestamp,
    FieldType::ArrayInt32,
    FieldType::ArrayInt64,
    FieldType::ArrayFloat,
    FieldType::ArrayDouble,
    FieldType::ArrayString,
    FieldType::ArrayArrayFloat,
    FieldType::MapInt32Int32,
    FieldType::MapInt32Int64,
    FieldType::MapInt32Float,
    FieldType::MapInt32Double,
    FieldType::MapInt32String,
    FieldType::MapInt64Int32,
    FieldType::MapInt64Int64,
    FieldType::MapInt64Float,
    FieldType::MapInt64Double,
    FieldType::MapInt64String,
    FieldType::MapStringInt32,
    FieldType::MapStringInt64,
    FieldType::MapStringFloat,
    FieldType::MapStringDouble,
    FieldType::MapStringString,
];

/// Scalar building block of the composite field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int32,
    Int64,
    Float,
    Double,
    String,
}

impl FieldType {
    pub fn code(self) -> i32 {
        ALL_TYPES
            .iter()
            .position(|t| *t == self)
            .map(|idx| idx as i32 + 1)
            .unwrap_or_default()
    }

    pub fn from_code(code: i32) -> Option<Self> {
        if code < 1 {
            return None;
        }
        ALL_TYPES.get(code as usize - 1).copied()
    }

    /// Key and value types of a map field.
    pub fn map_types(self) -> Option<(ScalarType, ScalarType)> {
        use ScalarType as S;
        let pair = match self {
            FieldType::MapInt32Int32 => (S::Int32, S::Int32),
            FieldType::MapInt32Int64 => (S::Int32, S::Int64),
            FieldType::MapInt32Float => (S::Int32, S::Float),
            FieldType::MapInt32Double => (S::Int32, S::Double),
            FieldType::MapInt32String => (S::Int32, S::String),
            FieldType::MapInt64Int32 => (S::Int64, S::Int32),
            FieldType::MapInt64Int64 => (S::Int64, S::Int64),
            FieldType::MapInt64Float => (S::Int64, S::Float),
            FieldType::MapInt64Double => (S::Int64, S::Double),
            FieldType::MapInt64String => (S::Int64, S::String),
            FieldType::MapStringInt32 => (S::String, S::Int32),
            FieldType::MapStringInt64 => (S::String, S::Int64),
            FieldType::MapStringFloat => (S::String, S::Float),
            FieldType::MapStringDouble => (S::String, S::Double),
            FieldType::MapStringString => (S::String, S::String),
            _ => return None,
        };
        Some(pair)
    }

    /// Element type of a flat array field.
    pub fn array_element(self) -> Option<ScalarType> {
        match self {
            FieldType::ArrayInt32 => Some(ScalarType::Int32),
            FieldType::ArrayInt64 => Some(ScalarType::Int64),
            FieldType::ArrayFloat => Some(ScalarType::Float),
            FieldType::ArrayDouble => Some(ScalarType::Double),
            FieldType::ArrayString => Some(ScalarType::String),
            _ => None,
        }
    }
}

impl TryFrom<i32> for FieldType {
    type Error = FeatureStoreError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        FieldType::from_code(code)
            .ok_or_else(|| FeatureStoreError::config(format!("unknown field type code {code}")))
    }
}

impl From<FieldType> for i32 {
    fn from(value: FieldType) -> Self {
        value.code()
    }
}

/// Parses either the numeric code or the upper-case type name.
pub fn parse_field_type(s: &str) -> Option<FieldType> {
    match s.trim().parse::<i32>() {
        Ok(code) => FieldType::from_code(code),
        Err(_) => FieldType::from_str(s.trim()).ok(),
    }
}

#[test]
fn test_field_type_codes() {
    assert_eq!(FieldType::Int32.code(), 1);
    assert_eq!(FieldType::Timestamp.code(), 7);
    assert_eq!(FieldType::ArrayArrayFloat.code(), 13);
    assert_eq!(FieldType::MapStringString.code(), 28);
    assert_eq!(FieldType::from_code(5), Some(FieldType::String));
    assert_eq!(FieldType::from_code(0), None);
    assert_eq!(FieldType::from_code(29), None);
    assert_eq!(parse_field_type("ARRAY_INT64"), Some(FieldType::ArrayInt64));
    assert_eq!(parse_field_type("2"), Some(FieldType::Int64));
    assert_eq!(FieldType::MapInt64Float.to_string(), "MAP_INT64_FLOAT");

    let ty: FieldType = serde_json::from_str("14").unwrap();
    assert_eq!(ty, FieldType::MapInt32Int32);
    assert_eq!(serde_json::to_string(&FieldType::Double).unwrap(), "4");
    assert!(serde_json::from_str::<FieldType>("99").is_err());
}
