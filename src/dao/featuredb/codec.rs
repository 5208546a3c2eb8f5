//! Record value encodings of FeatureDB.
//!
//! A value starts with a protocol byte and a null-flag version byte. `F1`
//! values hold, for each field in schema order, a null flag followed (when
//! not null) by the little-endian encoded data. Anything else is decoded as
//! the older layout where field values are joined by the record separator
//! byte `0x1E`.

use std::collections::{BTreeMap, HashSet};

use chrono::{TimeZone, Utc};

use crate::{
    error::{FeatureStoreError, Result},
    feature::{FeatureViewField, FieldType, MapKey, ScalarType},
    FeatureValue, Row,
};

pub const PROTOCOL_VERSION_F: u8 = b'F';
pub const IF_NULL_FLAG_VERSION_1: u8 = b'1';
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Splits a response body into its frames: a u32 little-endian length, then
/// that many bytes of flatbuffer.
pub fn split_frames(body: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut cursor = ByteCursor::new(body);
    while !cursor.is_empty() {
        let len = cursor.read_u32()? as usize;
        frames.push(cursor.read_bytes(len)?);
    }
    Ok(frames)
}

/// Decodes one record value. `None` when the key has no data.
pub fn decode_record(
    value: &[u8],
    fields: &[FeatureViewField],
    selected: &HashSet<&str>,
) -> Result<Option<Row>> {
    if value.len() < 2 {
        return Ok(None);
    }
    if value[0] == PROTOCOL_VERSION_F && value[1] == IF_NULL_FLAG_VERSION_1 {
        decode_f1(&value[2..], fields, selected).map(Some)
    } else {
        Ok(Some(decode_separated(value, fields, selected)))
    }
}

fn decode_f1(data: &[u8], fields: &[FeatureViewField], selected: &HashSet<&str>) -> Result<Row> {
    let mut cursor = ByteCursor::new(data);
    let mut properties = Row::new();
    for field in fields {
        // Fields appended to the schema after the value was written.
        let Some(is_null) = cursor.try_read_u8() else {
            break;
        };
        if is_null == 1 {
            continue;
        }
        if selected.contains(field.name.as_str()) {
            let value = cursor.read_value(field.field_type)?;
            properties.insert(field.name.clone(), value);
        } else {
            cursor.skip_value(field.field_type)?;
        }
    }
    Ok(properties)
}

/// Older layout: the n-th separated chunk belongs to the n-th field.
fn decode_separated(value: &[u8], fields: &[FeatureViewField], selected: &HashSet<&str>) -> Row {
    value
        .split(|b| *b == RECORD_SEPARATOR)
        .zip(fields)
        .filter(|(chunk, field)| !chunk.is_empty() && selected.contains(field.name.as_str()))
        .map(|(chunk, field)| (field.name.clone(), decode_fixed_width(chunk, field.field_type)))
        .collect()
}

fn decode_fixed_width(chunk: &[u8], field_type: FieldType) -> FeatureValue {
    let mut cursor = ByteCursor::new(chunk);
    let value = match field_type {
        FieldType::Int32 => cursor.read_i32().map(FeatureValue::Int32),
        FieldType::Int64 => cursor.read_i64().map(FeatureValue::Int64),
        FieldType::Float => cursor.read_f32().map(FeatureValue::Float),
        FieldType::Double => cursor.read_f64().map(FeatureValue::Double),
        FieldType::Boolean => cursor.read_u8().map(|b| FeatureValue::Bool(b == 1)),
        _ => Err(FeatureStoreError::decode("variable width")),
    };
    value.unwrap_or_else(|_| FeatureValue::String(String::from_utf8_lossy(chunk).into_owned()))
}

/// Bounds-checked little-endian reader over a record value.
pub struct ByteCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

macro_rules! read_le {
    ($($name: ident, $slice: ident => $ty: ty),* $(,)?) => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                let bytes = self.read_bytes(std::mem::size_of::<$ty>())?;
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(buf))
            }

            pub fn $slice(&mut self, count: usize) -> Result<Vec<$ty>> {
                (0..count).map(|_| self.$name()).collect()
            }
        )*
    };
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                FeatureStoreError::decode(format!(
                    "unexpected end of data: need {n} bytes at offset {} of {}",
                    self.offset,
                    self.data.len()
                ))
            })?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn try_read_u8(&mut self) -> Option<u8> {
        let b = self.data.get(self.offset).copied()?;
        self.offset += 1;
        Some(b)
    }

    read_le!(
        read_u8, read_u8_slice => u8,
        read_u32, read_u32_slice => u32,
        read_i32, read_i32_slice => i32,
        read_i64, read_i64_slice => i64,
        read_f32, read_f32_slice => f32,
        read_f64, read_f64_slice => f64,
    );

    fn read_len(&mut self) -> Result<usize> {
        self.read_u32().map(|n| n as usize)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        Ok(String::from_utf8_lossy(self.read_bytes(len)?).into_owned())
    }

    /// `count + 1` u32 offsets into a blob of `offsets[count]` bytes.
    pub fn read_string_array(&mut self, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let offsets = self.read_u32_slice(count + 1)?;
        let blob = self.read_bytes(offsets[count] as usize)?;
        offsets
            .windows(2)
            .map(|w| {
                let (start, end) = (w[0] as usize, w[1] as usize);
                blob.get(start..end)
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .ok_or_else(|| {
                        FeatureStoreError::decode(format!("invalid string offsets {start}..{end}"))
                    })
            })
            .collect()
    }

    fn skip_string_array(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.skip(count * 4)?;
        let total = self.read_len()?;
        self.skip(total)
    }

    fn read_scalars(&mut self, ty: ScalarType, count: usize) -> Result<Vec<FeatureValue>> {
        Ok(match ty {
            ScalarType::Int32 => self.read_i32_slice(count)?.into_iter().map(FeatureValue::Int32).collect(),
            ScalarType::Int64 => self.read_i64_slice(count)?.into_iter().map(FeatureValue::Int64).collect(),
            ScalarType::Float => self.read_f32_slice(count)?.into_iter().map(FeatureValue::Float).collect(),
            ScalarType::Double => self.read_f64_slice(count)?.into_iter().map(FeatureValue::Double).collect(),
            ScalarType::String => self
                .read_string_array(count)?
                .into_iter()
                .map(FeatureValue::String)
                .collect(),
        })
    }

    fn skip_scalars(&mut self, ty: ScalarType, count: usize) -> Result<()> {
        match ty {
            ScalarType::Int32 | ScalarType::Float => self.skip(count * 4),
            ScalarType::Int64 | ScalarType::Double => self.skip(count * 8),
            ScalarType::String => self.skip_string_array(count),
        }
    }

    pub fn read_value(&mut self, field_type: FieldType) -> Result<FeatureValue> {
        let value = match field_type {
            FieldType::Int32 => FeatureValue::Int32(self.read_i32()?),
            FieldType::Int64 => FeatureValue::Int64(self.read_i64()?),
            FieldType::Float => FeatureValue::Float(self.read_f32()?),
            FieldType::Double => FeatureValue::Double(self.read_f64()?),
            FieldType::Boolean => FeatureValue::Bool(self.read_u8()? == 1),
            FieldType::String => FeatureValue::String(self.read_string()?),
            FieldType::Timestamp => {
                let millis = self.read_i64()?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .map(FeatureValue::Timestamp)
                    .ok_or_else(|| FeatureStoreError::decode(format!("invalid timestamp {millis}")))?
            }
            FieldType::ArrayInt32 => {
                let n = self.read_len()?;
                FeatureValue::Int32Array(self.read_i32_slice(n)?)
            }
            FieldType::ArrayInt64 => {
                let n = self.read_len()?;
                FeatureValue::Int64Array(self.read_i64_slice(n)?)
            }
            FieldType::ArrayFloat => {
                let n = self.read_len()?;
                FeatureValue::FloatArray(self.read_f32_slice(n)?)
            }
            FieldType::ArrayDouble => {
                let n = self.read_len()?;
                FeatureValue::DoubleArray(self.read_f64_slice(n)?)
            }
            FieldType::ArrayString => {
                let n = self.read_len()?;
                FeatureValue::StringArray(self.read_string_array(n)?)
            }
            FieldType::ArrayArrayFloat => FeatureValue::FloatMatrix(self.read_float_matrix()?),
            map_type => {
                let Some((key_type, value_type)) = map_type.map_types() else {
                    return Err(FeatureStoreError::decode(format!(
                        "unsupported field type {map_type}"
                    )));
                };
                let n = self.read_len()?;
                let keys = self.read_scalars(key_type, n)?;
                let values = self.read_scalars(value_type, n)?;
                let map: BTreeMap<MapKey, FeatureValue> = keys
                    .into_iter()
                    .zip(values)
                    .filter_map(|(k, v)| key_type.map_key(k).map(|k| (k, v)))
                    .collect();
                FeatureValue::Map(map)
            }
        };
        Ok(value)
    }

    /// Outer length, then (if non-zero) the total element count, the inner
    /// lengths and all elements flattened.
    fn read_float_matrix(&mut self) -> Result<Vec<Vec<f32>>> {
        let outer = self.read_len()?;
        if outer == 0 {
            return Ok(Vec::new());
        }
        let total = self.read_len()?;
        if total == 0 {
            return Ok(vec![Vec::new(); outer]);
        }
        let inner_lens = self.read_u32_slice(outer)?;
        let elements = self.read_f32_slice(total)?;
        let mut matrix = Vec::with_capacity(outer);
        let mut start = 0usize;
        for len in inner_lens {
            let end = start + len as usize;
            let row = elements.get(start..end).ok_or_else(|| {
                FeatureStoreError::decode(format!("inner array {start}..{end} out of {total}"))
            })?;
            matrix.push(row.to_vec());
            start = end;
        }
        Ok(matrix)
    }

    pub fn skip_value(&mut self, field_type: FieldType) -> Result<()> {
        match field_type {
            FieldType::Int32 | FieldType::Float => self.skip(4),
            FieldType::Int64 | FieldType::Double | FieldType::Timestamp => self.skip(8),
            FieldType::Boolean => self.skip(1),
            FieldType::String => {
                let n = self.read_len()?;
                self.skip(n)
            }
            FieldType::ArrayArrayFloat => {
                let outer = self.read_len()?;
                if outer == 0 {
                    return Ok(());
                }
                let total = self.read_len()?;
                if total == 0 {
                    return Ok(());
                }
                self.skip(outer * 4 + total * 4)
            }
            other => {
                let n = self.read_len()?;
                if let Some(element) = other.array_element() {
                    self.skip_scalars(element, n)
                } else if let Some((key_type, value_type)) = other.map_types() {
                    self.skip_scalars(key_type, n)?;
                    self.skip_scalars(value_type, n)
                } else {
                    self.skip(n)
                }
            }
        }
    }
}
