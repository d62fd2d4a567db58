//! Dynamically typed Avro values and their binary codec.

use serde_json::Value as Json;

use crate::{cursor, Cursor, Schema, SchemaError};

/// A dynamically typed Avro value.
///
/// Maps and records keep their entries as ordered pairs; record field order
/// is semantic in Avro and map order is preserved so unrecognized entries
/// round-trip byte-identically.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    Fixed(Vec<u8>),
    Enum(String),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
    Record(Vec<(String, Value)>),
    /// A union value tagged with its branch index. Produced when decoding
    /// with `wrap_unions` enabled; accepted everywhere on encode.
    Union(usize, Box<Value>),
}

impl Value {
    /// Builds a record value from field pairs.
    pub fn record<S: Into<String>>(fields: Vec<(S, Value)>) -> Value {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Looks up a record field or map entry by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) | Value::Map(fields) => {
                fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts a JSON value (e.g. a record field default) into a value of
    /// the given schema. Per the Avro spec, a default for a union is
    /// interpreted against the first branch.
    pub fn from_json(json: &Json, schema: &Schema) -> Result<Value, SchemaError> {
        match (schema, json) {
            (Schema::Null, Json::Null) => Ok(Value::Null),
            (Schema::Boolean, Json::Bool(b)) => Ok(Value::Boolean(*b)),
            (Schema::Int, Json::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int)
                .ok_or_else(|| SchemaError::invalid_value(schema, "bad default")),
            (Schema::Long, Json::Number(n)) => n
                .as_i64()
                .map(Value::Long)
                .ok_or_else(|| SchemaError::invalid_value(schema, "bad default")),
            (Schema::Float, Json::Number(n)) => n
                .as_f64()
                .map(|v| Value::Float(v as f32))
                .ok_or_else(|| SchemaError::invalid_value(schema, "bad default")),
            (Schema::Double, Json::Number(n)) => n
                .as_f64()
                .map(Value::Double)
                .ok_or_else(|| SchemaError::invalid_value(schema, "bad default")),
            (Schema::String, Json::String(s)) => Ok(Value::String(s.clone())),
            (Schema::Bytes, Json::String(s)) => {
                // JSON defaults encode bytes as a latin-1 mapped string.
                Ok(Value::Bytes(s.chars().map(|c| c as u8).collect()))
            }
            (Schema::Fixed { .. }, Json::String(s)) => {
                Ok(Value::Fixed(s.chars().map(|c| c as u8).collect()))
            }
            (Schema::Enum { .. }, Json::String(s)) => Ok(Value::Enum(s.clone())),
            (Schema::Array(items), Json::Array(arr)) => Ok(Value::Array(
                arr.iter()
                    .map(|v| Value::from_json(v, items))
                    .collect::<Result<_, _>>()?,
            )),
            (Schema::Map(values), Json::Object(obj)) => Ok(Value::Map(
                obj.iter()
                    .map(|(k, v)| Ok((k.clone(), Value::from_json(v, values)?)))
                    .collect::<Result<_, SchemaError>>()?,
            )),
            (Schema::Record { fields, .. }, Json::Object(obj)) => {
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    let v = match obj.get(&f.name) {
                        Some(j) => Value::from_json(j, &f.schema)?,
                        None => match &f.default {
                            Some(d) => Value::from_json(d, &f.schema)?,
                            None => {
                                return Err(SchemaError::invalid_value(
                                    schema,
                                    format!("missing field {}", f.name),
                                ))
                            }
                        },
                    };
                    out.push((f.name.clone(), v));
                }
                Ok(Value::Record(out))
            }
            (Schema::Union(branches), json) => {
                let first = branches
                    .first()
                    .ok_or_else(|| SchemaError::invalid_value(schema, "empty union"))?;
                Ok(Value::Union(0, Box::new(Value::from_json(json, first)?)))
            }
            _ => Err(SchemaError::invalid_value(schema, "default does not match")),
        }
    }
}

/// Strips union wrappers recursively, for callers running unwrapped.
pub fn unwrap_unions(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => unwrap_unions(*inner),
        Value::Array(vs) => Value::Array(vs.into_iter().map(unwrap_unions).collect()),
        Value::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, unwrap_unions(v)))
                .collect(),
        ),
        Value::Record(entries) => Value::Record(
            entries
                .into_iter()
                .map(|(k, v)| (k, unwrap_unions(v)))
                .collect(),
        ),
        other => other,
    }
}

impl Schema {
    /// Checks a value against this schema without encoding it.
    pub fn is_valid(&self, value: &Value) -> bool {
        match (self, value) {
            (Schema::Null, Value::Null) => true,
            (Schema::Boolean, Value::Boolean(_)) => true,
            (Schema::Int, Value::Int(_)) => true,
            (Schema::Long, Value::Long(_)) => true,
            (Schema::Float, Value::Float(_)) => true,
            (Schema::Double, Value::Double(_)) => true,
            (Schema::Bytes, Value::Bytes(_)) => true,
            (Schema::String, Value::String(_)) => true,
            (Schema::Fixed { size, .. }, Value::Fixed(bytes)) => bytes.len() == *size,
            (Schema::Enum { symbols, .. }, Value::Enum(s)) => symbols.iter().any(|x| x == s),
            (Schema::Array(items), Value::Array(vs)) => vs.iter().all(|v| items.is_valid(v)),
            (Schema::Map(values), Value::Map(entries)) => {
                entries.iter().all(|(_, v)| values.is_valid(v))
            }
            (Schema::Record { fields, .. }, Value::Record(entries)) => {
                fields.len() == entries.len()
                    && fields
                        .iter()
                        .zip(entries)
                        .all(|(f, (k, v))| f.name == *k && f.schema.is_valid(v))
            }
            (Schema::Union(branches), Value::Union(index, inner)) => branches
                .get(*index)
                .map(|b| b.is_valid(inner))
                .unwrap_or(false),
            (Schema::Union(branches), other) => {
                branches.iter().any(|b| b.is_valid(other))
            }
            _ => false,
        }
    }

    /// Picks the union branch an unwrapped value encodes under.
    pub fn union_branch_for(&self, value: &Value) -> Option<usize> {
        self.union_branches()?
            .iter()
            .position(|b| b.is_valid(value))
    }

    /// Encodes a value under this schema, appending to `buf`.
    pub fn encode(&self, value: &Value, buf: &mut Vec<u8>) -> Result<(), SchemaError> {
        match (self, value) {
            (Schema::Null, Value::Null) => Ok(()),
            (Schema::Boolean, Value::Boolean(b)) => {
                cursor::write_boolean(buf, *b);
                Ok(())
            }
            (Schema::Int, Value::Int(v)) => {
                cursor::write_int(buf, *v);
                Ok(())
            }
            (Schema::Long, Value::Long(v)) => {
                cursor::write_long(buf, *v);
                Ok(())
            }
            (Schema::Float, Value::Float(v)) => {
                cursor::write_float(buf, *v);
                Ok(())
            }
            (Schema::Double, Value::Double(v)) => {
                cursor::write_double(buf, *v);
                Ok(())
            }
            (Schema::Bytes, Value::Bytes(v)) => {
                cursor::write_bytes(buf, v);
                Ok(())
            }
            (Schema::String, Value::String(v)) => {
                cursor::write_string(buf, v);
                Ok(())
            }
            (Schema::Fixed { size, .. }, Value::Fixed(bytes)) => {
                if bytes.len() != *size {
                    return Err(SchemaError::invalid_value(
                        self,
                        format!("expected {size} bytes, got {}", bytes.len()),
                    ));
                }
                buf.extend_from_slice(bytes);
                Ok(())
            }
            (Schema::Enum { symbols, .. }, Value::Enum(s)) => {
                let index = symbols.iter().position(|x| x == s).ok_or_else(|| {
                    SchemaError::invalid_value(self, format!("unknown symbol {s:?}"))
                })?;
                cursor::write_int(buf, index as i32);
                Ok(())
            }
            (Schema::Array(items), Value::Array(vs)) => {
                if !vs.is_empty() {
                    cursor::write_long(buf, vs.len() as i64);
                    for v in vs {
                        items.encode(v, buf)?;
                    }
                }
                cursor::write_long(buf, 0);
                Ok(())
            }
            (Schema::Map(values), Value::Map(entries)) => {
                if !entries.is_empty() {
                    cursor::write_long(buf, entries.len() as i64);
                    for (k, v) in entries {
                        cursor::write_string(buf, k);
                        values.encode(v, buf)?;
                    }
                }
                cursor::write_long(buf, 0);
                Ok(())
            }
            (Schema::Record { fields, .. }, Value::Record(entries)) => {
                for f in fields {
                    let v = entries
                        .iter()
                        .find(|(k, _)| *k == f.name)
                        .map(|(_, v)| v)
                        .ok_or_else(|| {
                            SchemaError::invalid_value(self, format!("missing field {}", f.name))
                        })?;
                    f.schema.encode(v, buf)?;
                }
                Ok(())
            }
            (Schema::Union(branches), Value::Union(index, inner)) => {
                let branch = branches.get(*index).ok_or_else(|| {
                    SchemaError::invalid_value(self, format!("no branch {index}"))
                })?;
                cursor::write_long(buf, *index as i64);
                branch.encode(inner, buf)
            }
            (Schema::Union(branches), other) => {
                let index = self.union_branch_for(other).ok_or_else(|| {
                    SchemaError::invalid_value(self, "no union branch matches value")
                })?;
                cursor::write_long(buf, index as i64);
                branches[index].encode(other, buf)
            }
            (schema, value) => Err(SchemaError::invalid_value(
                schema,
                format!("value {value:?} does not match"),
            )),
        }
    }

    /// Decodes a value of this schema from the cursor. With `wrap_unions`
    /// set, union values decode as [`Value::Union`]; otherwise the branch
    /// value is returned bare.
    pub fn decode(&self, cur: &mut Cursor<'_>, wrap_unions: bool) -> Result<Value, SchemaError> {
        match self {
            Schema::Null => Ok(Value::Null),
            Schema::Boolean => Ok(Value::Boolean(cur.read_boolean()?)),
            Schema::Int => Ok(Value::Int(cur.read_int()?)),
            Schema::Long => Ok(Value::Long(cur.read_long()?)),
            Schema::Float => Ok(Value::Float(cur.read_float()?)),
            Schema::Double => Ok(Value::Double(cur.read_double()?)),
            Schema::Bytes => Ok(Value::Bytes(cur.read_bytes()?.to_vec())),
            Schema::String => Ok(Value::String(cur.read_string()?)),
            Schema::Fixed { size, .. } => Ok(Value::Fixed(cur.read_fixed(*size)?.to_vec())),
            Schema::Enum { symbols, .. } => {
                let index = cur.read_int()?;
                let symbol = symbols
                    .get(index as usize)
                    .ok_or_else(|| SchemaError::invalid_value(self, format!("bad index {index}")))?;
                Ok(Value::Enum(symbol.clone()))
            }
            Schema::Array(items) => {
                let mut out = Vec::new();
                loop {
                    let mut count = cur.read_long()?;
                    if count == 0 {
                        break;
                    }
                    if count < 0 {
                        // Negative counts are followed by the block byte size.
                        cur.read_long()?;
                        count = -count;
                    }
                    for _ in 0..count {
                        out.push(items.decode(cur, wrap_unions)?);
                    }
                }
                Ok(Value::Array(out))
            }
            Schema::Map(values) => {
                let mut out = Vec::new();
                loop {
                    let mut count = cur.read_long()?;
                    if count == 0 {
                        break;
                    }
                    if count < 0 {
                        cur.read_long()?;
                        count = -count;
                    }
                    for _ in 0..count {
                        let key = cur.read_string()?;
                        out.push((key, values.decode(cur, wrap_unions)?));
                    }
                }
                Ok(Value::Map(out))
            }
            Schema::Record { fields, .. } => {
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    out.push((f.name.clone(), f.schema.decode(cur, wrap_unions)?));
                }
                Ok(Value::Record(out))
            }
            Schema::Union(branches) => {
                let index = cur.read_long()?;
                let branch = branches.get(index as usize).ok_or_else(|| {
                    SchemaError::invalid_value(self, format!("bad branch {index}"))
                })?;
                let inner = branch.decode(cur, wrap_unions)?;
                if wrap_unions {
                    Ok(Value::Union(index as usize, Box::new(inner)))
                } else {
                    Ok(inner)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn roundtrip(schema: &Schema, value: &Value) -> Value {
        let mut buf = Vec::new();
        schema.encode(value, &mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        let decoded = schema.decode(&mut cur, false).unwrap();
        assert!(cur.is_empty(), "trailing bytes after decode");
        decoded
    }

    #[test]
    fn primitive_roundtrips() {
        assert_eq!(roundtrip(&Schema::Int, &Value::Int(-42)), Value::Int(-42));
        assert_eq!(
            roundtrip(&Schema::Long, &Value::Long(1 << 40)),
            Value::Long(1 << 40)
        );
        assert_eq!(
            roundtrip(&Schema::String, &Value::String("hey".into())),
            Value::String("hey".into())
        );
        assert_eq!(
            roundtrip(&Schema::Bytes, &Value::Bytes(vec![1, 2, 3])),
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn record_roundtrip() {
        let schema = Schema::parse_str(
            r#"{"type":"record","name":"P","fields":[{"name":"x","type":"int"},{"name":"y","type":"string"}]}"#,
        )
        .unwrap();
        let value = Value::record(vec![("x", Value::Int(7)), ("y", Value::String("ok".into()))]);
        assert_eq!(roundtrip(&schema, &value), value);
    }

    #[test]
    fn map_and_array_roundtrip() {
        let schema = Schema::Array(Arc::new(Schema::Int));
        let value = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(roundtrip(&schema, &value), value);

        let schema = Schema::Map(Arc::new(Schema::Bytes));
        let value = Value::Map(vec![("k".into(), Value::Bytes(vec![9]))]);
        assert_eq!(roundtrip(&schema, &value), value);
    }

    #[test]
    fn union_encoding_infers_branch() {
        let schema = Schema::Union(vec![Arc::new(Schema::Null), Arc::new(Schema::String)]);
        let mut buf = Vec::new();
        schema.encode(&Value::String("s".into()), &mut buf).unwrap();
        // branch index 1, then the string
        assert_eq!(buf[0], 0x02);

        let mut cur = Cursor::new(&buf);
        assert_eq!(
            schema.decode(&mut cur, true).unwrap(),
            Value::Union(1, Box::new(Value::String("s".into())))
        );
    }

    #[test]
    fn type_mismatch_names_the_schema() {
        let mut buf = Vec::new();
        let err = Schema::Int
            .encode(&Value::String("hi".into()), &mut buf)
            .unwrap_err();
        assert!(err.to_string().contains("invalid \"int\""), "{err}");
    }

    #[test]
    fn enum_roundtrip_and_unknown_symbol() {
        let schema =
            Schema::parse_str(r#"{"type":"enum","name":"E","symbols":["A","B"]}"#).unwrap();
        assert_eq!(
            roundtrip(&schema, &Value::Enum("B".into())),
            Value::Enum("B".into())
        );
        let mut buf = Vec::new();
        assert!(schema.encode(&Value::Enum("C".into()), &mut buf).is_err());
    }

    #[test]
    fn validity_checks() {
        let schema = Schema::Union(vec![Arc::new(Schema::Null), Arc::new(Schema::Int)]);
        assert!(schema.is_valid(&Value::Null));
        assert!(schema.is_valid(&Value::Int(3)));
        assert!(schema.is_valid(&Value::Union(1, Box::new(Value::Int(3)))));
        assert!(!schema.is_valid(&Value::String("no".into())));
        assert!(!schema.is_valid(&Value::Union(0, Box::new(Value::Int(3)))));
    }

    #[test]
    fn defaults_from_json() {
        let schema = Schema::parse_str(
            r#"{"type":"record","name":"D","fields":[{"name":"n","type":"int","default":5}]}"#,
        )
        .unwrap();
        let v = Value::from_json(&serde_json::json!({}), &schema).unwrap();
        assert_eq!(v, Value::record(vec![("n", Value::Int(5))]));
    }
}
