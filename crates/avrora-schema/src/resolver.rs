//! Writer-to-reader schema resolution.
//!
//! A [`Resolver`] is constructed once per (writer, reader) pair; construction
//! fails if the schemas cannot be resolved. Decoding reads bytes under the
//! writer schema and adapts the value to the reader's shape: numeric
//! promotions, record field matching by name with defaults, enum re-mapping
//! by symbol, and union re-branching.

use std::sync::Arc;

use crate::{unwrap_unions, Cursor, Schema, SchemaError, Value};

#[derive(Debug)]
pub struct Resolver {
    writer: Arc<Schema>,
    reader: Arc<Schema>,
}

impl Resolver {
    /// Checks resolvability and builds the resolver.
    pub fn new(writer: Arc<Schema>, reader: Arc<Schema>) -> Result<Self, SchemaError> {
        check(&writer, &reader)?;
        Ok(Self { writer, reader })
    }

    pub fn writer(&self) -> &Arc<Schema> {
        &self.writer
    }

    pub fn reader(&self) -> &Arc<Schema> {
        &self.reader
    }

    /// Decodes bytes written under the writer schema into a value shaped by
    /// the reader schema.
    pub fn decode(&self, cur: &mut Cursor<'_>, wrap_unions: bool) -> Result<Value, SchemaError> {
        // Decode wrapped so union branch indices survive into adaptation.
        let value = self.writer.decode(cur, true)?;
        let adapted = adapt(value, &self.writer, &self.reader)?;
        Ok(if wrap_unions {
            adapted
        } else {
            unwrap_unions(adapted)
        })
    }
}

/// Static resolvability check, mirroring [`adapt`].
fn check(writer: &Schema, reader: &Schema) -> Result<(), SchemaError> {
    use Schema::*;
    match (writer, reader) {
        (Null, Null)
        | (Boolean, Boolean)
        | (Int, Int)
        | (Long, Long)
        | (Float, Float)
        | (Double, Double)
        | (Bytes, Bytes)
        | (String, String) => Ok(()),
        // Promotions.
        (Int, Long) | (Int, Float) | (Int, Double) => Ok(()),
        (Long, Float) | (Long, Double) => Ok(()),
        (Float, Double) => Ok(()),
        (String, Bytes) | (Bytes, String) => Ok(()),
        (Fixed { name: wn, size: ws }, Fixed { name: rn, size: rs }) => {
            if ws == rs && names_match(wn, rn) {
                Ok(())
            } else {
                Err(SchemaError::incompatible(writer, reader))
            }
        }
        (Enum { name: wn, .. }, Enum { name: rn, .. }) => {
            // Symbol presence is checked per value at decode time.
            if names_match(wn, rn) {
                Ok(())
            } else {
                Err(SchemaError::incompatible(writer, reader))
            }
        }
        (Array(w), Array(r)) => check(w, r),
        (Map(w), Map(r)) => check(w, r),
        (Record { name: wn, fields: wf }, Record { name: rn, fields: rf }) => {
            if !names_match(wn, rn) {
                return Err(SchemaError::incompatible(writer, reader));
            }
            for rfield in rf {
                match wf.iter().find(|f| f.name == rfield.name) {
                    Some(wfield) => check(&wfield.schema, &rfield.schema)?,
                    None if rfield.default.is_some() => {}
                    None => {
                        return Err(SchemaError::Incompatible {
                            writer: writer.type_name(),
                            reader: format!("{} (no default for {})", reader.type_name(), rfield.name),
                        })
                    }
                }
            }
            Ok(())
        }
        (Union(wb), _) => {
            // Every writer branch must resolve into the reader.
            for b in wb {
                check(b, reader)?;
            }
            Ok(())
        }
        (_, Union(rb)) => {
            if rb.iter().any(|b| check(writer, b).is_ok()) {
                Ok(())
            } else {
                Err(SchemaError::incompatible(writer, reader))
            }
        }
        _ => Err(SchemaError::incompatible(writer, reader)),
    }
}

fn names_match(writer: &crate::Name, reader: &crate::Name) -> bool {
    let wf = writer.fullname();
    reader.fullname() == wf || reader.aliases.iter().any(|a| *a == wf || *a == writer.name)
}

/// Adapts a writer-shaped value (unions wrapped) to the reader schema.
fn adapt(value: Value, writer: &Schema, reader: &Schema) -> Result<Value, SchemaError> {
    use Schema::*;
    match (writer, reader) {
        (Union(wb), _) => {
            let (index, inner) = match value {
                Value::Union(i, v) => (i, *v),
                other => {
                    return Err(SchemaError::invalid_value(
                        writer,
                        format!("expected union value, got {other:?}"),
                    ))
                }
            };
            let branch = wb
                .get(index)
                .ok_or_else(|| SchemaError::invalid_value(writer, format!("no branch {index}")))?;
            adapt(inner, branch, reader)
        }
        (_, Union(rb)) => {
            let index = rb
                .iter()
                .position(|b| check(writer, b).is_ok())
                .ok_or_else(|| SchemaError::incompatible(writer, reader))?;
            let inner = adapt(value, writer, &rb[index])?;
            Ok(Value::Union(index, Box::new(inner)))
        }
        (Int, Long) => match value {
            Value::Int(v) => Ok(Value::Long(i64::from(v))),
            other => Ok(other),
        },
        (Int, Float) | (Long, Float) => match value {
            Value::Int(v) => Ok(Value::Float(v as f32)),
            Value::Long(v) => Ok(Value::Float(v as f32)),
            other => Ok(other),
        },
        (Int, Double) | (Long, Double) | (Float, Double) => match value {
            Value::Int(v) => Ok(Value::Double(f64::from(v))),
            Value::Long(v) => Ok(Value::Double(v as f64)),
            Value::Float(v) => Ok(Value::Double(f64::from(v))),
            other => Ok(other),
        },
        (String, Bytes) => match value {
            Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
            other => Ok(other),
        },
        (Bytes, String) => match value {
            Value::Bytes(b) => std::string::String::from_utf8(b)
                .map(Value::String)
                .map_err(|e| SchemaError::invalid_value(reader, e.to_string())),
            other => Ok(other),
        },
        (Enum { .. }, Enum { symbols: rs, name }) => match value {
            Value::Enum(s) => {
                if rs.iter().any(|x| *x == s) {
                    Ok(Value::Enum(s))
                } else {
                    Err(SchemaError::InvalidValue {
                        schema: name.fullname(),
                        reason: format!("unknown symbol {s:?}"),
                    })
                }
            }
            other => Ok(other),
        },
        (Array(w), Array(r)) => match value {
            Value::Array(vs) => Ok(Value::Array(
                vs.into_iter()
                    .map(|v| adapt(v, w, r))
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(other),
        },
        (Map(w), Map(r)) => match value {
            Value::Map(entries) => Ok(Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, adapt(v, w, r)?)))
                    .collect::<Result<_, SchemaError>>()?,
            )),
            other => Ok(other),
        },
        (Record { fields: wf, .. }, Record { fields: rf, .. }) => {
            let entries = match value {
                Value::Record(entries) => entries,
                other => {
                    return Err(SchemaError::invalid_value(
                        writer,
                        format!("expected record value, got {other:?}"),
                    ))
                }
            };
            let mut out = Vec::with_capacity(rf.len());
            for rfield in rf {
                match entries.iter().position(|(k, _)| *k == rfield.name) {
                    Some(i) => {
                        let wfield = wf
                            .iter()
                            .find(|f| f.name == rfield.name)
                            .ok_or_else(|| SchemaError::incompatible(writer, reader))?;
                        let v = entries[i].1.clone();
                        out.push((rfield.name.clone(), adapt(v, &wfield.schema, &rfield.schema)?));
                    }
                    None => {
                        let default = rfield.default.as_ref().ok_or_else(|| {
                            SchemaError::incompatible(writer, reader)
                        })?;
                        out.push((
                            rfield.name.clone(),
                            Value::from_json(default, &rfield.schema)?,
                        ));
                    }
                }
            }
            Ok(Value::Record(out))
        }
        // Identical primitive kinds.
        _ => Ok(value),
    }
}
