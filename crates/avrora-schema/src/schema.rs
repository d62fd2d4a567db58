//! Parsed Avro schemas and their canonical JSON form.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::{Fingerprint, SchemaError};

/// The name of a named schema (record, enum, fixed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub name: String,
    pub namespace: Option<String>,
    pub aliases: Vec<String>,
}

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            aliases: Vec::new(),
        }
    }

    /// The dotted full name; a `name` already containing dots wins over the
    /// declared namespace, per the Avro spec.
    pub fn fullname(&self) -> String {
        if self.name.contains('.') {
            self.name.clone()
        } else {
            match &self.namespace {
                Some(ns) if !ns.is_empty() => format!("{ns}.{}", self.name),
                _ => self.name.clone(),
            }
        }
    }

    fn parse(obj: &Map<String, Json>, enclosing_ns: Option<&str>) -> Result<Self, SchemaError> {
        let name = obj
            .get("name")
            .and_then(Json::as_str)
            .ok_or(SchemaError::MissingAttribute("name"))?
            .to_string();
        let namespace = obj
            .get("namespace")
            .and_then(Json::as_str)
            .map(str::to_string)
            .or_else(|| enclosing_ns.map(str::to_string));
        let aliases = obj
            .get("aliases")
            .and_then(Json::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name,
            namespace,
            aliases,
        })
    }
}

/// One field of a record schema. The default, when present, is kept as the
/// original JSON and converted lazily during resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Arc<Schema>,
    pub default: Option<Json>,
}

/// A parsed Avro schema. Recursive schemas and logical types are not
/// supported.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Fixed { name: Name, size: usize },
    Enum { name: Name, symbols: Vec<String> },
    Array(Arc<Schema>),
    Map(Arc<Schema>),
    Union(Vec<Arc<Schema>>),
    Record { name: Name, fields: Vec<Field> },
}

impl Schema {
    /// Parses a standalone schema document.
    pub fn parse_str(doc: &str) -> Result<Arc<Schema>, SchemaError> {
        let json: Json = serde_json::from_str(doc)?;
        let mut names = HashMap::new();
        Self::parse(&json, &mut names, None)
    }

    /// Parses a schema from its JSON form, registering named types into
    /// `names` so later declarations can reference them.
    pub fn parse(
        json: &Json,
        names: &mut HashMap<String, Arc<Schema>>,
        enclosing_ns: Option<&str>,
    ) -> Result<Arc<Schema>, SchemaError> {
        match json {
            Json::String(s) => Self::parse_name(s, names, enclosing_ns),
            Json::Array(branches) => {
                let parsed = branches
                    .iter()
                    .map(|b| Self::parse(b, names, enclosing_ns))
                    .collect::<Result<Vec<_>, _>>()?;
                if parsed.is_empty() {
                    return Err(SchemaError::InvalidSchema("empty union".to_string()));
                }
                Ok(Arc::new(Schema::Union(parsed)))
            }
            Json::Object(obj) => Self::parse_object(obj, names, enclosing_ns),
            other => Err(SchemaError::InvalidSchema(format!(
                "unexpected schema JSON: {other}"
            ))),
        }
    }

    fn parse_name(
        s: &str,
        names: &HashMap<String, Arc<Schema>>,
        enclosing_ns: Option<&str>,
    ) -> Result<Arc<Schema>, SchemaError> {
        let primitive = match s {
            "null" => Some(Schema::Null),
            "boolean" => Some(Schema::Boolean),
            "int" => Some(Schema::Int),
            "long" => Some(Schema::Long),
            "float" => Some(Schema::Float),
            "double" => Some(Schema::Double),
            "bytes" => Some(Schema::Bytes),
            "string" => Some(Schema::String),
            _ => None,
        };
        if let Some(p) = primitive {
            return Ok(Arc::new(p));
        }
        if let Some(found) = names.get(s) {
            return Ok(Arc::clone(found));
        }
        if !s.contains('.') {
            if let Some(ns) = enclosing_ns {
                if let Some(found) = names.get(&format!("{ns}.{s}")) {
                    return Ok(Arc::clone(found));
                }
            }
        }
        Err(SchemaError::UnknownType(s.to_string()))
    }

    fn parse_object(
        obj: &Map<String, Json>,
        names: &mut HashMap<String, Arc<Schema>>,
        enclosing_ns: Option<&str>,
    ) -> Result<Arc<Schema>, SchemaError> {
        let kind = obj
            .get("type")
            .and_then(Json::as_str)
            .ok_or(SchemaError::MissingAttribute("type"))?;
        match kind {
            "array" => {
                let items = obj
                    .get("items")
                    .ok_or(SchemaError::MissingAttribute("items"))?;
                Ok(Arc::new(Schema::Array(Self::parse(
                    items,
                    names,
                    enclosing_ns,
                )?)))
            }
            "map" => {
                let values = obj
                    .get("values")
                    .ok_or(SchemaError::MissingAttribute("values"))?;
                Ok(Arc::new(Schema::Map(Self::parse(
                    values,
                    names,
                    enclosing_ns,
                )?)))
            }
            "fixed" => {
                let name = Name::parse(obj, enclosing_ns)?;
                let size = obj
                    .get("size")
                    .and_then(Json::as_u64)
                    .ok_or(SchemaError::MissingAttribute("size"))?
                    as usize;
                let schema = Arc::new(Schema::Fixed { name, size });
                Self::register(&schema, names);
                Ok(schema)
            }
            "enum" => {
                let name = Name::parse(obj, enclosing_ns)?;
                let symbols = obj
                    .get("symbols")
                    .and_then(Json::as_array)
                    .ok_or(SchemaError::MissingAttribute("symbols"))?
                    .iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                let schema = Arc::new(Schema::Enum { name, symbols });
                Self::register(&schema, names);
                Ok(schema)
            }
            "record" | "error" => {
                let name = Name::parse(obj, enclosing_ns)?;
                let ns = name.namespace.clone();
                let fields_json = obj
                    .get("fields")
                    .and_then(Json::as_array)
                    .ok_or(SchemaError::MissingAttribute("fields"))?;
                let mut fields = Vec::with_capacity(fields_json.len());
                for f in fields_json {
                    let f = f
                        .as_object()
                        .ok_or_else(|| SchemaError::InvalidSchema("bad field".to_string()))?;
                    let field_name = f
                        .get("name")
                        .and_then(Json::as_str)
                        .ok_or(SchemaError::MissingAttribute("name"))?
                        .to_string();
                    let schema = Self::parse(
                        f.get("type").ok_or(SchemaError::MissingAttribute("type"))?,
                        names,
                        ns.as_deref(),
                    )?;
                    fields.push(Field {
                        name: field_name,
                        schema,
                        default: f.get("default").cloned(),
                    });
                }
                let schema = Arc::new(Schema::Record { name, fields });
                Self::register(&schema, names);
                Ok(schema)
            }
            // An object wrapping a primitive or a reference, e.g.
            // {"type": "string"}.
            other => Self::parse_name(other, names, enclosing_ns),
        }
    }

    fn register(schema: &Arc<Schema>, names: &mut HashMap<String, Arc<Schema>>) {
        if let Some(name) = schema.name() {
            names.insert(name.fullname(), Arc::clone(schema));
        }
    }

    /// The declared name, for named schemas.
    pub fn name(&self) -> Option<&Name> {
        match self {
            Schema::Fixed { name, .. } | Schema::Enum { name, .. } | Schema::Record { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }

    /// Short type description used in error messages and `Display`.
    pub fn type_name(&self) -> String {
        match self {
            Schema::Null => "null".to_string(),
            Schema::Boolean => "boolean".to_string(),
            Schema::Int => "int".to_string(),
            Schema::Long => "long".to_string(),
            Schema::Float => "float".to_string(),
            Schema::Double => "double".to_string(),
            Schema::Bytes => "bytes".to_string(),
            Schema::String => "string".to_string(),
            Schema::Array(_) => "array".to_string(),
            Schema::Map(_) => "map".to_string(),
            Schema::Union(_) => "union".to_string(),
            Schema::Fixed { name, .. } | Schema::Enum { name, .. } | Schema::Record { name, .. } => {
                name.fullname()
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Schema::Null)
    }

    pub fn union_branches(&self) -> Option<&[Arc<Schema>]> {
        match self {
            Schema::Union(branches) => Some(branches),
            _ => None,
        }
    }

    /// Canonical JSON form. Named types are emitted in full at their first
    /// occurrence (tracked in `seen`) and as a name string afterwards.
    /// Unlike Avro's parsing canonical form this keeps field defaults and
    /// aliases, since the same text doubles as the protocol text exchanged
    /// during handshakes.
    pub fn canonical_json(&self, seen: &mut HashSet<String>) -> Json {
        match self {
            Schema::Null
            | Schema::Boolean
            | Schema::Int
            | Schema::Long
            | Schema::Float
            | Schema::Double
            | Schema::Bytes
            | Schema::String => Json::String(self.type_name()),
            Schema::Array(items) => {
                let mut obj = Map::new();
                obj.insert("type".to_string(), Json::String("array".to_string()));
                obj.insert("items".to_string(), items.canonical_json(seen));
                Json::Object(obj)
            }
            Schema::Map(values) => {
                let mut obj = Map::new();
                obj.insert("type".to_string(), Json::String("map".to_string()));
                obj.insert("values".to_string(), values.canonical_json(seen));
                Json::Object(obj)
            }
            Schema::Union(branches) => Json::Array(
                branches
                    .iter()
                    .map(|b| b.canonical_json(seen))
                    .collect::<Vec<_>>(),
            ),
            Schema::Fixed { name, size } => self.canonical_named(name, seen, |obj| {
                obj.insert("type".to_string(), Json::String("fixed".to_string()));
                obj.insert("size".to_string(), Json::from(*size as u64));
            }),
            Schema::Enum { name, symbols } => self.canonical_named(name, seen, |obj| {
                obj.insert("type".to_string(), Json::String("enum".to_string()));
                obj.insert(
                    "symbols".to_string(),
                    Json::Array(symbols.iter().cloned().map(Json::String).collect()),
                );
            }),
            Schema::Record { name, fields } => {
                if seen.contains(&name.fullname()) {
                    return Json::String(name.fullname());
                }
                seen.insert(name.fullname());
                let mut obj = Map::new();
                obj.insert("name".to_string(), Json::String(name.fullname()));
                obj.insert("type".to_string(), Json::String("record".to_string()));
                let fields_json = fields
                    .iter()
                    .map(|f| {
                        let mut fobj = Map::new();
                        fobj.insert("name".to_string(), Json::String(f.name.clone()));
                        fobj.insert("type".to_string(), f.schema.canonical_json(seen));
                        if let Some(d) = &f.default {
                            fobj.insert("default".to_string(), d.clone());
                        }
                        Json::Object(fobj)
                    })
                    .collect::<Vec<_>>();
                obj.insert("fields".to_string(), Json::Array(fields_json));
                if !name.aliases.is_empty() {
                    obj.insert(
                        "aliases".to_string(),
                        Json::Array(name.aliases.iter().cloned().map(Json::String).collect()),
                    );
                }
                Json::Object(obj)
            }
        }
    }

    fn canonical_named(
        &self,
        name: &Name,
        seen: &mut HashSet<String>,
        fill: impl FnOnce(&mut Map<String, Json>),
    ) -> Json {
        if seen.contains(&name.fullname()) {
            return Json::String(name.fullname());
        }
        seen.insert(name.fullname());
        let mut obj = Map::new();
        obj.insert("name".to_string(), Json::String(name.fullname()));
        fill(&mut obj);
        if !name.aliases.is_empty() {
            obj.insert(
                "aliases".to_string(),
                Json::Array(name.aliases.iter().cloned().map(Json::String).collect()),
            );
        }
        Json::Object(obj)
    }

    /// Canonical form as a string.
    pub fn canonical_form(&self) -> String {
        self.canonical_json(&mut HashSet::new()).to_string()
    }

    /// MD5 fingerprint of the canonical form.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.canonical_form().as_bytes())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}
