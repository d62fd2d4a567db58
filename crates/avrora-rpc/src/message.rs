//! A single RPC endpoint: request record, response type, error union,
//! one-way flag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use avrora_schema::{Field, Name, Schema};

use crate::RpcError;

/// A message declared by a protocol.
///
/// The request type is a synthetic record over the declared request fields;
/// both peers derive the same record name from the message name, so request
/// resolution works across protocols. The error union always carries
/// `string` as branch 0 for system errors, followed by the declared error
/// types in order.
#[derive(Debug)]
pub struct Message {
    name: String,
    request: Arc<Schema>,
    response: Arc<Schema>,
    errors: Arc<Schema>,
    one_way: bool,
}

impl Message {
    pub(crate) fn parse(
        name: &str,
        json: &Json,
        names: &mut HashMap<String, Arc<Schema>>,
        namespace: Option<&str>,
    ) -> Result<Arc<Message>, RpcError> {
        let obj = json
            .as_object()
            .ok_or_else(|| RpcError::InvalidProtocol(format!("message {name} is not an object")))?;

        let fields_json = obj
            .get("request")
            .and_then(Json::as_array)
            .ok_or_else(|| RpcError::InvalidProtocol(format!("message {name} has no request")))?;
        let mut fields = Vec::with_capacity(fields_json.len());
        for f in fields_json {
            let fobj = f.as_object().ok_or_else(|| {
                RpcError::InvalidProtocol(format!("bad request field in message {name}"))
            })?;
            let field_name = fobj
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| {
                    RpcError::InvalidProtocol(format!("unnamed request field in message {name}"))
                })?
                .to_string();
            let schema = Schema::parse(
                fobj.get("type").ok_or_else(|| {
                    RpcError::InvalidProtocol(format!("untyped request field in message {name}"))
                })?,
                names,
                namespace,
            )?;
            fields.push(Field {
                name: field_name,
                schema,
                default: fobj.get("default").cloned(),
            });
        }
        let request = Arc::new(Schema::Record {
            name: Name::new(format!("{name}_request")),
            fields,
        });

        let response = Schema::parse(
            obj.get("response").ok_or_else(|| {
                RpcError::InvalidProtocol(format!("message {name} has no response"))
            })?,
            names,
            namespace,
        )?;

        let declared = obj
            .get("errors")
            .and_then(Json::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|e| Schema::parse(e, names, namespace))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let one_way = obj.get("one-way").and_then(Json::as_bool).unwrap_or(false);
        if one_way {
            if !response.is_null() {
                return Err(RpcError::InvalidProtocol(format!(
                    "one-way message {name} must have a null response"
                )));
            }
            if !declared.is_empty() {
                return Err(RpcError::InvalidProtocol(format!(
                    "one-way message {name} must not declare errors"
                )));
            }
        }

        let mut branches = Vec::with_capacity(1 + declared.len());
        branches.push(Arc::new(Schema::String));
        branches.extend(declared);
        let errors = Arc::new(Schema::Union(branches));

        Ok(Arc::new(Message {
            name: name.to_string(),
            request,
            response,
            errors,
            one_way,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The synthetic request record.
    pub fn request(&self) -> &Arc<Schema> {
        &self.request
    }

    pub fn response(&self) -> &Arc<Schema> {
        &self.response
    }

    /// The full error union, `string` first.
    pub fn errors(&self) -> &Arc<Schema> {
        &self.errors
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub(crate) fn canonical_json(&self, seen: &mut HashSet<String>) -> Json {
        let mut obj = Map::new();
        let request_fields = match self.request.as_ref() {
            Schema::Record { fields, .. } => fields
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
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        obj.insert("request".to_string(), Json::Array(request_fields));
        obj.insert("response".to_string(), self.response.canonical_json(seen));
        let declared = &self.errors.union_branches().unwrap_or_default()[1..];
        if !declared.is_empty() {
            obj.insert(
                "errors".to_string(),
                Json::Array(declared.iter().map(|e| e.canonical_json(seen)).collect()),
            );
        }
        if self.one_way {
            obj.insert("one-way".to_string(), Json::Bool(true));
        }
        Json::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str, doc: &str) -> Result<Arc<Message>, RpcError> {
        let json: Json = serde_json::from_str(doc).unwrap();
        Message::parse(name, &json, &mut HashMap::new(), None)
    }

    #[test]
    fn parses_two_way_message() {
        let msg = parse(
            "negate",
            r#"{"request":[{"name":"n","type":"int"}],"response":"long"}"#,
        )
        .unwrap();
        assert_eq!(msg.name(), "negate");
        assert!(!msg.is_one_way());
        assert_eq!(msg.response().type_name(), "long");
        // string is always the first error branch
        assert_eq!(msg.errors().union_branches().unwrap()[0].type_name(), "string");
    }

    #[test]
    fn declared_errors_follow_the_string_branch() {
        let msg = parse(
            "div",
            r#"{"request":[{"name":"n","type":"int"}],"response":"int",
               "errors":[{"type":"record","name":"DivError","fields":[{"name":"why","type":"string"}]}]}"#,
        )
        .unwrap();
        let branches = msg.errors().union_branches().unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[1].type_name(), "DivError");
    }

    #[test]
    fn one_way_requires_null_response() {
        let err = parse("beat", r#"{"request":[],"response":"int","one-way":true}"#).unwrap_err();
        assert!(err.to_string().contains("null response"), "{err}");

        let ok = parse("beat", r#"{"request":[],"response":"null","one-way":true}"#).unwrap();
        assert!(ok.is_one_way());
    }

    #[test]
    fn one_way_rejects_declared_errors() {
        let err = parse(
            "beat",
            r#"{"request":[],"response":"null","one-way":true,"errors":["string"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("errors"), "{err}");
    }

    #[test]
    fn missing_response_is_rejected() {
        assert!(parse("m", r#"{"request":[]}"#).is_err());
    }
}
