//! OpenAPI / Swagger documents: one chunk per operation and per schema.

use serde_yaml::{Mapping, Value};
use strata_memory::{MetaKey, Metadata};

use crate::chunk::{Chunk, ChunkType, Layer};
use crate::error::{IndexError, Result};

const VERBS: &[&str] = &["get", "put", "post", "delete", "patch", "head", "options"];

/// Parse `source` as YAML (a superset of JSON) and keep it only if it is an API
/// document, i.e. a mapping with a top-level `openapi` or `swagger` key.
pub(super) fn parse_api_document(source: &str) -> Option<Value> {
    let doc: Value = match serde_yaml::from_str(source) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!(error = %e, "structured file is not a single YAML document");
            return None;
        }
    };
    let map = doc.as_mapping()?;
    (map.contains_key("openapi") || map.contains_key("swagger")).then_some(doc)
}

pub(super) fn extract(doc: &Value) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let schemas = schema_section(doc);

    if let Some(info) = doc.get("info") {
        let mut fragment = Mapping::new();
        for key in ["openapi", "swagger"] {
            if let Some(v) = doc.get(key) {
                fragment.insert(key.into(), v.clone());
            }
        }
        fragment.insert("info".into(), info.clone());
        if let Some(servers) = doc.get("servers") {
            fragment.insert("servers".into(), servers.clone());
        }
        let mut metadata = api_metadata(ChunkType::ApiInfo);
        if let Some(title) = scalar_text(info.get("title")) {
            metadata.set_extra("api_title", title);
        }
        if let Some(version) = scalar_text(info.get("version")) {
            metadata.set_extra("api_version", version);
        }
        chunks.push(Chunk {
            content: serde_yaml::to_string(&fragment)?,
            metadata,
        });
    }

    if let Some(paths) = doc.get("paths") {
        let paths = paths
            .as_mapping()
            .ok_or_else(|| IndexError::Parse("`paths` is not a mapping".into()))?;
        for (path, item) in paths {
            let Some(path) = path.as_str() else {
                continue;
            };
            let Some(item) = item.as_mapping() else {
                continue;
            };
            for (verb, operation) in item {
                let Some(verb) = verb.as_str().filter(|v| VERBS.contains(v)) else {
                    continue;
                };
                chunks.push(endpoint_chunk(path, verb, operation, schemas)?);
            }
        }
    }

    if let Some(schemas) = schemas {
        for (name, schema) in schemas {
            let Some(schema_name) = name.as_str() else {
                continue;
            };
            let mut fragment = Mapping::new();
            fragment.insert(name.clone(), schema.clone());
            let mut metadata =
                api_metadata(ChunkType::ApiSchema).with(MetaKey::SchemaName, schema_name);
            let properties: Vec<String> = schema
                .get("properties")
                .and_then(Value::as_mapping)
                .map(|props| props.keys().filter_map(|k| scalar_text(Some(k))).collect())
                .unwrap_or_default();
            if !properties.is_empty() {
                metadata.set_extra("properties", properties);
            }
            let required = text_list(schema.get("required"));
            if !required.is_empty() {
                metadata.set_extra("required_fields", required);
            }
            chunks.push(Chunk {
                content: serde_yaml::to_string(&fragment)?,
                metadata,
            });
        }
    }

    Ok(chunks)
}

fn endpoint_chunk(path: &str, verb: &str, operation: &Value, schemas: Option<&Mapping>) -> Result<Chunk> {
    let mut fragment = Mapping::new();
    fragment.insert("path".into(), path.into());
    fragment.insert("method".into(), verb.into());
    fragment.insert("operation".into(), operation.clone());
    let referenced = referenced_schemas(operation, schemas);
    if !referenced.is_empty() {
        fragment.insert("schemas".into(), Value::Mapping(referenced));
    }

    let mut metadata = api_metadata(ChunkType::ApiEndpoint)
        .with(MetaKey::HttpMethod, verb.to_ascii_uppercase())
        .with(MetaKey::ApiPath, path);
    metadata.set_opt(MetaKey::OperationId, scalar_text(operation.get("operationId")));
    if let Some(summary) = scalar_text(operation.get("summary")) {
        metadata.set_extra("summary", summary);
    }
    let tags = text_list(operation.get("tags"));
    if !tags.is_empty() {
        metadata.set_extra("tags", tags);
    }

    Ok(Chunk {
        content: serde_yaml::to_string(&fragment)?,
        metadata,
    })
}

/// Scalar entries of a YAML sequence as text; anything else is empty.
fn text_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(|t| scalar_text(Some(t))).collect())
        .unwrap_or_default()
}

fn api_metadata(chunk_type: ChunkType) -> Metadata {
    Metadata::new()
        .with(MetaKey::ChunkType, chunk_type.as_str())
        .with(MetaKey::Layer, Layer::Api.as_str())
}

/// `components.schemas` (OpenAPI 3) or `definitions` (Swagger 2).
fn schema_section(doc: &Value) -> Option<&Mapping> {
    doc.get("components")
        .and_then(|c| c.get("schemas"))
        .or_else(|| doc.get("definitions"))
        .and_then(Value::as_mapping)
}

/// Schemas named by `$ref` anywhere in `operation`, in first-reference order.
fn referenced_schemas(operation: &Value, schemas: Option<&Mapping>) -> Mapping {
    let mut found = Mapping::new();
    if let Some(schemas) = schemas {
        collect_refs(operation, schemas, &mut found);
    }
    found
}

fn collect_refs(value: &Value, schemas: &Mapping, found: &mut Mapping) {
    match value {
        Value::Mapping(map) => {
            if let Some(name) = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.rsplit('/').next())
                && let Some(schema) = schemas.get(name)
                && !found.contains_key(name)
            {
                found.insert(name.into(), schema.clone());
            }
            for child in map.values() {
                collect_refs(child, schemas, found);
            }
        }
        Value::Sequence(seq) => {
            for child in seq {
                collect_refs(child, schemas, found);
            }
        }
        Value::Tagged(tagged) => collect_refs(&tagged.value, schemas, found),
        _ => {}
    }
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r##"
openapi: 3.0.1
info:
  title: Orders API
  version: 1.2.0
servers:
  - url: https://orders.example.com
paths:
  /orders/{id}:
    parameters:
      - name: id
        in: path
    get:
      operationId: getOrder
      summary: Fetch one order
      tags: [orders]
      responses:
        "200":
          content:
            application/json:
              schema:
                $ref: "#/components/schemas/Order"
    delete:
      operationId: deleteOrder
      responses:
        "204":
          description: gone
  /orders:
    post:
      operationId: createOrder
      requestBody:
        content:
          application/json:
            schema:
              $ref: "#/components/schemas/NewOrder"
      responses:
        "201":
          description: created
components:
  schemas:
    Order:
      type: object
      required: [id]
      properties:
        id: { type: integer }
        status: { type: string }
    NewOrder:
      type: object
      properties:
        sku: { type: string }
"##;

    fn chunks() -> Vec<Chunk> {
        let doc = parse_api_document(SPEC).unwrap();
        extract(&doc).unwrap()
    }

    #[test]
    fn detects_api_documents_only() {
        assert!(parse_api_document(SPEC).is_some());
        assert!(parse_api_document(r#"{"swagger": "2.0", "paths": {}}"#).is_some());
        assert!(parse_api_document("name: app\nreplicas: 2\n").is_none());
        assert!(parse_api_document("a: 1\n---\nb: 2\n").is_none());
        assert!(parse_api_document("- just\n- a list\n").is_none());
    }

    #[test]
    fn emits_info_endpoints_then_schemas() {
        let types: Vec<_> = chunks()
            .iter()
            .map(|c| c.metadata.text(MetaKey::ChunkType).unwrap_or_default().to_owned())
            .collect();
        assert_eq!(
            types,
            ["api_info", "api_endpoint", "api_endpoint", "api_endpoint", "api_schema", "api_schema"]
        );
    }

    #[test]
    fn info_chunk_carries_title_and_version() {
        let chunks = chunks();
        let info = &chunks[0];
        assert_eq!(info.metadata.extra("api_title").and_then(|v| v.as_text()), Some("Orders API"));
        assert_eq!(info.metadata.extra("api_version").and_then(|v| v.as_text()), Some("1.2.0"));
        assert_eq!(info.metadata.text(MetaKey::Layer), Some("api"));
        assert!(info.content.contains("orders.example.com"));
    }

    #[test]
    fn endpoint_chunks_have_verb_path_and_operation() {
        let chunks = chunks();
        let get = &chunks[1].metadata;
        assert_eq!(get.text(MetaKey::HttpMethod), Some("GET"));
        assert_eq!(get.text(MetaKey::ApiPath), Some("/orders/{id}"));
        assert_eq!(get.text(MetaKey::OperationId), Some("getOrder"));
        assert_eq!(get.extra("summary").and_then(|v| v.as_text()), Some("Fetch one order"));
        assert_eq!(
            get.extra("tags").and_then(|v| v.as_list()),
            Some(&["orders".to_owned()][..])
        );

        let delete = &chunks[2].metadata;
        assert_eq!(delete.text(MetaKey::HttpMethod), Some("DELETE"));
        assert!(delete.extra("tags").is_none());

        assert_eq!(chunks[3].metadata.text(MetaKey::OperationId), Some("createOrder"));
    }

    #[test]
    fn endpoint_content_inlines_referenced_schemas() {
        let chunks = chunks();
        assert!(chunks[1].content.contains("schemas:"));
        assert!(chunks[1].content.contains("Order:"));
        assert!(!chunks[1].content.contains("NewOrder"));
        assert!(!chunks[2].content.contains("schemas:"));
        assert!(chunks[3].content.contains("NewOrder:"));
    }

    #[test]
    fn schema_chunks_are_separate() {
        let chunks = chunks();
        let schema = &chunks[4];
        assert_eq!(schema.metadata.text(MetaKey::SchemaName), Some("Order"));
        assert!(schema.metadata.text(MetaKey::HttpMethod).is_none());
        assert!(schema.content.starts_with("Order:"));
        assert_eq!(chunks[5].metadata.text(MetaKey::SchemaName), Some("NewOrder"));
    }

    #[test]
    fn schema_chunks_list_properties_and_required_fields() {
        let chunks = chunks();
        let order = &chunks[4].metadata;
        assert_eq!(
            order.extra("properties").and_then(|v| v.as_list()),
            Some(&["id".to_owned(), "status".to_owned()][..])
        );
        assert_eq!(
            order.extra("required_fields").and_then(|v| v.as_list()),
            Some(&["id".to_owned()][..])
        );

        let new_order = &chunks[5].metadata;
        assert_eq!(
            new_order.extra("properties").and_then(|v| v.as_list()),
            Some(&["sku".to_owned()][..])
        );
        assert!(new_order.extra("required_fields").is_none());
    }

    #[test]
    fn swagger_definitions_are_schemas() {
        let doc = parse_api_document(
            "swagger: '2.0'\ndefinitions:\n  Pet:\n    type: object\n",
        )
        .unwrap();
        let chunks = extract(&doc).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.text(MetaKey::SchemaName), Some("Pet"));
    }

    #[test]
    fn malformed_paths_is_a_parse_error() {
        let doc = parse_api_document("openapi: 3.0.0\npaths: [1, 2]\n").unwrap();
        assert!(matches!(extract(&doc), Err(IndexError::Parse(_))));
    }
}
