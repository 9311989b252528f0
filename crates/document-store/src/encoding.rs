//! Translation between engine queries/documents and the REST wire format.
//!
//! Field values travel as typed wrappers (`{"stringValue": "x"}`,
//! `{"integerValue": "3"}`, ...). Queries become a `structuredQuery` whose
//! field filters are combined with AND.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};

use harvestdesk_core::store::{Document, Predicate, Query, SortDirection};

use crate::error::{DocumentStoreError, Result};

/// Encodes a plain JSON value as a typed wire value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(fields) => json!({ "mapValue": { "fields": encode_fields(fields) } }),
    }
}

fn encode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect()
}

/// Like [`encode_value`], but RFC 3339 strings become timestamps when the
/// field is stored as one.
fn encode_filter_value(field: &str, value: &Value, timestamp_fields: &[String]) -> Value {
    if let Value::String(raw) = value {
        if timestamp_fields.iter().any(|f| f == field) && DateTime::parse_from_rfc3339(raw).is_ok()
        {
            return json!({ "timestampValue": raw });
        }
    }
    encode_value(value)
}

/// Decodes a typed wire value. Timestamps and references decode to strings.
pub fn decode_value(value: &Value) -> Result<Value> {
    let Some((kind, inner)) = value.as_object().and_then(|obj| obj.iter().next()) else {
        return Err(DocumentStoreError::decode(format!(
            "Expected a typed value, got {}",
            value
        )));
    };
    let decoded = match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().unwrap_or(false)),
        "integerValue" => {
            let parsed = match inner {
                Value::String(raw) => raw.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            match parsed {
                Some(i) => Value::Number(i.into()),
                None => {
                    return Err(DocumentStoreError::decode(format!(
                        "Invalid integerValue {}",
                        inner
                    )))
                }
            }
        }
        "doubleValue" => inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => {
            Value::String(inner.as_str().unwrap_or_default().to_string())
        }
        "geoPointValue" => inner.clone(),
        "arrayValue" => {
            let items = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect::<Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            Value::Array(items)
        }
        "mapValue" => Value::Object(decode_fields(inner.get("fields"))?),
        other => {
            return Err(DocumentStoreError::decode(format!(
                "Unknown value type {}",
                other
            )))
        }
    };
    Ok(decoded)
}

fn decode_fields(fields: Option<&Value>) -> Result<Map<String, Value>> {
    let Some(fields) = fields.and_then(Value::as_object) else {
        return Ok(Map::new());
    };
    fields
        .iter()
        .map(|(key, value)| -> Result<(String, Value)> {
            Ok((key.clone(), decode_value(value)?))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    name: String,
    #[serde(default)]
    fields: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryItem {
    #[serde(default)]
    document: Option<WireDocument>,
}

/// Decodes a `:runQuery` response body. Items without a document (the
/// read-time marker of an empty result) are skipped.
pub fn decode_run_query_response(body: &str) -> Result<Vec<Document>> {
    let items: Vec<RunQueryItem> = serde_json::from_str(body)?;
    items
        .into_iter()
        .filter_map(|item| item.document)
        .map(|doc| -> Result<Document> {
            let id = doc
                .name
                .rsplit('/')
                .next()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    DocumentStoreError::decode(format!("Document name without id: {}", doc.name))
                })?
                .to_string();
            Ok(Document::new(id, decode_fields(doc.fields.as_ref())?))
        })
        .collect()
}

fn field_filter(field: &str, op: &str, value: Value) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": field },
            "op": op,
            "value": value,
        }
    })
}

/// Builds the `runQuery` request body for `query`.
pub fn structured_query(query: &Query, timestamp_fields: &[String]) -> Value {
    let mut filters = Vec::new();
    let mut order_by = Vec::new();
    let mut limit = None;

    for predicate in &query.predicates {
        match predicate {
            Predicate::Eq { field, value } => filters.push(field_filter(
                field,
                "EQUAL",
                encode_filter_value(field, value, timestamp_fields),
            )),
            Predicate::In { field, values } => {
                let encoded: Vec<Value> = values
                    .iter()
                    .map(|v| encode_filter_value(field, v, timestamp_fields))
                    .collect();
                filters.push(field_filter(
                    field,
                    "IN",
                    json!({ "arrayValue": { "values": encoded } }),
                ));
            }
            Predicate::Gt { field, value } => filters.push(field_filter(
                field,
                "GREATER_THAN",
                encode_filter_value(field, value, timestamp_fields),
            )),
            Predicate::OrderBy { field, direction } => order_by.push(json!({
                "field": { "fieldPath": field },
                "direction": match direction {
                    SortDirection::Ascending => "ASCENDING",
                    SortDirection::Descending => "DESCENDING",
                },
            })),
            Predicate::Limit { count } => limit = Some(*count),
        }
    }

    let mut structured = Map::new();
    structured.insert(
        "from".to_string(),
        json!([{ "collectionId": query.collection.collection_id() }]),
    );
    match filters.len() {
        0 => {}
        1 => {
            structured.insert("where".to_string(), filters.remove(0));
        }
        _ => {
            structured.insert(
                "where".to_string(),
                json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
            );
        }
    }
    if !order_by.is_empty() {
        structured.insert("orderBy".to_string(), Value::Array(order_by));
    }
    if let Some(count) = limit {
        structured.insert("limit".to_string(), json!(count));
    }

    json!({ "structuredQuery": Value::Object(structured) })
}
