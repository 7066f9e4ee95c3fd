use crate::config::ID_FIELD;
use crate::error::IndexError;
use crate::index::{Filter, IndexService, Query};
use crate::models::{Document, FieldOp, LinkDocument, TargetField};
use reqwest::blocking::{Client, Response};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, trace};

pub struct SolrClient {
    http: Client,
    base_url: String,
}

impl SolrClient {
    /// `base_url` is the core URL, e.g. `http://localhost:8983/solr/biblio`.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, IndexError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn post_update(&self, body: &Value) -> Result<(), IndexError> {
        let url = format!("{}/update", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(&[("wt", "json")])
            .json(body)
            .send()?;
        check_response(response).map(|_| ())
    }
}

impl IndexService for SolrClient {
    fn add(&self, docs: &[Document]) -> Result<(), IndexError> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = Value::Array(docs.iter().map(document_json).collect());
        debug!(docs = docs.len(), "Posting documents");
        self.post_update(&body)
    }

    fn update(&self, docs: &[LinkDocument]) -> Result<(), IndexError> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = Value::Array(docs.iter().map(link_document_json).collect());
        debug!(docs = docs.len(), "Posting partial updates");
        self.post_update(&body)
    }

    fn commit(&self) -> Result<(), IndexError> {
        self.post_update(&json!({ "commit": {} }))
    }

    fn optimize(&self) -> Result<(), IndexError> {
        self.post_update(&json!({ "optimize": {} }))
    }

    fn query(&self, query: &Query) -> Result<Vec<Document>, IndexError> {
        let url = format!("{}/select", self.base_url);
        let params = select_params(query);
        trace!(?params, "Select");
        let response = self.http.get(&url).query(&params).send()?;
        let body = check_response(response)?;
        let docs = body
            .pointer("/response/docs")
            .and_then(Value::as_array)
            .ok_or_else(|| IndexError::Decode("select response without response.docs".to_string()))?;
        docs.iter().map(json_document).collect()
    }
}

/// Turns HTTP and Solr-level failures into errors and returns the JSON body.
fn check_response(response: Response) -> Result<Value, IndexError> {
    let status = response.status();
    let text = response.text()?;
    if !status.is_success() {
        return Err(IndexError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    let body: Value = serde_json::from_str(&text)?;
    match body.pointer("/responseHeader/status").and_then(Value::as_i64) {
        Some(0) | None => Ok(body),
        Some(code) => Err(IndexError::Rejected(format!("status {code}: {text}"))),
    }
}

fn values_json(values: &[String]) -> Value {
    match values {
        [single] => Value::String(single.clone()),
        many => Value::Array(many.iter().cloned().map(Value::String).collect()),
    }
}

fn document_json(doc: &Document) -> Value {
    let mut map = Map::new();
    for field in &doc.fields {
        map.insert(field.name.clone(), values_json(&field.values));
    }
    Value::Object(map)
}

/// Atomic-update form: `{"id": .., "field": {"set": [..]}}`. An empty `set`
/// is sent as `null`, which removes the field.
fn link_document_json(doc: &LinkDocument) -> Value {
    let mut map = Map::new();
    map.insert(ID_FIELD.to_string(), Value::String(doc.id.clone()));
    for (field, op) in &doc.ops {
        let (verb, values) = match op {
            FieldOp::Set(values) => ("set", values),
            FieldOp::Add(values) => ("add", values),
        };
        let payload = if values.is_empty() && verb == "set" {
            Value::Null
        } else {
            Value::Array(values.iter().cloned().map(Value::String).collect())
        };
        let mut op_map = Map::new();
        op_map.insert(verb.to_string(), payload);
        map.insert(field.clone(), Value::Object(op_map));
    }
    Value::Object(map)
}

fn json_document(value: &Value) -> Result<Document, IndexError> {
    let object = value
        .as_object()
        .ok_or_else(|| IndexError::Decode("document is not a JSON object".to_string()))?;
    let fields = object
        .iter()
        .map(|(name, v)| TargetField {
            name: name.clone(),
            values: match v {
                Value::Array(items) => items.iter().map(scalar_string).collect(),
                other => vec![scalar_string(other)],
            },
        })
        .collect();
    Ok(Document { fields })
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn select_params(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("q", "*:*".to_string()),
        ("wt", "json".to_string()),
        ("sort", format!("{ID_FIELD} asc")),
        ("rows", query.rows.to_string()),
    ];
    for filter in &query.filters {
        params.push(("fq", render_filter(filter)));
    }
    if let Some(after) = &query.after_id {
        params.push(("fq", format!("{ID_FIELD}:{{\"{}\" TO *]", escape_phrase(after))));
    }
    if !query.fields.is_empty() {
        params.push(("fl", query.fields.join(",")));
    }
    params
}

/// Lucene syntax for one filter.
pub fn render_filter(filter: &Filter) -> String {
    match filter {
        Filter::Equals { field, value } => format!("{field}:\"{}\"", escape_phrase(value)),
        Filter::Present(field) => format!("{field}:*"),
        Filter::Not(inner) => format!("(*:* -{})", render_filter(inner)),
        Filter::AnyOf(filters) if filters.is_empty() => "-*:*".to_string(),
        Filter::AnyOf(filters) => {
            let parts: Vec<String> = filters.iter().map(render_filter).collect();
            format!("({})", parts.join(" OR "))
        }
    }
}

fn escape_phrase(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
