//! In-memory crud service used to exercise the client over real HTTP.
//!
//! Documents are JSON objects kept in insertion order, each with a generated
//! `_id`. The collection lives at `/`; the query language covers plain field
//! equality plus the reserved `_q`, `_l`, `_sk`, `_p` and `_s` parameters.
//! Errors use the service's `{message, statusCode, error}` body.

use std::cmp::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub type Document = Map<String, Value>;
pub type Db = Arc<RwLock<Vec<Document>>>;

type Params = Query<Vec<(String, String)>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Vec::new()));
    Router::new()
        .route(
            "/",
            get(list).post(create).patch(patch_many).delete(delete_many),
        )
        .route("/count", get(count))
        .route("/export", get(export))
        .route("/bulk", post(create_many).patch(patch_bulk))
        .route("/upsert-one", post(upsert_one))
        .route(
            "/{id}",
            get(get_by_id).patch(patch_by_id).delete(delete_by_id),
        )
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Error answered with the crud service's JSON error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "element not found".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "message": self.message,
            "statusCode": self.status.as_u16(),
            "error": self.status.canonical_reason().unwrap_or_default(),
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Criteria {
    fields: Vec<(String, String)>,
    query: Option<Value>,
    limit: Option<usize>,
    skip: usize,
    projection: Option<Vec<String>>,
    sort: Option<String>,
}

fn parse_criteria(params: Vec<(String, String)>) -> Result<Criteria, ApiError> {
    let mut criteria = Criteria::default();
    for (name, value) in params {
        match name.as_str() {
            "_q" => {
                let query = serde_json::from_str(&value)
                    .map_err(|e| ApiError::bad_request(format!("invalid _q: {e}")))?;
                criteria.query = Some(query);
            }
            "_l" => criteria.limit = Some(parse_count(&name, &value)?),
            "_sk" => criteria.skip = parse_count(&name, &value)?,
            "_p" => criteria.projection = Some(value.split(',').map(str::to_string).collect()),
            "_s" => criteria.sort = Some(value),
            _ => criteria.fields.push((name, value)),
        }
    }
    Ok(criteria)
}

fn parse_count(name: &str, value: &str) -> Result<usize, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{name} must be a non-negative integer")))
}

impl Criteria {
    fn matches(&self, doc: &Document) -> Result<bool, ApiError> {
        for (field, expected) in &self.fields {
            if lookup(doc, field).map(as_text).as_deref() != Some(expected.as_str()) {
                return Ok(false);
            }
        }
        match &self.query {
            Some(query) => matches_query(doc, query),
            None => Ok(true),
        }
    }

    /// Matching documents, sorted, paged and projected.
    fn select(&self, docs: &[Document]) -> Result<Vec<Document>, ApiError> {
        let mut selected = Vec::new();
        for doc in docs {
            if self.matches(doc)? {
                selected.push(doc.clone());
            }
        }

        if let Some(sort) = &self.sort {
            selected.sort_by(|a, b| compare_by(sort, a, b));
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(selected
            .into_iter()
            .skip(self.skip)
            .take(limit)
            .map(|doc| self.project(doc))
            .collect())
    }

    fn project(&self, doc: Document) -> Document {
        match &self.projection {
            Some(fields) => doc
                .into_iter()
                .filter(|(key, _)| key == "_id" || fields.contains(key))
                .collect(),
            None => doc,
        }
    }

    /// Plain equalities, used to seed a document created by an upsert.
    fn seed(&self) -> Document {
        let mut doc = Document::new();
        for (field, value) in &self.fields {
            set_path(&mut doc, field, Value::String(value.clone()));
        }
        if let Some(Value::Object(query)) = &self.query {
            for (field, condition) in query {
                let is_operator = match condition {
                    Value::Object(map) => map.keys().any(|k| k.starts_with('$')),
                    _ => false,
                };
                if !field.starts_with('$') && !is_operator {
                    set_path(&mut doc, field, condition.clone());
                }
            }
        }
        doc
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_by(sort: &str, a: &Document, b: &Document) -> Ordering {
    for key in sort.split(',') {
        let (field, descending) = match key.strip_prefix('-') {
            Some(field) => (field, true),
            None => (key, false),
        };
        let ordering = match (lookup(a, field), lookup(b, field)) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches_query(doc: &Document, query: &Value) -> Result<bool, ApiError> {
    let Value::Object(conditions) = query else {
        return Err(ApiError::bad_request("_q must be a JSON object"));
    };
    for (key, condition) in conditions {
        let matched = match key.as_str() {
            "$and" | "$or" => {
                let clauses = condition
                    .as_array()
                    .ok_or_else(|| ApiError::bad_request(format!("{key} expects an array")))?;
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    results.push(matches_query(doc, clause)?);
                }
                if key == "$and" {
                    results.iter().all(|r| *r)
                } else {
                    results.iter().any(|r| *r)
                }
            }
            _ => matches_condition(lookup(doc, key), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> Result<bool, ApiError> {
    let operators = match condition {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        _ => return Ok(value == Some(condition)),
    };

    for (operator, arg) in operators {
        let ordering = value.and_then(|v| compare(v, arg));
        let matched = match operator.as_str() {
            "$eq" => value == Some(arg),
            "$ne" => value != Some(arg),
            "$in" | "$nin" => {
                let candidates = arg
                    .as_array()
                    .ok_or_else(|| ApiError::bad_request(format!("{operator} expects an array")))?;
                let found = candidates.iter().any(|c| value == Some(c));
                if operator == "$in" {
                    found
                } else {
                    !found
                }
            }
            "$gt" => ordering == Some(Ordering::Greater),
            "$gte" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            "$lt" => ordering == Some(Ordering::Less),
            "$lte" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
            other => return Err(ApiError::bad_request(format!("unsupported query operator {other}"))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Dotted paths and update operators
// ---------------------------------------------------------------------------

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = doc;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.rsplit_once('.') {
        Some((parent, last)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = match current.get_mut(part) {
                    Some(Value::Object(map)) => map,
                    _ => return,
                };
            }
            current.remove(last);
        }
        None => {
            doc.remove(path);
        }
    }
}

/// `doc` with `update` applied; the stored document is untouched on error.
fn updated(doc: &Document, update: &Document) -> Result<Document, ApiError> {
    let mut next = doc.clone();
    apply_update(&mut next, update, false)?;
    Ok(next)
}

fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<(), ApiError> {
    for (operator, fields) in update {
        let Value::Object(fields) = fields else {
            return Err(ApiError::bad_request(format!("{operator} expects an object")));
        };
        for (path, arg) in fields {
            match operator.as_str() {
                "$set" => set_path(doc, path, arg.clone()),
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, arg.clone());
                    }
                }
                "$unset" => remove_path(doc, path),
                "$inc" | "$mul" => {
                    let current = lookup(doc, path).cloned().unwrap_or(json!(0));
                    let result = arithmetic(operator, &current, arg).ok_or_else(|| {
                        ApiError::bad_request(format!("{operator} on {path} needs numbers"))
                    })?;
                    set_path(doc, path, result);
                }
                "$push" | "$addToSet" => {
                    let items = match arg.get("$each") {
                        Some(Value::Array(items)) => items.clone(),
                        _ => vec![arg.clone()],
                    };
                    let mut array = match lookup(doc, path) {
                        Some(Value::Array(array)) => array.clone(),
                        None => Vec::new(),
                        Some(_) => {
                            return Err(ApiError::bad_request(format!("{path} is not an array")))
                        }
                    };
                    for item in items {
                        if operator == "$push" || !array.contains(&item) {
                            array.push(item);
                        }
                    }
                    set_path(doc, path, Value::Array(array));
                }
                other => {
                    return Err(ApiError::bad_request(format!(
                        "unsupported update operator {other}"
                    )))
                }
            }
        }
    }
    Ok(())
}

fn arithmetic(operator: &str, current: &Value, arg: &Value) -> Option<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), arg.as_i64()) {
        let result = if operator == "$inc" { a.checked_add(b)? } else { a.checked_mul(b)? };
        return Some(json!(result));
    }
    let (a, b) = (current.as_f64()?, arg.as_f64()?);
    Some(json!(if operator == "$inc" { a + b } else { a * b }))
}

fn new_id() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

fn has_id(doc: &Document, id: &str) -> bool {
    doc.get("_id").and_then(Value::as_str) == Some(id)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list(State(db): State<Db>, Query(params): Params) -> Result<Json<Vec<Document>>, ApiError> {
    let criteria = parse_criteria(params)?;
    let docs = db.read().await;
    Ok(Json(criteria.select(&docs)?))
}

async fn count(State(db): State<Db>, Query(params): Params) -> Result<Json<usize>, ApiError> {
    let criteria = parse_criteria(params)?;
    let docs = db.read().await;
    let mut n = 0;
    for doc in docs.iter() {
        if criteria.matches(doc)? {
            n += 1;
        }
    }
    Ok(Json(n))
}

async fn export(State(db): State<Db>, Query(params): Params) -> Result<Response, ApiError> {
    let criteria = parse_criteria(params)?;
    let docs = db.read().await;
    let mut body = String::new();
    for doc in criteria.select(&docs)? {
        body.push_str(&Value::Object(doc).to_string());
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

async fn get_by_id(
    State(db): State<Db>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Result<Json<Document>, ApiError> {
    let criteria = parse_criteria(params)?;
    let docs = db.read().await;
    for doc in docs.iter().filter(|doc| has_id(doc, &id)) {
        if criteria.matches(doc)? {
            return Ok(Json(criteria.project(doc.clone())));
        }
    }
    Err(ApiError::not_found())
}

async fn create(
    State(db): State<Db>,
    Json(mut doc): Json<Document>,
) -> Json<Value> {
    let id = new_id();
    doc.insert("_id".to_string(), id.clone());
    db.write().await.push(doc);
    tracing::debug!(%id, "document created");
    Json(json!({ "_id": id }))
}

async fn create_many(
    State(db): State<Db>,
    Json(new_docs): Json<Vec<Document>>,
) -> Json<Vec<Value>> {
    let mut docs = db.write().await;
    let mut created = Vec::with_capacity(new_docs.len());
    for mut doc in new_docs {
        let id = new_id();
        doc.insert("_id".to_string(), id.clone());
        docs.push(doc);
        created.push(json!({ "_id": id }));
    }
    tracing::debug!(count = created.len(), "documents created");
    Json(created)
}

async fn patch_by_id(
    State(db): State<Db>,
    Path(id): Path<String>,
    Query(params): Params,
    Json(update): Json<Document>,
) -> Result<Json<Document>, ApiError> {
    let criteria = parse_criteria(params)?;
    let mut docs = db.write().await;
    for doc in docs.iter_mut().filter(|doc| has_id(doc, &id)) {
        if criteria.matches(doc)? {
            *doc = updated(doc, &update)?;
            return Ok(Json(criteria.project(doc.clone())));
        }
    }
    Err(ApiError::not_found())
}

/// Updates every match, or none of them when one update fails.
fn patch_matching(docs: &mut [Document], criteria: &Criteria, update: &Document) -> Result<usize, ApiError> {
    let mut changes = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        if criteria.matches(doc)? {
            changes.push((i, updated(doc, update)?));
        }
    }
    let n = changes.len();
    for (i, doc) in changes {
        docs[i] = doc;
    }
    Ok(n)
}

async fn patch_many(
    State(db): State<Db>,
    Query(params): Params,
    Json(update): Json<Document>,
) -> Result<Json<usize>, ApiError> {
    let criteria = parse_criteria(params)?;
    let mut docs = db.write().await;
    Ok(Json(patch_matching(&mut docs, &criteria, &update)?))
}

#[derive(Debug, Deserialize)]
pub struct BulkItem {
    pub filter: Map<String, Value>,
    pub update: Document,
}

impl BulkItem {
    /// The filter object uses the query-parameter vocabulary, `_q` included.
    fn criteria(&self) -> Result<Criteria, ApiError> {
        let mut params = Vec::with_capacity(self.filter.len());
        for (name, value) in &self.filter {
            let Value::String(value) = value else {
                return Err(ApiError::bad_request(format!("filter field {name} must be a string")));
            };
            params.push((name.clone(), value.clone()));
        }
        parse_criteria(params)
    }
}

async fn patch_bulk(
    State(db): State<Db>,
    Json(items): Json<Vec<BulkItem>>,
) -> Result<Json<usize>, ApiError> {
    let mut docs = db.write().await;
    let mut staged = docs.clone();
    let mut n = 0;
    for item in &items {
        n += patch_matching(&mut staged, &item.criteria()?, &item.update)?;
    }
    *docs = staged;
    Ok(Json(n))
}

async fn delete_by_id(State(db): State<Db>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let mut docs = db.write().await;
    let position = docs
        .iter()
        .position(|doc| has_id(doc, &id))
        .ok_or_else(ApiError::not_found)?;
    docs.remove(position);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_many(State(db): State<Db>, Query(params): Params) -> Result<Json<usize>, ApiError> {
    let criteria = parse_criteria(params)?;
    let mut docs = db.write().await;
    let mut doomed = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        if criteria.matches(doc)? {
            doomed.push(i);
        }
    }
    for i in doomed.iter().rev() {
        docs.remove(*i);
    }
    Ok(Json(doomed.len()))
}

async fn upsert_one(
    State(db): State<Db>,
    Query(params): Params,
    Json(update): Json<Document>,
) -> Result<Json<Document>, ApiError> {
    let criteria = parse_criteria(params)?;
    let mut docs = db.write().await;

    for doc in docs.iter_mut() {
        if criteria.matches(doc)? {
            *doc = updated(doc, &update)?;
            return Ok(Json(criteria.project(doc.clone())));
        }
    }

    let mut doc = criteria.seed();
    apply_update(&mut doc, &update, true)?;
    doc.insert("_id".to_string(), new_id());
    docs.push(doc.clone());
    Ok(Json(criteria.project(doc)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn criteria(params: &[(&str, &str)]) -> Criteria {
        parse_criteria(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn reserved_parameters_are_parsed() {
        let c = criteria(&[("_l", "5"), ("_sk", "2"), ("_p", "a,b"), ("_s", "-a"), ("name", "x")]);
        assert_eq!(c.limit, Some(5));
        assert_eq!(c.skip, 2);
        assert_eq!(c.projection, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(c.sort.as_deref(), Some("-a"));
        assert_eq!(c.fields, vec![("name".to_string(), "x".to_string())]);
    }

    #[test]
    fn invalid_mongo_query_is_bad_request() {
        let err = parse_criteria(vec![("_q".to_string(), "{oops".to_string())]).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn fields_compare_as_text() {
        let c = criteria(&[("pages", "3")]);
        assert!(c.matches(&doc(json!({"pages": 3}))).unwrap());
        assert!(!c.matches(&doc(json!({"pages": 4}))).unwrap());
    }

    #[test]
    fn query_operators() {
        let c = criteria(&[("_q", r#"{"field":{"$in":["v-1","v-2"]},"n":{"$gte":2}}"#)]);
        assert!(c.matches(&doc(json!({"field": "v-1", "n": 2}))).unwrap());
        assert!(!c.matches(&doc(json!({"field": "v-3", "n": 2}))).unwrap());
        assert!(!c.matches(&doc(json!({"field": "v-2", "n": 1}))).unwrap());
    }

    #[test]
    fn or_clauses() {
        let c = criteria(&[("_q", r#"{"$or":[{"a":1},{"b":{"$exists":true}}]}"#)]);
        assert!(c.matches(&doc(json!({"a": 1}))).unwrap());
        assert!(c.matches(&doc(json!({"b": null}))).unwrap());
        assert!(!c.matches(&doc(json!({"a": 2}))).unwrap());
    }

    #[test]
    fn updates_follow_dotted_paths() {
        let mut d = doc(json!({"n": 1, "nested": {"keep": true, "drop": 1}}));
        let update = doc(json!({
            "$set": {"nested.field": "something"},
            "$unset": {"nested.drop": true},
            "$inc": {"n": 2},
            "$addToSet": {"tags": {"$each": ["a", "b", "a"]}},
        }));
        apply_update(&mut d, &update, false).unwrap();
        assert_eq!(
            Value::Object(d),
            json!({"n": 3, "nested": {"keep": true, "field": "something"}, "tags": ["a", "b"]})
        );
    }

    #[test]
    fn set_on_insert_only_when_inserting() {
        let update = doc(json!({"$setOnInsert": {"created": true}}));
        let mut existing = Document::new();
        apply_update(&mut existing, &update, false).unwrap();
        assert!(existing.is_empty());
        apply_update(&mut existing, &update, true).unwrap();
        assert_eq!(existing.get("created"), Some(&json!(true)));
    }

    #[test]
    fn unknown_update_operator_is_rejected() {
        let mut d = Document::new();
        let err = apply_update(&mut d, &doc(json!({"$rename": {"a": "b"}})), false).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn failed_update_leaves_documents_unchanged() {
        let mut docs = vec![doc(json!({"_id": "1", "n": 1})), doc(json!({"_id": "2", "n": "x"}))];
        let update = doc(json!({"$set": {"touched": true}, "$inc": {"n": 1}}));

        let err = patch_matching(&mut docs, &Criteria::default(), &update).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            docs,
            vec![doc(json!({"_id": "1", "n": 1})), doc(json!({"_id": "2", "n": "x"}))]
        );
    }

    #[test]
    fn select_sorts_pages_and_projects() {
        let docs = vec![
            doc(json!({"_id": "1", "n": 3, "x": 1})),
            doc(json!({"_id": "2", "n": 1, "x": 2})),
            doc(json!({"_id": "3", "n": 2, "x": 3})),
        ];
        let c = criteria(&[("_s", "-n"), ("_sk", "1"), ("_l", "1"), ("_p", "n")]);
        assert_eq!(c.select(&docs).unwrap(), vec![doc(json!({"_id": "3", "n": 2}))]);
    }

    #[test]
    fn upsert_seed_uses_equalities() {
        let c = criteria(&[("title", "Dune"), ("_q", r#"{"author":"Herbert","pages":{"$gt":1}}"#)]);
        assert_eq!(
            Value::Object(c.seed()),
            json!({"title": "Dune", "author": "Herbert"})
        );
    }
}
