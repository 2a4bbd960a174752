//! Test doubles for code that talks to a crud service.
//!
//! `MockCrud` is an in-memory stand-in for `CrudClient`. Each operation is
//! answered by a closure registered with the matching `on_*` method. The
//! closure receives the call's arguments, so it can both assert on them and
//! produce the result. Operations without a closure fail with
//! `CrudError::NotConfigured`.
//!
//! For tests that sit one level lower, on a `Transport`, `encode_ndjson`
//! builds an export body and `match_query` checks that a request carries a
//! given `Filter`.
//!
//! ```
//! use crud_client::{Crud, MockCrud, Options};
//!
//! let mock = MockCrud::<String>::new().on_count(|options| {
//!     assert_eq!(options.filter.limit, 0);
//!     Ok(42)
//! });
//! assert_eq!(mock.count(&Options::default()).unwrap(), 42);
//! ```

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use url::form_urlencoded;

use crate::client::{Crud, Options};
use crate::error::{CrudError, Result};
use crate::filter::{query_pairs, Filter, MONGO_QUERY_PARAM};
use crate::http::HttpRequest;
use crate::patch::{CreatedResource, PatchBody, PatchBulkBody, UpsertBody};

#[allow(clippy::type_complexity)]
pub struct MockCrud<R> {
    get_by_id: Option<Box<dyn Fn(&str, &Options) -> Result<R> + Send + Sync>>,
    list: Option<Box<dyn Fn(&Options) -> Result<Vec<R>> + Send + Sync>>,
    count: Option<Box<dyn Fn(&Options) -> Result<u64> + Send + Sync>>,
    export: Option<Box<dyn Fn(&Options) -> Result<Vec<R>> + Send + Sync>>,
    patch_by_id: Option<Box<dyn Fn(&str, &PatchBody, &Options) -> Result<R> + Send + Sync>>,
    patch_many: Option<Box<dyn Fn(&PatchBody, &Options) -> Result<u64> + Send + Sync>>,
    patch_bulk: Option<Box<dyn Fn(&PatchBulkBody, &Options) -> Result<u64> + Send + Sync>>,
    create: Option<Box<dyn Fn(&R, &Options) -> Result<String> + Send + Sync>>,
    create_many: Option<Box<dyn Fn(&[R], &Options) -> Result<Vec<CreatedResource>> + Send + Sync>>,
    delete_by_id: Option<Box<dyn Fn(&str, &Options) -> Result<()> + Send + Sync>>,
    delete_many: Option<Box<dyn Fn(&Options) -> Result<u64> + Send + Sync>>,
    upsert_one: Option<Box<dyn Fn(&UpsertBody, &Options) -> Result<R> + Send + Sync>>,
}

impl<R> Default for MockCrud<R> {
    fn default() -> Self {
        Self {
            get_by_id: None,
            list: None,
            count: None,
            export: None,
            patch_by_id: None,
            patch_many: None,
            patch_bulk: None,
            create: None,
            create_many: None,
            delete_by_id: None,
            delete_many: None,
            upsert_one: None,
        }
    }
}

impl<R> MockCrud<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get_by_id(
        mut self,
        f: impl Fn(&str, &Options) -> Result<R> + Send + Sync + 'static,
    ) -> Self {
        self.get_by_id = Some(Box::new(f));
        self
    }

    pub fn on_list(mut self, f: impl Fn(&Options) -> Result<Vec<R>> + Send + Sync + 'static) -> Self {
        self.list = Some(Box::new(f));
        self
    }

    pub fn on_count(mut self, f: impl Fn(&Options) -> Result<u64> + Send + Sync + 'static) -> Self {
        self.count = Some(Box::new(f));
        self
    }

    pub fn on_export(
        mut self,
        f: impl Fn(&Options) -> Result<Vec<R>> + Send + Sync + 'static,
    ) -> Self {
        self.export = Some(Box::new(f));
        self
    }

    pub fn on_patch_by_id(
        mut self,
        f: impl Fn(&str, &PatchBody, &Options) -> Result<R> + Send + Sync + 'static,
    ) -> Self {
        self.patch_by_id = Some(Box::new(f));
        self
    }

    pub fn on_patch_many(
        mut self,
        f: impl Fn(&PatchBody, &Options) -> Result<u64> + Send + Sync + 'static,
    ) -> Self {
        self.patch_many = Some(Box::new(f));
        self
    }

    pub fn on_patch_bulk(
        mut self,
        f: impl Fn(&PatchBulkBody, &Options) -> Result<u64> + Send + Sync + 'static,
    ) -> Self {
        self.patch_bulk = Some(Box::new(f));
        self
    }

    pub fn on_create(
        mut self,
        f: impl Fn(&R, &Options) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.create = Some(Box::new(f));
        self
    }

    pub fn on_create_many(
        mut self,
        f: impl Fn(&[R], &Options) -> Result<Vec<CreatedResource>> + Send + Sync + 'static,
    ) -> Self {
        self.create_many = Some(Box::new(f));
        self
    }

    pub fn on_delete_by_id(
        mut self,
        f: impl Fn(&str, &Options) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.delete_by_id = Some(Box::new(f));
        self
    }

    pub fn on_delete_many(
        mut self,
        f: impl Fn(&Options) -> Result<u64> + Send + Sync + 'static,
    ) -> Self {
        self.delete_many = Some(Box::new(f));
        self
    }

    pub fn on_upsert_one(
        mut self,
        f: impl Fn(&UpsertBody, &Options) -> Result<R> + Send + Sync + 'static,
    ) -> Self {
        self.upsert_one = Some(Box::new(f));
        self
    }
}

fn not_configured<T>(operation: &'static str) -> Result<T> {
    Err(CrudError::NotConfigured(operation))
}

impl<R> Crud<R> for MockCrud<R> {
    fn get_by_id(&self, id: &str, options: &Options) -> Result<R> {
        match &self.get_by_id {
            Some(f) => f(id, options),
            None => not_configured("get_by_id"),
        }
    }

    fn list(&self, options: &Options) -> Result<Vec<R>> {
        match &self.list {
            Some(f) => f(options),
            None => not_configured("list"),
        }
    }

    fn count(&self, options: &Options) -> Result<u64> {
        match &self.count {
            Some(f) => f(options),
            None => not_configured("count"),
        }
    }

    fn export(&self, options: &Options) -> Result<Vec<R>> {
        match &self.export {
            Some(f) => f(options),
            None => not_configured("export"),
        }
    }

    fn patch_by_id(&self, id: &str, body: &PatchBody, options: &Options) -> Result<R> {
        match &self.patch_by_id {
            Some(f) => f(id, body, options),
            None => not_configured("patch_by_id"),
        }
    }

    fn patch_many(&self, body: &PatchBody, options: &Options) -> Result<u64> {
        match &self.patch_many {
            Some(f) => f(body, options),
            None => not_configured("patch_many"),
        }
    }

    fn patch_bulk(&self, body: &PatchBulkBody, options: &Options) -> Result<u64> {
        match &self.patch_bulk {
            Some(f) => f(body, options),
            None => not_configured("patch_bulk"),
        }
    }

    fn create(&self, resource: &R, options: &Options) -> Result<String> {
        match &self.create {
            Some(f) => f(resource, options),
            None => not_configured("create"),
        }
    }

    fn create_many(&self, resources: &[R], options: &Options) -> Result<Vec<CreatedResource>> {
        match &self.create_many {
            Some(f) => f(resources, options),
            None => not_configured("create_many"),
        }
    }

    fn delete_by_id(&self, id: &str, options: &Options) -> Result<()> {
        match &self.delete_by_id {
            Some(f) => f(id, options),
            None => not_configured("delete_by_id"),
        }
    }

    fn delete_many(&self, options: &Options) -> Result<u64> {
        match &self.delete_many {
            Some(f) => f(options),
            None => not_configured("delete_many"),
        }
    }

    fn upsert_one(&self, body: &UpsertBody, options: &Options) -> Result<R> {
        match &self.upsert_one {
            Some(f) => f(body, options),
            None => not_configured("upsert_one"),
        }
    }
}

/// Export body for `resources`: each one on its own line, as the service
/// streams it.
pub fn encode_ndjson<R: Serialize>(resources: &[R]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for resource in resources {
        body.push(b'\n');
        serde_json::to_writer(&mut body, resource)?;
    }
    Ok(body)
}

/// A query parameter `match_query` expected but did not find.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query parameter {param}: expected {expected:?}, found {actual:?}")]
pub struct QueryMismatch {
    pub param: String,
    pub expected: String,
    pub actual: Option<String>,
}

/// Check that `request` carries every parameter `expected` encodes to.
///
/// `_q` is compared as JSON, so key order and whitespace do not matter.
/// Parameters the filter does not set are not checked.
pub fn match_query(request: &HttpRequest, expected: &Filter) -> std::result::Result<(), QueryMismatch> {
    let query = request
        .url
        .split_once('?')
        .map(|(_, query)| query.split('#').next().unwrap_or_default())
        .unwrap_or_default();
    let actual: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes()).into_owned().collect();

    for (param, value) in query_pairs(expected) {
        let found = actual.iter().find(|(name, _)| *name == param).map(|(_, v)| v.clone());
        let matched = match (&found, param.as_str()) {
            (Some(found), MONGO_QUERY_PARAM) => {
                serde_json::from_str::<Value>(found).ok() == expected.mongo_query
            }
            (Some(found), _) => *found == value,
            (None, _) => false,
        };
        if !matched {
            return Err(QueryMismatch {
                param,
                expected: value,
                actual: found,
            });
        }
    }
    Ok(())
}
