//! Typed client for one crud-service collection.
//!
//! # Design
//! `CrudClient<R, T>` holds the collection base URL, default headers and a
//! `Transport`; it carries no mutable state between calls. Each operation
//! builds an `HttpRequest` (path, encoded filter, headers, JSON body), hands
//! it to the transport, normalizes any non-2xx answer and decodes the body
//! into the caller's resource type `R`.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{normalize, CrudError, Result, TransportError};
use crate::filter::{encode_query, Filter};
use crate::http::{set_header, HttpMethod, HttpRequest, HttpResponse};
use crate::patch::{CreatedResource, PatchBody, PatchBulkBody, UpsertBody};
use crate::transport::{Transport, UreqTransport};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Client-wide configuration.
///
/// Deserializable so it can live in an application's config file:
///
/// ```json
/// { "baseUrl": "http://crud-service/books/", "headers": { "x-tenant": "acme" }, "timeoutMs": 5000 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    pub base_url: String,
    /// Sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Per-call options: the filter and extra headers to forward.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    pub filter: Filter,
    /// Applied after the client's default headers, replacing same-named ones.
    pub headers: Vec<(String, String)>,
}

impl Options {
    pub fn with_filter(filter: Filter) -> Self {
        Self {
            filter,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The operations a crud-service collection supports.
///
/// Implemented by `CrudClient` and by `MockCrud` for tests.
pub trait Crud<R> {
    fn get_by_id(&self, id: &str, options: &Options) -> Result<R>;
    fn list(&self, options: &Options) -> Result<Vec<R>>;
    fn count(&self, options: &Options) -> Result<u64>;
    /// Streams the whole matching set as newline-delimited JSON.
    fn export(&self, options: &Options) -> Result<Vec<R>>;
    fn patch_by_id(&self, id: &str, body: &PatchBody, options: &Options) -> Result<R>;
    /// Returns the number of documents updated.
    fn patch_many(&self, body: &PatchBody, options: &Options) -> Result<u64>;
    /// Returns the number of documents updated across all items.
    fn patch_bulk(&self, body: &PatchBulkBody, options: &Options) -> Result<u64>;
    /// Returns the `_id` of the new document.
    fn create(&self, resource: &R, options: &Options) -> Result<String>;
    fn create_many(&self, resources: &[R], options: &Options) -> Result<Vec<CreatedResource>>;
    fn delete_by_id(&self, id: &str, options: &Options) -> Result<()>;
    /// Returns the number of documents deleted.
    fn delete_many(&self, options: &Options) -> Result<u64>;
    fn upsert_one(&self, body: &UpsertBody, options: &Options) -> Result<R>;
}

/// Synchronous client for a collection of `R` documents.
pub struct CrudClient<R, T = UreqTransport> {
    base_url: Url,
    headers: Vec<(String, String)>,
    transport: T,
    _resource: PhantomData<fn() -> R>,
}

impl<R> CrudClient<R, UreqTransport> {
    /// Client backed by a blocking ureq agent.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let transport = UreqTransport::new(options.timeout());
        Self::with_transport(options, transport)
    }
}

impl<R, T: Transport> CrudClient<R, T> {
    pub fn with_transport(options: ClientOptions, transport: T) -> Result<Self> {
        let mut base_url =
            Url::parse(&options.base_url).map_err(|e| CrudError::CreateClient(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(CrudError::CreateClient(format!(
                "{} cannot be used as a base URL",
                options.base_url
            )));
        }
        if base_url.query().is_some() || base_url.fragment().is_some() {
            return Err(CrudError::CreateClient(format!(
                "{} must not carry a query or fragment",
                options.base_url
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            headers: options.headers.into_iter().collect(),
            transport,
            _resource: PhantomData,
        })
    }

    /// Collection URL, always ending with `/`.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build the request for `method` on `path` below the collection URL.
    ///
    /// `path` is a single segment (an id, `count`, `bulk`...) or empty for
    /// the collection root; it is percent-encoded as a segment. The filter is
    /// only encoded when `with_filter` is set.
    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&B>,
        options: &Options,
        with_filter: bool,
    ) -> Result<HttpRequest> {
        let mut url = self.base_url.clone();
        if !path.is_empty() {
            url.path_segments_mut()
                .map_err(|_| CrudError::CreateRequest(format!("invalid path {path}")))?
                .pop_if_empty()
                .push(path);
        }

        if with_filter {
            let query = encode_query(&options.filter);
            if !query.is_empty() {
                url.set_query(Some(&query));
            }
        }

        let mut headers = self.headers.clone();
        for (name, value) in &options.headers {
            set_header(&mut headers, name, value);
        }
        set_header(&mut headers, "accept", JSON_CONTENT_TYPE);

        let body = match body {
            Some(body) => {
                let bytes =
                    serde_json::to_vec(body).map_err(|e| CrudError::CreateRequest(e.to_string()))?;
                set_header(&mut headers, "content-type", JSON_CONTENT_TYPE);
                Some(bytes)
            }
            None => None,
        };

        Ok(HttpRequest {
            method,
            url: url.into(),
            headers,
            body,
        })
    }

    /// Execute `request`, turning any non-2xx answer into a `CrudError`.
    pub fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        tracing::debug!(method = request.method.as_str(), url = %request.url, "sending request to crud-service");
        let response = self.transport.execute(request).map_err(normalize)?;
        tracing::debug!(status = response.status, "crud-service responded");
        check_status(response).map_err(normalize)
    }

    fn call<B: Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&B>,
        options: &Options,
        with_filter: bool,
    ) -> Result<HttpResponse> {
        let request = self.build_request(method, path, body, options, with_filter)?;
        self.send(request)
    }
}

impl<R, T> Crud<R> for CrudClient<R, T>
where
    R: Serialize + DeserializeOwned,
    T: Transport,
{
    fn get_by_id(&self, id: &str, options: &Options) -> Result<R> {
        check_id(id)?;
        let response = self.call::<()>(HttpMethod::Get, id, None, options, true)?;
        parse_json(&response)
    }

    fn list(&self, options: &Options) -> Result<Vec<R>> {
        let response = self.call::<()>(HttpMethod::Get, "", None, options, true)?;
        parse_json(&response)
    }

    fn count(&self, options: &Options) -> Result<u64> {
        let response = self.call::<()>(HttpMethod::Get, "count", None, options, true)?;
        parse_json(&response)
    }

    fn export(&self, options: &Options) -> Result<Vec<R>> {
        let response = self.call::<()>(HttpMethod::Get, "export", None, options, true)?;
        decode_ndjson(&response.body)
    }

    fn patch_by_id(&self, id: &str, body: &PatchBody, options: &Options) -> Result<R> {
        check_id(id)?;
        let response = self.call(HttpMethod::Patch, id, Some(body), options, true)?;
        parse_json(&response)
    }

    fn patch_many(&self, body: &PatchBody, options: &Options) -> Result<u64> {
        let response = self.call(HttpMethod::Patch, "", Some(body), options, true)?;
        parse_json(&response)
    }

    fn patch_bulk(&self, body: &PatchBulkBody, options: &Options) -> Result<u64> {
        let response = self.call(HttpMethod::Patch, "bulk", Some(body), options, true)?;
        parse_json(&response)
    }

    fn create(&self, resource: &R, options: &Options) -> Result<String> {
        let response = self.call(HttpMethod::Post, "", Some(resource), options, false)?;
        let created: CreatedResource = parse_json(&response)?;
        Ok(created.id)
    }

    fn create_many(&self, resources: &[R], options: &Options) -> Result<Vec<CreatedResource>> {
        let response = self.call(HttpMethod::Post, "bulk", Some(resources), options, false)?;
        parse_json(&response)
    }

    fn delete_by_id(&self, id: &str, options: &Options) -> Result<()> {
        check_id(id)?;
        self.call::<()>(HttpMethod::Delete, id, None, options, false)?;
        Ok(())
    }

    fn delete_many(&self, options: &Options) -> Result<u64> {
        let response = self.call::<()>(HttpMethod::Delete, "", None, options, true)?;
        parse_json(&response)
    }

    fn upsert_one(&self, body: &UpsertBody, options: &Options) -> Result<R> {
        let response = self.call(HttpMethod::Post, "upsert-one", Some(body), options, true)?;
        parse_json(&response)
    }
}

impl<R, T> fmt::Debug for CrudClient<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudClient")
            .field("base_url", &self.base_url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// An id must name one document: empty, `.` and `..` would resolve to the
/// collection itself.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." {
        return Err(CrudError::CreateRequest(format!("invalid id {id:?}")));
    }
    Ok(())
}

/// Map non-2xx responses to `TransportError::Status`.
fn check_status(response: HttpResponse) -> std::result::Result<HttpResponse, TransportError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status(response))
    }
}

fn parse_json<D: DeserializeOwned>(response: &HttpResponse) -> Result<D> {
    Ok(serde_json::from_slice(&response.body)?)
}

/// Decode a stream of whitespace-separated JSON values, in order.
///
/// Running out of input ends the stream; any other failure is an error.
pub fn decode_ndjson<D: DeserializeOwned>(body: &[u8]) -> Result<Vec<D>> {
    serde_json::Deserializer::from_slice(body)
        .into_iter::<D>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(CrudError::from)
}
