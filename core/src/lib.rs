//! Typed client for crud-service collections.
//!
//! # Overview
//! `CrudClient<R>` exposes the collection endpoints (list, get, count,
//! export, patch, bulk patch, create, delete, upsert) for any document type
//! `R` that implements serde's `Serialize` and `DeserializeOwned`.
//!
//! # Design
//! - `filter` turns a `Filter` into the service's query string (`_q`, `_l`,
//!   `_p`, `_sk`, `_s` plus plain field equality).
//! - `patch` holds the update payloads, including the bulk filter that
//!   carries its Mongo query as JSON text under `_q`.
//! - `error::normalize` folds every non-2xx answer into one `ResponseError`
//!   chained to the `UpstreamResponseError` sentinel.
//! - The network sits behind the `Transport` trait; `UreqTransport` is the
//!   blocking default.
//! - `MockCrud` implements the same `Crud` trait for callers' unit tests;
//!   `encode_ndjson` and `match_query` help tests written against a transport.

pub mod client;
pub mod error;
pub mod filter;
pub mod http;
pub mod mock;
pub mod patch;
pub mod transport;

pub use client::{decode_ndjson, ClientOptions, Crud, CrudClient, Options};
pub use error::{
    normalize, CrudError, CrudErrorResponse, MalformedFilterError, ResponseError, Result,
    TransportError, UpstreamResponseError, EMPTY_BODY_MESSAGE,
};
pub use filter::{encode_query, query_pairs, Filter};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use mock::{encode_ndjson, match_query, MockCrud, QueryMismatch};
pub use patch::{
    CreatedResource, PatchBody, PatchBulkBody, PatchBulkFilter, PatchBulkItem, UpsertBody,
};
pub use transport::{Transport, UreqTransport};
