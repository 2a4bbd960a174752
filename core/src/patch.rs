//! Update payloads and the bulk-patch filter encoding.
//!
//! # Design
//! `PatchBody` and `UpsertBody` are operator maps whose unset operators are
//! left out of the JSON entirely. Operator payloads are free-form
//! `serde_json::Value`s.
//!
//! A `PatchBulkFilter` carries two shapes in one flat JSON object: plain
//! `field: "value"` pairs and a Mongo query stored as JSON *text* under the
//! reserved `_q` key, e.g. `{"f1":"v1","_q":"{\"field\":1}"}`.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedFilterError;
use crate::filter::MONGO_QUERY_PARAM;

/// Update operators for `patch_by_id`, `patch_many` and bulk items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchBody {
    #[serde(rename = "$set", default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Value>,
    #[serde(rename = "$unset", default, skip_serializing_if = "Option::is_none")]
    pub unset: Option<Value>,
    #[serde(rename = "$inc", default, skip_serializing_if = "Option::is_none")]
    pub inc: Option<Value>,
    #[serde(rename = "$mul", default, skip_serializing_if = "Option::is_none")]
    pub mul: Option<Value>,
    #[serde(rename = "$currentDate", default, skip_serializing_if = "Option::is_none")]
    pub current_date: Option<Value>,
    #[serde(rename = "$push", default, skip_serializing_if = "Option::is_none")]
    pub push: Option<Value>,
    #[serde(rename = "$pull", default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<Value>,
    #[serde(rename = "$addToSet", default, skip_serializing_if = "Option::is_none")]
    pub add_to_set: Option<Value>,
}

/// Update operators for `upsert_one`.
///
/// `$setOnInsert` only applies when the upsert creates the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertBody {
    #[serde(flatten)]
    pub update: PatchBody,
    #[serde(rename = "$setOnInsert", default, skip_serializing_if = "Option::is_none")]
    pub set_on_insert: Option<Value>,
}

/// Per-item filter of a bulk patch.
///
/// `fields` must not use the `_q` key: on serialization it would overwrite
/// the encoded `mongo_query`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchBulkFilter {
    pub fields: BTreeMap<String, String>,
    pub mongo_query: Option<Value>,
}

impl PatchBulkFilter {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.mongo_query.is_none()
    }

    /// Decode a filter from its JSON text.
    pub fn from_json(json: &str) -> Result<Self, MalformedFilterError> {
        let entries: BTreeMap<String, Value> =
            serde_json::from_str(json).map_err(MalformedFilterError::NotAnObject)?;
        Self::from_entries(entries)
    }

    fn from_entries(mut entries: BTreeMap<String, Value>) -> Result<Self, MalformedFilterError> {
        let mongo_query = match entries.remove(MONGO_QUERY_PARAM) {
            Some(Value::String(text)) => {
                Some(serde_json::from_str(&text).map_err(MalformedFilterError::InvalidQuery)?)
            }
            Some(_) => return Err(MalformedFilterError::QueryNotString),
            None => None,
        };

        let fields = entries
            .into_iter()
            .map(|(field, value)| match value {
                Value::String(value) => Ok((field, value)),
                _ => Err(MalformedFilterError::FieldNotString(field)),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { fields, mongo_query })
    }

    fn to_entries(&self) -> Result<BTreeMap<&str, String>, serde_json::Error> {
        let mut entries = BTreeMap::new();
        if let Some(mongo_query) = &self.mongo_query {
            entries.insert(MONGO_QUERY_PARAM, serde_json::to_string(mongo_query)?);
        }
        for (field, value) in &self.fields {
            entries.insert(field.as_str(), value.clone());
        }
        Ok(entries)
    }
}

impl Serialize for PatchBulkFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_entries()
            .map_err(ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PatchBulkFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Self::from_entries(entries).map_err(de::Error::custom)
    }
}

/// One filter/update pair of a bulk patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchBulkItem {
    pub filter: PatchBulkFilter,
    pub update: PatchBody,
}

/// Items are applied in order, each matched independently.
pub type PatchBulkBody = Vec<PatchBulkItem>;

/// Identifier returned by `create_many` for each inserted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    #[serde(rename = "_id")]
    pub id: String,
}
