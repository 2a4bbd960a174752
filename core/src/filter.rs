//! Filter model and its query-string encoding.
//!
//! # Design
//! A `Filter` becomes a list of query parameters in a fixed order:
//! structured fields first, then the reserved `_q`, `_l`, `_p`, `_sk` and
//! `_s` parameters. Parameters have set semantics, so a structured field that
//! happens to use a reserved name is overwritten in place when the reserved
//! parameter is also emitted. The collision is not rejected.

use std::collections::BTreeMap;

use serde_json::Value;
use url::form_urlencoded;

pub const MONGO_QUERY_PARAM: &str = "_q";
pub const LIMIT_PARAM: &str = "_l";
pub const PROJECTION_PARAM: &str = "_p";
pub const SKIP_PARAM: &str = "_sk";
pub const SORT_PARAM: &str = "_s";

/// Which documents an operation touches and how results are shaped.
///
/// Zero values (`0`, empty string, empty collection, `None`) are omitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Plain `field=value` equality parameters.
    pub fields: BTreeMap<String, String>,
    /// Mongo-style predicate, sent as JSON text in `_q`.
    pub mongo_query: Option<Value>,
    pub limit: u64,
    pub projection: Vec<String>,
    pub skip: u64,
    pub sort: String,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.mongo_query.is_none()
            && self.limit == 0
            && self.projection.is_empty()
            && self.skip == 0
            && self.sort.is_empty()
    }
}

/// Ordered query parameters where setting a name twice keeps the last value
/// at the position of the first.
#[derive(Debug, Default)]
struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    fn set(&mut self, name: &str, value: String) {
        match self.pairs.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.pairs.push((name.to_string(), value)),
        }
    }
}

/// The query parameters for `filter`, in emission order.
pub fn query_pairs(filter: &Filter) -> Vec<(String, String)> {
    let mut query = QueryParams::default();

    for (field, value) in &filter.fields {
        query.set(field, value.clone());
    }

    if let Some(mongo_query) = &filter.mongo_query {
        query.set(MONGO_QUERY_PARAM, mongo_query.to_string());
    }

    if filter.limit != 0 {
        query.set(LIMIT_PARAM, filter.limit.to_string());
    }

    if !filter.projection.is_empty() {
        query.set(PROJECTION_PARAM, filter.projection.join(","));
    }

    if filter.skip != 0 {
        query.set(SKIP_PARAM, filter.skip.to_string());
    }

    if !filter.sort.is_empty() {
        query.set(SORT_PARAM, filter.sort.clone());
    }

    query.pairs
}

/// Encode `filter` as an `application/x-www-form-urlencoded` query string.
pub fn encode_query(filter: &Filter) -> String {
    let pairs = query_pairs(filter);
    if pairs.is_empty() {
        return String::new();
    }
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoded(query: &str) -> Vec<(String, String)> {
        form_urlencoded::parse(query.as_bytes()).into_owned().collect()
    }

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn empty_filter_encodes_to_empty_string() {
        assert_eq!(encode_query(&Filter::default()), "");
        assert!(Filter::default().is_empty());
    }

    #[test]
    fn only_limit() {
        let filter = Filter {
            limit: 5,
            ..Default::default()
        };
        assert_eq!(encode_query(&filter), "_l=5");
    }

    #[test]
    fn only_skip() {
        let filter = Filter {
            skip: 4,
            ..Default::default()
        };
        assert_eq!(encode_query(&filter), "_sk=4");
    }

    #[test]
    fn projection_is_comma_joined() {
        let filter = Filter {
            projection: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        let query = encode_query(&filter);
        assert_eq!(query, "_p=a%2Cb");
        assert_eq!(decoded(&query), vec![pair("_p", "a,b")]);
    }

    #[test]
    fn only_fields() {
        let filter = Filter {
            fields: BTreeMap::from([
                ("name".to_string(), "Alice".to_string()),
                ("customId".to_string(), "abcde".to_string()),
            ]),
            ..Default::default()
        };
        assert_eq!(encode_query(&filter), "customId=abcde&name=Alice");
    }

    #[test]
    fn only_mongo_query() {
        let filter = Filter {
            mongo_query: Some(json!({"field": {"$in": ["v-1", "v-2"]}})),
            ..Default::default()
        };
        assert_eq!(
            decoded(&encode_query(&filter)),
            vec![pair("_q", r#"{"field":{"$in":["v-1","v-2"]}}"#)]
        );
    }

    #[test]
    fn mongo_query_keys_are_sorted() {
        let filter = Filter {
            mongo_query: Some(json!({"zeta": 1, "alpha": {"b": 2, "a": 1}})),
            ..Default::default()
        };
        assert_eq!(
            query_pairs(&filter),
            vec![pair("_q", r#"{"alpha":{"a":1,"b":2},"zeta":1}"#)]
        );
    }

    #[test]
    fn all_parameters_in_emission_order() {
        let filter = Filter {
            fields: BTreeMap::from([("customId".to_string(), "abcde".to_string())]),
            mongo_query: Some(json!({"field": {"$in": ["v-1", "v-2"]}})),
            limit: 5,
            projection: vec!["a".to_string(), "b".to_string()],
            skip: 2,
            sort: "-updatedAt".to_string(),
        };
        assert_eq!(
            encode_query(&filter),
            "customId=abcde\
             &_q=%7B%22field%22%3A%7B%22%24in%22%3A%5B%22v-1%22%2C%22v-2%22%5D%7D%7D\
             &_l=5&_p=a%2Cb&_sk=2&_s=-updatedAt"
        );
    }

    #[test]
    fn reserved_parameter_overwrites_same_named_field() {
        let filter = Filter {
            fields: BTreeMap::from([
                ("_l".to_string(), "99".to_string()),
                ("a".to_string(), "1".to_string()),
            ]),
            limit: 5,
            ..Default::default()
        };
        assert_eq!(query_pairs(&filter), vec![pair("_l", "5"), pair("a", "1")]);
    }

    #[test]
    fn reserved_named_field_survives_when_parameter_unset() {
        let filter = Filter {
            fields: BTreeMap::from([("_s".to_string(), "name".to_string())]),
            ..Default::default()
        };
        assert_eq!(encode_query(&filter), "_s=name");
    }

    #[test]
    fn values_are_percent_encoded() {
        let filter = Filter {
            fields: BTreeMap::from([("name".to_string(), "Mario Rossi&co".to_string())]),
            ..Default::default()
        };
        assert_eq!(encode_query(&filter), "name=Mario+Rossi%26co");
    }
}
