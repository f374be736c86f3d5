//! Storage collaborator abstractions
//!
//! The association engine never talks to a database directly. It asks a
//! [`DocumentStore`] for raw documents and a [`Persister`] to write them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Projection, RawDocument};
use crate::error::OdmResult;

/// Selection criteria understood by every store
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document of the collection
    All,
    /// Field equals value; array fields match when they contain the value
    Eq(String, Value),
    /// Field is one of the values; array fields match when they share a value
    In(String, Vec<Value>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::Eq(field.into(), value)
    }

    pub fn any_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    /// Conjunction with another filter
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, other) | (other, Filter::All) => other,
            (Filter::And(mut filters), other) => {
                filters.push(other);
                Filter::And(filters)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    /// Evaluate the filter against a raw document
    pub fn matches(&self, raw: &RawDocument) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, expected) => match raw.get(field) {
                Some(Value::Array(items)) => {
                    items.contains(expected) || matches!(expected, Value::Array(e) if e == items)
                }
                Some(actual) => actual == expected,
                None => expected.is_null(),
            },
            Filter::In(field, candidates) => match raw.get(field) {
                Some(Value::Array(items)) => items.iter().any(|item| candidates.contains(item)),
                Some(actual) => candidates.contains(actual),
                None => candidates.iter().any(Value::is_null),
            },
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// One fetch round trip
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub model: String,
    pub filter: Filter,
    pub projection: Option<Projection>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(model: impl Into<String>, filter: Filter) -> Self {
        Self {
            model: model.into(),
            filter,
            projection: None,
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of an aggregate count / latest-timestamp call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateStats {
    pub count: usize,
    pub latest_updated_at: Option<DateTime<Utc>>,
}

/// Storage fetch service
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a query and return the raw documents it selects
    async fn fetch(&self, request: FetchRequest) -> OdmResult<Vec<RawDocument>>;

    /// First document selected by the query
    async fn fetch_one(&self, request: FetchRequest) -> OdmResult<Option<RawDocument>> {
        let mut documents = self.fetch(request.with_limit(1)).await?;
        Ok(if documents.is_empty() {
            None
        } else {
            Some(documents.swap_remove(0))
        })
    }

    /// Count and latest `updated_at` of the selected documents
    async fn aggregate(&self, model: &str, filter: Filter) -> OdmResult<AggregateStats>;

    /// Remove every selected document, returning how many were removed
    async fn delete_matching(&self, model: &str, filter: Filter) -> OdmResult<usize>;

    /// Merge `changes` into every selected document
    async fn update_matching(
        &self,
        model: &str,
        filter: Filter,
        changes: RawDocument,
    ) -> OdmResult<usize>;

    /// Add `amount` to a numeric field of every selected document
    async fn increment(&self, model: &str, filter: Filter, field: &str, amount: i64)
        -> OdmResult<usize>;
}

/// Persistence notifier
#[async_trait]
pub trait Persister: Send + Sync {
    /// Insert a document or overwrite the top-level fields it carries
    async fn save(&self, model: &str, raw: &RawDocument) -> OdmResult<()>;

    /// Remove a top-level document by identity
    async fn remove(&self, model: &str, id: &Value) -> OdmResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_eq_matches_scalars_and_array_members() {
        let document = raw(json!({"person_id": "p1", "tag_ids": ["t1", "t2"]}));
        assert!(Filter::eq("person_id", json!("p1")).matches(&document));
        assert!(!Filter::eq("person_id", json!("p2")).matches(&document));
        assert!(Filter::eq("tag_ids", json!("t2")).matches(&document));
        assert!(Filter::eq("missing", Value::Null).matches(&document));
    }

    #[test]
    fn test_in_matches_any_candidate() {
        let document = raw(json!({"_id": "a", "tag_ids": ["t1"]}));
        assert!(Filter::any_of("_id", vec![json!("b"), json!("a")]).matches(&document));
        assert!(Filter::any_of("tag_ids", vec![json!("t1")]).matches(&document));
        assert!(!Filter::any_of("_id", vec![]).matches(&document));
    }

    #[test]
    fn test_and_composition() {
        let filter = Filter::All
            .and(Filter::eq("ratable_id", json!("m1")))
            .and(Filter::eq("ratable_type", json!("Movie")));
        assert!(matches!(filter, Filter::And(ref parts) if parts.len() == 2));

        let document = raw(json!({"ratable_id": "m1", "ratable_type": "Movie"}));
        assert!(filter.matches(&document));
    }
}
