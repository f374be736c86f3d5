//! In-memory document store
//!
//! Keeps collections in a `tokio` `RwLock` and records every fetch so callers
//! can assert how many round trips an operation cost.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::core::{AggregateStats, DocumentStore, FetchRequest, Filter, Persister, SortDirection};
use crate::document::{RawDocument, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{OdmError, OdmResult};

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, Vec<RawDocument>>,
    fetches: Vec<FetchRequest>,
    fail_next_fetch: Option<String>,
    saves: usize,
}

/// Shared in-memory backend implementing both [`DocumentStore`] and [`Persister`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document without going through the persister
    pub async fn insert(&self, model: &str, raw: RawDocument) {
        let mut state = self.state.write().await;
        upsert(state.collections.entry(model.to_string()).or_default(), raw);
    }

    pub async fn documents(&self, model: &str) -> Vec<RawDocument> {
        let state = self.state.read().await;
        state.collections.get(model).cloned().unwrap_or_default()
    }

    pub async fn get(&self, model: &str, id: &Value) -> Option<RawDocument> {
        let state = self.state.read().await;
        state
            .collections
            .get(model)
            .and_then(|docs| docs.iter().find(|doc| doc.get(ID_FIELD) == Some(id)).cloned())
    }

    /// Number of fetch round trips issued so far
    pub async fn fetch_count(&self) -> usize {
        self.state.read().await.fetches.len()
    }

    pub async fn fetches(&self) -> Vec<FetchRequest> {
        self.state.read().await.fetches.clone()
    }

    pub async fn reset_fetch_log(&self) {
        self.state.write().await.fetches.clear();
    }

    pub async fn save_count(&self) -> usize {
        self.state.read().await.saves
    }

    /// Make the next fetch fail with a storage error
    pub async fn fail_next_fetch(&self, reason: impl Into<String>) {
        self.state.write().await.fail_next_fetch = Some(reason.into());
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch(&self, request: FetchRequest) -> OdmResult<Vec<RawDocument>> {
        let mut state = self.state.write().await;
        if let Some(reason) = state.fail_next_fetch.take() {
            return Err(OdmError::storage(reason));
        }

        debug!("Fetching {} documents matching {:?}", request.model, request.filter);
        state.fetches.push(request.clone());

        let mut selected: Vec<RawDocument> = state
            .collections
            .get(&request.model)
            .map(|docs| docs.iter().filter(|doc| request.filter.matches(doc)).cloned().collect())
            .unwrap_or_default();

        if !request.sort.is_empty() {
            selected.sort_by(|a, b| {
                for spec in &request.sort {
                    let ordering = compare_values(
                        a.get(&spec.field).unwrap_or(&Value::Null),
                        b.get(&spec.field).unwrap_or(&Value::Null),
                    );
                    let ordering = match spec.direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = request.limit {
            selected.truncate(limit);
        }

        Ok(match &request.projection {
            Some(projection) => selected.iter().map(|doc| projection.apply(doc)).collect(),
            None => selected,
        })
    }

    async fn aggregate(&self, model: &str, filter: Filter) -> OdmResult<AggregateStats> {
        let state = self.state.read().await;
        let mut stats = AggregateStats::default();
        for doc in state.collections.get(model).into_iter().flatten() {
            if !filter.matches(doc) {
                continue;
            }
            stats.count += 1;
            let updated_at = doc
                .get(UPDATED_AT_FIELD)
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|time| time.with_timezone(&Utc));
            if updated_at > stats.latest_updated_at {
                stats.latest_updated_at = updated_at;
            }
        }
        Ok(stats)
    }

    async fn delete_matching(&self, model: &str, filter: Filter) -> OdmResult<usize> {
        let mut state = self.state.write().await;
        let docs = state.collections.entry(model.to_string()).or_default();
        let before = docs.len();
        docs.retain(|doc| !filter.matches(doc));
        Ok(before - docs.len())
    }

    async fn update_matching(
        &self,
        model: &str,
        filter: Filter,
        changes: RawDocument,
    ) -> OdmResult<usize> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for doc in state.collections.entry(model.to_string()).or_default().iter_mut() {
            if filter.matches(doc) {
                for (field, value) in &changes {
                    doc.insert(field.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn increment(
        &self,
        model: &str,
        filter: Filter,
        field: &str,
        amount: i64,
    ) -> OdmResult<usize> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for doc in state.collections.entry(model.to_string()).or_default().iter_mut() {
            if filter.matches(doc) {
                let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
                doc.insert(field.to_string(), Value::from(current + amount));
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl Persister for MemoryStore {
    async fn save(&self, model: &str, raw: &RawDocument) -> OdmResult<()> {
        if raw.get(ID_FIELD).map_or(true, Value::is_null) {
            return Err(OdmError::storage(format!("cannot save a {model} without an {ID_FIELD}")));
        }
        let mut state = self.state.write().await;
        state.saves += 1;
        upsert(state.collections.entry(model.to_string()).or_default(), raw.clone());
        Ok(())
    }

    async fn remove(&self, model: &str, id: &Value) -> OdmResult<bool> {
        let mut state = self.state.write().await;
        let docs = state.collections.entry(model.to_string()).or_default();
        let before = docs.len();
        docs.retain(|doc| doc.get(ID_FIELD) != Some(id));
        Ok(docs.len() != before)
    }
}

/// Insert, or overwrite the given top-level fields of the stored document
fn upsert(docs: &mut Vec<RawDocument>, raw: RawDocument) {
    let id = raw.get(ID_FIELD).cloned();
    match docs.iter_mut().find(|doc| id.is_some() && doc.get(ID_FIELD) == id.as_ref()) {
        Some(existing) => existing.extend(raw),
        None => docs.push(raw),
    }
}

/// Total order over JSON values used for sorting: null < bool < number < string < other
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::core::SortSpec;
    use serde_json::json;

    fn raw(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_fetch_filters_sorts_and_logs() {
        let store = MemoryStore::new();
        store.insert("Post", raw(json!({"_id": "a", "person_id": "p1", "rank": 2}))).await;
        store.insert("Post", raw(json!({"_id": "b", "person_id": "p1", "rank": 1}))).await;
        store.insert("Post", raw(json!({"_id": "c", "person_id": "p2", "rank": 0}))).await;

        let request = FetchRequest::new("Post", Filter::eq("person_id", json!("p1")))
            .with_sort(vec![SortSpec::asc("rank")]);
        let docs = store.fetch(request).await.unwrap();

        let ids: Vec<_> = docs.iter().map(|d| d[ID_FIELD].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("a")]);
        assert_eq!(store.fetch_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_reported_once() {
        let store = MemoryStore::new();
        store.fail_next_fetch("connection reset").await;

        let err = store.fetch(FetchRequest::new("Post", Filter::All)).await.unwrap_err();
        assert!(matches!(err, OdmError::Storage(ref msg) if msg.contains("connection reset")));
        assert!(store.fetch(FetchRequest::new("Post", Filter::All)).await.is_ok());
    }

    #[tokio::test]
    async fn test_save_upserts_and_remove_deletes() {
        let store = MemoryStore::new();
        store.save("Person", &raw(json!({"_id": "p1", "name": "Ann"}))).await.unwrap();
        store.save("Person", &raw(json!({"_id": "p1", "name": "Bea"}))).await.unwrap();

        let docs = store.documents("Person").await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["name"], json!("Bea"));
        assert_eq!(store.save_count().await, 2);

        assert!(store.remove("Person", &json!("p1")).await.unwrap());
        assert!(!store.remove("Person", &json!("p1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_aggregate_counts_and_latest_timestamp() {
        let store = MemoryStore::new();
        store
            .insert(
                "Post",
                raw(json!({"_id": "a", "person_id": "p1", "updated_at": "2024-01-01T00:00:00Z"})),
            )
            .await;
        store
            .insert(
                "Post",
                raw(json!({"_id": "b", "person_id": "p1", "updated_at": "2024-03-01T00:00:00Z"})),
            )
            .await;

        let stats = store.aggregate("Post", Filter::eq("person_id", json!("p1"))).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(
            stats.latest_updated_at.unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_increment_and_bulk_update() {
        let store = MemoryStore::new();
        store.insert("Person", raw(json!({"_id": "p1"}))).await;

        store.increment("Person", Filter::eq("_id", json!("p1")), "posts_count", 2).await.unwrap();
        store.increment("Person", Filter::eq("_id", json!("p1")), "posts_count", -1).await.unwrap();
        let mut changes = RawDocument::new();
        changes.insert("name".to_string(), json!("Ann"));
        store.update_matching("Person", Filter::All, changes).await.unwrap();

        let person = store.get("Person", &json!("p1")).await.unwrap();
        assert_eq!(person["posts_count"], json!(1));
        assert_eq!(person["name"], json!("Ann"));
    }
}
