//! Session - one unit of work over a document store
//!
//! The session owns the document arena, the identity map and the collaborators
//! the association engine talks to: the store it reads from, the persister it
//! writes through, the field coercer and the callback runner. Relation
//! accessors, binding, eager loading and cascades are all implemented as
//! methods on it.

use std::collections::HashSet;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::associations::eager_loading::IncludeTree;
use crate::associations::metadata::Association;
use crate::associations::proxy::RelationProxy;
use crate::backends::{DocumentStore, FetchRequest, Filter, Persister};
use crate::callbacks::{CallbackKind, CallbackRunner, NoopCallbacks};
use crate::coercion::{FieldCoercer, SchemaCoercer};
use crate::config::OdmConfig;
use crate::document::{
    generate_id, id_key, DocHandle, Document, DocumentArena, Projection, RawDocument, ID_FIELD,
    UPDATED_AT_FIELD,
};
use crate::error::{OdmError, OdmResult};
use crate::model::ModelRegistry;

/// Boxed future used by the recursive lifecycle operations
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub struct Session {
    pub(crate) registry: ModelRegistry,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) persister: Arc<dyn Persister>,
    pub(crate) coercer: Arc<dyn FieldCoercer>,
    pub(crate) callbacks: Arc<dyn CallbackRunner>,
    pub(crate) config: OdmConfig,
    pub(crate) arena: DocumentArena,
    autobuild_suppression: usize,
    /// Documents with a save in flight; autosave cycles stop here
    pub(crate) saving: HashSet<DocHandle>,
}

impl Session {
    /// Session over a backend that both reads and persists documents
    pub fn new<B>(registry: ModelRegistry, backend: Arc<B>) -> Self
    where
        B: DocumentStore + Persister + 'static,
    {
        let store: Arc<dyn DocumentStore> = backend.clone();
        let persister: Arc<dyn Persister> = backend;
        Self::with_parts(registry, store, persister)
    }

    pub fn with_parts(
        registry: ModelRegistry,
        store: Arc<dyn DocumentStore>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        let coercer = Arc::new(SchemaCoercer::new(registry.clone()));
        Self {
            registry,
            store,
            persister,
            coercer,
            callbacks: Arc::new(NoopCallbacks),
            config: OdmConfig::default(),
            arena: DocumentArena::new(),
            autobuild_suppression: 0,
            saving: HashSet::new(),
        }
    }

    pub fn with_config(mut self, config: OdmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_coercer(mut self, coercer: Arc<dyn FieldCoercer>) -> Self {
        self.coercer = coercer;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn CallbackRunner>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OdmConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn arena(&self) -> &DocumentArena {
        &self.arena
    }

    pub fn document(&self, handle: DocHandle) -> OdmResult<&Document> {
        self.arena.get(handle)
    }

    pub(crate) fn document_mut(&mut self, handle: DocHandle) -> OdmResult<&mut Document> {
        self.arena.get_mut(handle)
    }

    /// Attribute read honouring the projection the document was loaded with
    pub fn attribute(&self, handle: DocHandle, field: &str) -> OdmResult<Value> {
        self.document(handle)?.read_attribute(field)
    }

    pub fn id_of(&self, handle: DocHandle) -> OdmResult<Value> {
        Ok(self.document(handle)?.id().clone())
    }

    /// Coerced attribute write
    pub fn write_attribute(
        &mut self,
        handle: DocHandle,
        field: &str,
        value: Value,
    ) -> OdmResult<()> {
        let document = self.document(handle)?;
        if document.is_frozen() {
            return Err(OdmError::invalid_value(field, value, "a writable document"));
        }
        let model = document.model().to_string();
        let value = self.coerce(&model, field, value)?;
        self.document_mut(handle)?.set_attribute(field, value);
        Ok(())
    }

    pub(crate) fn coerce(&self, model: &str, field: &str, value: Value) -> OdmResult<Value> {
        self.coercer.coerce(model, field, value)
    }

    /// New, unsaved document with a generated identity
    pub fn new_document(&mut self, model: &str, attributes: RawDocument) -> OdmResult<DocHandle> {
        let definition = self.registry.require(model)?;

        let mut coerced = RawDocument::new();
        for (field, value) in attributes {
            let value = self.coerce(model, &field, value)?;
            coerced.insert(field, value);
        }
        if coerced.get(ID_FIELD).map_or(true, Value::is_null) {
            coerced.insert(ID_FIELD.to_string(), generate_id());
        }

        let document = Document::new(model, coerced);
        self.callbacks.run_callbacks(CallbackKind::Initialize, &document)?;
        let handle = if definition.is_embedded() {
            self.arena.insert_detached(document)
        } else {
            self.arena.insert(document)
        };
        debug!("Initialized new {} as {:?}", model, handle);
        Ok(handle)
    }

    /// Materialize a stored top-level document, reusing the in-memory copy when
    /// the identity is already known
    pub(crate) fn instantiate(
        &mut self,
        model: &str,
        raw: RawDocument,
        projection: Option<Projection>,
    ) -> OdmResult<DocHandle> {
        let id = raw.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        if let Some(existing) = self.arena.lookup(model, &id) {
            return Ok(existing);
        }

        let mut document = Document::new(model, raw);
        document.persisted = true;
        document.projection = projection.filter(|projection| !projection.is_empty());
        self.callbacks.run_callbacks(CallbackKind::Initialize, &document)?;
        let handle = self.arena.insert(document);
        self.remember_counted_parents(handle)?;
        Ok(handle)
    }

    /// Find a top-level document by identity
    pub async fn find(&mut self, model: &str, id: Value) -> OdmResult<Option<DocHandle>> {
        if let Some(existing) = self.arena.lookup(model, &id) {
            return Ok(Some(existing));
        }
        let request = FetchRequest::new(model, Filter::eq(ID_FIELD, id.clone()));
        match self.store.fetch_one(request).await? {
            Some(raw) => Ok(Some(self.instantiate(model, raw, None)?)),
            None if self.config.raise_not_found_error => Err(OdmError::DocumentNotFound {
                model: model.to_string(),
                ids: vec![id_key(&id)],
            }),
            None => Ok(None),
        }
    }

    /// Run a query and eager load the given relation paths (`"posts"`, `"posts.comments"`)
    pub async fn query(
        &mut self,
        request: FetchRequest,
        includes: &[&str],
    ) -> OdmResult<Vec<DocHandle>> {
        let model = request.model.clone();
        let projection = request.projection.clone();
        let raws = self.store.fetch(request).await?;

        let mut handles = Vec::with_capacity(raws.len());
        for raw in raws {
            handles.push(self.instantiate(&model, raw, projection.clone())?);
        }

        if !includes.is_empty() && !handles.is_empty() {
            let inclusions = IncludeTree::parse(&self.registry, &model, includes)?;
            self.preload(&inclusions, &handles).await?;
        }
        Ok(handles)
    }

    /// Suppress autobuild for as long as the guard lives
    pub fn without_autobuild(&mut self) -> WithoutAutobuild<'_> {
        self.autobuild_suppression += 1;
        WithoutAutobuild { session: self }
    }

    pub fn is_autobuild_suppressed(&self) -> bool {
        self.autobuild_suppression > 0
    }

    pub(crate) fn association_of(
        &self,
        handle: DocHandle,
        name: &str,
    ) -> OdmResult<Arc<Association>> {
        let model = self.document(handle)?.model();
        self.registry.require(model)?.require_association(name)
    }

    /// Proxy of `association` on `handle`, created unloaded on first access
    pub(crate) fn proxy_mut(
        &mut self,
        handle: DocHandle,
        association: &Arc<Association>,
    ) -> OdmResult<&mut RelationProxy> {
        let document = self.document_mut(handle)?;
        Ok(document
            .relations
            .entry(association.name().to_string())
            .or_insert_with(|| RelationProxy::new(Arc::clone(association))))
    }

    /// Persist a document. Embedded documents save through their root.
    pub fn save<'a>(&'a mut self, handle: DocHandle) -> LocalBoxFuture<'a, OdmResult<()>> {
        Box::pin(async move {
            let document = self.document(handle)?;
            if document.is_destroyed() {
                return Ok(());
            }

            if document.is_embedded() {
                self.touch_embedded_parents(handle)?;
                let root = self.arena.root_of(handle)?;
                let root_document = self.document(root)?;
                if root_document.is_embedded() {
                    return Err(OdmError::MixedRelations {
                        root: root_document.model().to_string(),
                        embedded: self.document(handle)?.model().to_string(),
                    });
                }
                return self.save(root).await;
            }

            if !self.saving.insert(handle) {
                return Ok(());
            }
            let result = self.persist_root(handle).await;
            self.saving.remove(&handle);
            result
        })
    }

    async fn persist_root(&mut self, handle: DocHandle) -> OdmResult<()> {
        let document = self.document(handle)?;
        let model = document.model().to_string();
        let was_new = document.is_new_record();
        self.callbacks.run_callbacks(CallbackKind::Save, document)?;

        if self.registry.require(&model)?.has_field(UPDATED_AT_FIELD) {
            let now = Value::String(Utc::now().to_rfc3339());
            self.document_mut(handle)?.set_attribute(UPDATED_AT_FIELD, now);
        }

        let raw = self.serialize(handle)?;
        self.persister.save(&model, &raw).await?;
        self.mark_persisted(handle, &mut Vec::new())?;
        debug!("Saved {} {}", model, self.document(handle)?.id());

        self.run_autosave(handle).await?;
        if was_new {
            self.update_counter_caches(handle, 1).await?;
        } else {
            self.move_counter_caches(handle).await?;
        }
        self.touch_referenced_parents(handle).await?;
        Ok(())
    }

    fn mark_persisted(&mut self, handle: DocHandle, path: &mut Vec<DocHandle>) -> OdmResult<()> {
        path.push(handle);
        let document = self.document_mut(handle)?;
        document.persisted = true;
        let children: Vec<DocHandle> = document
            .relations
            .values()
            .filter(|proxy| proxy.association().kind().embeds() && proxy.is_loaded())
            .flat_map(|proxy| proxy.members())
            .collect();
        for child in children {
            if !path.contains(&child) {
                self.mark_persisted(child, path)?;
            }
        }
        path.pop();
        Ok(())
    }

    /// Stored form of a document, with loaded embedded children written under
    /// their storage keys
    pub fn serialize(&self, handle: DocHandle) -> OdmResult<RawDocument> {
        self.serialize_into(handle, &mut Vec::new())
    }

    fn serialize_into(
        &self,
        handle: DocHandle,
        path: &mut Vec<DocHandle>,
    ) -> OdmResult<RawDocument> {
        path.push(handle);
        let document = self.document(handle)?;
        let mut raw = document.attributes.clone();

        for proxy in document.relations.values() {
            let association = proxy.association();
            if !association.kind().embeds() || !proxy.is_loaded() {
                continue;
            }
            let mut children = Vec::new();
            for child in proxy.members() {
                if path.contains(&child) || self.document(child)?.is_destroyed() {
                    continue;
                }
                children.push(Value::Object(self.serialize_into(child, path)?));
            }
            let value = if association.kind().is_many() {
                Value::Array(children)
            } else {
                children.into_iter().next().unwrap_or(Value::Null)
            };
            raw.insert(association.storage_key().to_string(), value);
        }

        path.pop();
        Ok(raw)
    }

    /// Destroy a document: callbacks, dependent cascades, counter caches, removal.
    ///
    /// Returns `Ok(false)` when a `restrict_with_error` cascade vetoed the removal.
    pub fn destroy<'a>(&'a mut self, handle: DocHandle) -> LocalBoxFuture<'a, OdmResult<bool>> {
        Box::pin(async move {
            let document = self.document(handle)?;
            if document.is_destroyed() {
                return Ok(true);
            }
            self.callbacks.run_callbacks(CallbackKind::Destroy, document)?;

            if !self.apply_delete_dependencies(handle).await? {
                return Ok(false);
            }
            if self.document(handle)?.is_persisted() {
                self.update_counter_caches(handle, -1).await?;
            }
            self.remove_document(handle).await?;
            Ok(true)
        })
    }

    /// Remove a document without callbacks or cascades
    pub async fn delete(&mut self, handle: DocHandle) -> OdmResult<()> {
        if self.document(handle)?.is_destroyed() {
            return Ok(());
        }
        self.remove_document(handle).await
    }

    async fn remove_document(&mut self, handle: DocHandle) -> OdmResult<()> {
        let document = self.document(handle)?;
        let model = document.model().to_string();
        let id = document.id().clone();
        let persisted = document.is_persisted();
        let parent = document.embedded_parent().map(|parent| parent.handle);

        match parent {
            Some(parent) => {
                self.mark_deleted(handle)?;
                let root = self.arena.root_of(parent)?;
                if self.document(root)?.is_persisted() {
                    self.save(root).await?;
                }
            }
            None => {
                if persisted {
                    self.persister.remove(&model, &id).await?;
                }
                self.mark_deleted(handle)?;
            }
        }
        debug!("Removed {} {}", model, id);
        Ok(())
    }

    /// Flag a document as destroyed and drop every in-memory reference to it
    pub(crate) fn mark_deleted(&mut self, handle: DocHandle) -> OdmResult<()> {
        let document = self.document(handle)?;
        let model = document.model().to_string();
        let id = document.id().clone();
        let parent = document.embedded_parent().cloned();

        let linked: Vec<(Arc<Association>, Vec<DocHandle>)> = document
            .relations
            .values()
            .filter(|proxy| !proxy.association().kind().embeds())
            .map(|proxy| (Arc::clone(proxy.association()), proxy.members()))
            .collect();

        for (association, members) in linked {
            for member in members {
                let member_model = self.document(member)?.model().to_string();
                let resolved = association.inverse_association(&self.registry, Some(&member_model));
                let inverse = match resolved {
                    Ok(inverse) => inverse,
                    Err(err) => {
                        warn!(
                            "Skipping back-reference cleanup for {}: {}",
                            association.name(),
                            err
                        );
                        None
                    }
                };
                if let Some(inverse) = inverse {
                    let member_document = self.document_mut(member)?;
                    if let Some(proxy) = member_document.relations.get_mut(inverse.name()) {
                        proxy.remove(handle);
                    }
                }
            }
        }

        if let Some(parent) = &parent {
            let parent_document = self.document_mut(parent.handle)?;
            if let Some(proxy) = parent_document.relations.get_mut(&parent.relation) {
                proxy.remove(handle);
            }
            self.reindex(parent.handle, &parent.relation)?;
        }

        let document = self.document_mut(handle)?;
        for proxy in document.relations.values_mut() {
            if !proxy.association().kind().embeds() {
                proxy.detach_all();
            }
        }
        document.destroyed = true;
        document.persisted = false;
        document.position = None;
        if parent.is_none() {
            self.arena.evict(&model, &id);
        }
        Ok(())
    }
}

/// Scope during which autobuild is suppressed; dereferences to the session
pub struct WithoutAutobuild<'s> {
    session: &'s mut Session,
}

impl Deref for WithoutAutobuild<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for WithoutAutobuild<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for WithoutAutobuild<'_> {
    fn drop(&mut self) {
        self.session.autobuild_suppression -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::options::AssociationOptions;
    use crate::backends::MemoryStore;
    use crate::coercion::FieldType;
    use crate::model::ModelDefinition;
    use serde_json::json;

    fn session() -> (Session, Arc<MemoryStore>) {
        let registry = ModelRegistry::new();
        let mut person = ModelDefinition::new("Person");
        person
            .field("name", FieldType::String)
            .field("age", FieldType::Integer)
            .field(UPDATED_AT_FIELD, FieldType::Time)
            .embeds_many("addresses", AssociationOptions::new())
            .unwrap();
        registry.register(person);
        let mut address = ModelDefinition::new("Address");
        address
            .field("street", FieldType::String)
            .embedded_in("person", AssociationOptions::new())
            .unwrap();
        registry.register(address);

        let store = Arc::new(MemoryStore::new());
        (Session::new(registry, store.clone()), store)
    }

    fn raw(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_new_document_generates_identity_and_coerces() {
        let (mut session, _) = session();
        let person = session.new_document("Person", raw(json!({"age": "42"}))).unwrap();

        let document = session.document(person).unwrap();
        assert!(document.id().is_string());
        assert_eq!(document.attribute("age"), &json!(42));
        assert!(document.is_new_record());
        assert_eq!(session.arena().lookup("Person", document.id()), Some(person));
    }

    #[test]
    fn test_autobuild_guard_nests() {
        let (mut session, _) = session();
        {
            let mut outer = session.without_autobuild();
            assert!(outer.is_autobuild_suppressed());
            {
                let inner = outer.without_autobuild();
                assert!(inner.is_autobuild_suppressed());
            }
            assert!(outer.is_autobuild_suppressed());
        }
        assert!(!session.is_autobuild_suppressed());
    }

    #[tokio::test]
    async fn test_find_uses_identity_map() {
        let (mut session, store) = session();
        store.insert("Person", raw(json!({"_id": "p1", "name": "Ann"}))).await;

        let first = session.find("Person", json!("p1")).await.unwrap().unwrap();
        let second = session.find("Person", json!("p1")).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.fetch_count().await, 1);
        assert!(session.document(first).unwrap().is_persisted());
    }

    #[tokio::test]
    async fn test_save_and_delete_round_trip_through_store() {
        let (mut session, store) = session();
        let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
        let id = session.id_of(person).unwrap();

        session.save(person).await.unwrap();
        let stored = store.get("Person", &id).await.unwrap();
        assert_eq!(stored["name"], json!("Ann"));
        assert!(stored[UPDATED_AT_FIELD].is_string());

        session.delete(person).await.unwrap();
        assert!(store.get("Person", &id).await.is_none());
        assert!(session.document(person).unwrap().is_destroyed());
        assert_eq!(session.arena().lookup("Person", &id), None);
    }

    #[test]
    fn test_frozen_documents_reject_writes() {
        let (mut session, _) = session();
        let person = session.new_document("Person", RawDocument::new()).unwrap();
        session.document_mut(person).unwrap().freeze();
        assert!(session.write_attribute(person, "name", json!("Bea")).is_err());
    }
}
