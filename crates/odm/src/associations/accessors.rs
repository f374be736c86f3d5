//! Accessors - the per-relation operations exposed on every document
//!
//! Each declared relation gets a getter, a setter, an existence check and
//! (where the kind supports them) builder / creator and ids accessors. The
//! names come from [`AccessorNames`](super::metadata::AccessorNames); the
//! behaviour lives here as session methods keyed by relation name.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::binding::Binding;
use super::dependent::DependentStrategy;
use super::inference::collection_name;
use super::metadata::{Association, RelationKind};
use super::proxy::{forwards, ProxyMethod, ProxyOutput, Relation};
use crate::backends::{FetchRequest, Filter};
use crate::callbacks::CallbackKind;
use crate::document::{
    id_key, AssociationFilter, DocHandle, Document, EmbeddedParent, RawDocument, ValidationError,
    ID_FIELD, UPDATED_AT_FIELD,
};
use crate::error::{OdmError, OdmResult};
use crate::session::{LocalBoxFuture, Session};

/// Value handed to the getter to short-circuit loading
#[derive(Debug, Clone, PartialEq)]
pub enum Seed {
    /// An in-memory document believed to be the target
    Document(DocHandle),
    /// A raw key (referenced relations) or raw stored form (embedded relations)
    Raw(Value),
}

impl Session {
    /// Read a relation, loading it on first access
    pub async fn relation(&mut self, base: DocHandle, name: &str) -> OdmResult<Relation> {
        self.get_relation(base, name, None, false).await
    }

    /// Discard the cached target and read the relation again
    pub async fn reload_relation(&mut self, base: DocHandle, name: &str) -> OdmResult<Relation> {
        self.get_relation(base, name, None, true).await
    }

    /// Getter with an optional seed and forced reload.
    ///
    /// A loaded proxy is returned as is unless `reload` is set. A failed load
    /// leaves the proxy unloaded so the next read retries. An empty
    /// single-document result triggers autobuild when the relation asks for it
    /// and no suppression scope is active.
    pub fn get_relation<'a>(
        &'a mut self,
        base: DocHandle,
        name: &'a str,
        seed: Option<Seed>,
        reload: bool,
    ) -> LocalBoxFuture<'a, OdmResult<Relation>> {
        Box::pin(async move {
            let association = self.association_of(base, name)?;
            let suppressed = self.is_autobuild_suppressed();
            let reload = reload && !association.kind().is_embedded();

            let cached = match self.document(base)?.relation_proxy(name) {
                Some(proxy) if proxy.is_loaded() && !reload => Some(proxy.relation()),
                _ => None,
            };

            let relation = match cached {
                Some(relation) => relation,
                None => {
                    if reload {
                        if let Some(proxy) = self.document_mut(base)?.relations.get_mut(name) {
                            proxy.reset();
                        }
                    }
                    self.without_autobuild().load_relation(base, &association, seed).await?
                }
            };

            if !suppressed
                && association.is_autobuilding()
                && relation == Relation::One(None)
                && association.kind() != RelationKind::EmbeddedIn
                && !self.document(base)?.is_destroyed()
            {
                debug!("Autobuilding {}#{}", association.owner(), name);
                let built = self.build(base, name, RawDocument::new()).await?;
                return Ok(Relation::One(Some(built)));
            }
            Ok(relation)
        })
    }

    async fn load_relation(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
        seed: Option<Seed>,
    ) -> OdmResult<Relation> {
        let mut key_override = None;
        match seed {
            Some(Seed::Document(target)) if self.seed_matches(base, association, target)? => {
                self.proxy_mut(base, association)?.set_one(Some(target));
                Binding::new(self, base, Arc::clone(association)).bind(target)?;
                return self.loaded_relation(base, association);
            }
            Some(Seed::Raw(raw)) if association.kind().embeds() => {
                self.build_embedded_from(base, association, raw)?;
                return self.loaded_relation(base, association);
            }
            Some(Seed::Raw(key)) => key_override = Some(key),
            _ => {}
        }

        match association.kind() {
            RelationKind::EmbedsOne | RelationKind::EmbedsMany => {
                self.materialize_embedded(base, association)?
            }
            RelationKind::EmbeddedIn => {
                let parent = self.document(base)?.embedded_parent().map(|parent| parent.handle);
                self.proxy_mut(base, association)?.set_one(parent);
            }
            RelationKind::BelongsTo => {
                self.load_belongs_to(base, association, key_override).await?
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                self.load_referenced_many(base, association).await?
            }
            RelationKind::HasAndBelongsToMany => {
                self.load_many_to_many(base, association, key_override).await?
            }
        }
        self.loaded_relation(base, association)
    }

    fn loaded_relation(&self, base: DocHandle, association: &Association) -> OdmResult<Relation> {
        Ok(self
            .document(base)?
            .relation_proxy(association.name())
            .map(|proxy| proxy.relation())
            .unwrap_or(if association.kind().is_many() {
                Relation::Many(Vec::new())
            } else {
                Relation::One(None)
            }))
    }

    /// A seed short-circuits loading when it is the in-memory, non-embedded
    /// document the stored key already points at
    fn seed_matches(
        &self,
        base: DocHandle,
        association: &Association,
        target: DocHandle,
    ) -> OdmResult<bool> {
        if association.kind().is_many() {
            return Ok(false);
        }
        let target = self.document(target)?;
        if target.is_embedded() || target.is_destroyed() {
            return Ok(false);
        }
        let key = self.document(base)?.attribute(association.key());
        Ok(!key.is_null() && target.id() == key)
    }

    /// Referenced relations may not point at documents that only live embedded
    fn check_mixed(&self, association: &Association, target_model: &str) -> OdmResult<()> {
        if association.kind().is_embedded() || association.is_cyclic() {
            return Ok(());
        }
        if self.registry().require(target_model)?.is_embedded() {
            return Err(OdmError::MixedRelations {
                root: association.owner().to_string(),
                embedded: target_model.to_string(),
            });
        }
        Ok(())
    }

    /// Type and placement checks applied before a document is attached
    fn check_target(
        &self,
        base: DocHandle,
        association: &Association,
        target: DocHandle,
    ) -> OdmResult<()> {
        let document = self.document(target)?;
        let actual = document.model();

        if !association.is_polymorphic() {
            let expected = association.target_type(self.registry())?;
            if actual != expected {
                return Err(OdmError::WrongTargetType {
                    owner: association.owner().to_string(),
                    name: association.name().to_string(),
                    expected,
                    actual: actual.to_string(),
                });
            }
        }

        if !association.kind().is_embedded() && document.is_embedded() {
            return Err(OdmError::MixedRelations {
                root: self.document(base)?.model().to_string(),
                embedded: actual.to_string(),
            });
        }
        self.check_mixed(association, actual)
    }

    async fn load_belongs_to(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
        key_override: Option<Value>,
    ) -> OdmResult<()> {
        let document = self.document(base)?;
        let key = key_override
            .unwrap_or_else(|| document.attribute(association.foreign_key_or_default()).clone());

        let target_model = if key.is_null() {
            None
        } else if association.is_polymorphic() {
            match association.type_field().map(|field| document.attribute(field)) {
                Some(Value::String(type_name)) => {
                    Some(self.registry().resolve_type(type_name, association.owner())?)
                }
                _ => None,
            }
        } else {
            Some(association.target_type(self.registry())?)
        };

        let Some(target_model) = target_model else {
            self.proxy_mut(base, association)?.set_one(None);
            return Ok(());
        };
        self.check_mixed(association, &target_model)?;

        let identity = if association.primary_key() == ID_FIELD {
            self.arena.lookup(&target_model, &key)
        } else {
            None
        };
        let target = match identity {
            Some(hit) => Some(hit),
            None => {
                debug!(
                    "Loading {}#{} from {}",
                    association.owner(),
                    association.name(),
                    target_model
                );
                let filter = Filter::eq(association.primary_key(), key.clone());
                let request = FetchRequest::new(&target_model, filter);
                match self.store.fetch_one(request).await? {
                    Some(raw) => Some(self.instantiate(&target_model, raw, None)?),
                    None if self.config.raise_not_found_error => {
                        return Err(OdmError::DocumentNotFound {
                            model: target_model,
                            ids: vec![id_key(&key)],
                        });
                    }
                    None => {
                        warn!(
                            "{}#{} points at missing {} {}",
                            association.owner(),
                            association.name(),
                            target_model,
                            key
                        );
                        None
                    }
                }
            }
        };

        self.proxy_mut(base, association)?.set_one(target);
        if let Some(target) = target {
            Binding::new(self, base, Arc::clone(association)).bind(target)?;
        }
        Ok(())
    }

    async fn load_referenced_many(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
    ) -> OdmResult<()> {
        let target_model = association.target_type(self.registry())?;
        self.check_mixed(association, &target_model)?;

        let mut members = Vec::new();
        if self.document(base)?.is_persisted() {
            let filter = self.referenced_filter(base, association)?;
            let mut request =
                FetchRequest::new(&target_model, filter).with_sort(association.order().to_vec());
            if !association.kind().is_many() {
                request = request.with_limit(1);
            }
            debug!("Loading {}#{} from {}", association.owner(), association.name(), target_model);
            let raws = self.store.fetch(request).await?;

            let key = self.document(base)?.attribute(association.primary_key()).clone();
            for raw in raws {
                let handle = self.instantiate(&target_model, raw, None)?;
                let member = self.document(handle)?;
                // The in-memory key wins over the stored one for documents already loaded
                let foreign_key = member.attribute(association.foreign_key_or_default());
                if !member.is_destroyed() && foreign_key == &key {
                    members.push(handle);
                }
            }
        }

        let proxy = self.proxy_mut(base, association)?;
        proxy.finish_load(members);
        let members = proxy.members();
        for member in members {
            Binding::new(self, base, Arc::clone(association)).bind(member)?;
        }
        Ok(())
    }

    async fn load_many_to_many(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
        key_override: Option<Value>,
    ) -> OdmResult<()> {
        let ids = match key_override {
            Some(Value::Array(ids)) => ids,
            Some(other) => vec![other],
            None => match self.document(base)?.attribute(association.foreign_key_or_default()) {
                Value::Array(ids) => ids.clone(),
                _ => Vec::new(),
            },
        };
        let ids: Vec<Value> = ids.into_iter().filter(|id| !id.is_null()).collect();

        let mut members = Vec::new();
        if !ids.is_empty() {
            let target_model = association.target_type(self.registry())?;
            self.check_mixed(association, &target_model)?;
            members = self.resolve_ids(&target_model, association, &ids, false).await?;
        }

        let proxy = self.proxy_mut(base, association)?;
        proxy.finish_load(members);
        let members = proxy.members();
        for member in members {
            Binding::new(self, base, Arc::clone(association)).bind(member)?;
        }
        Ok(())
    }

    /// Documents for a list of keys: identity-map hits first, the rest in one fetch.
    /// With an `order` option every key is fetched so the stored order applies.
    async fn resolve_ids(
        &mut self,
        target_model: &str,
        association: &Association,
        ids: &[Value],
        require_all: bool,
    ) -> OdmResult<Vec<DocHandle>> {
        let primary_key = association.primary_key();
        let ordered = !association.order().is_empty();
        let by_identity = primary_key == ID_FIELD && !ordered;

        let missing: Vec<Value> = ids
            .iter()
            .filter(|id| !by_identity || self.arena.lookup(target_model, id).is_none())
            .cloned()
            .collect();

        let mut fetched = Vec::new();
        if !missing.is_empty() {
            let filter = Filter::any_of(primary_key, missing.clone());
            let request =
                FetchRequest::new(target_model, filter).with_sort(association.order().to_vec());
            for raw in self.store.fetch(request).await? {
                let key = raw.get(primary_key).cloned().unwrap_or(Value::Null);
                let handle = self.instantiate(target_model, raw, None)?;
                fetched.push((key, handle));
            }
        }

        let not_found: Vec<String> = missing
            .iter()
            .filter(|id| !fetched.iter().any(|(key, _)| key == *id))
            .map(id_key)
            .collect();
        if !not_found.is_empty() && (require_all || self.config.raise_not_found_error) {
            return Err(OdmError::DocumentNotFound {
                model: target_model.to_string(),
                ids: not_found,
            });
        }

        if ordered {
            return Ok(fetched.into_iter().map(|(_, handle)| handle).collect());
        }
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let handle = match fetched.iter().find(|(key, _)| key == id) {
                Some((_, handle)) => Some(*handle),
                None if by_identity => self.arena.lookup(target_model, id),
                None => None,
            };
            if let Some(handle) = handle {
                if !handles.contains(&handle) {
                    handles.push(handle);
                }
            }
        }
        Ok(handles)
    }

    /// Build the in-memory children of an embedded relation from the parent's
    /// stored attributes, once
    pub(crate) fn materialize_embedded(
        &mut self,
        parent: DocHandle,
        association: &Arc<Association>,
    ) -> OdmResult<()> {
        if let Some(proxy) = self.document(parent)?.relation_proxy(association.name()) {
            if proxy.is_loaded() {
                return Ok(());
            }
        }
        let raw = self
            .document(parent)?
            .attributes()
            .get(association.storage_key())
            .cloned()
            .unwrap_or(Value::Null);
        self.build_embedded_from(parent, association, raw)
    }

    /// Replace an embedded relation's children with documents built from `raw`
    fn build_embedded_from(
        &mut self,
        parent: DocHandle,
        association: &Arc<Association>,
        raw: Value,
    ) -> OdmResult<()> {
        let parent_document = self.document(parent)?;
        let persisted = parent_document.is_persisted();
        let filter = parent_document
            .projection()
            .map(|projection| projection.for_association(association.storage_key()))
            .unwrap_or(AssociationFilter::Unfiltered);

        let entries: Vec<RawDocument> = match raw {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        };
        let entries = if association.kind().is_many() {
            entries
        } else {
            entries.into_iter().take(1).collect()
        };

        let mut children = Vec::with_capacity(entries.len());
        for (position, entry) in entries.into_iter().enumerate() {
            let model = match entry.get("_type") {
                Some(Value::String(type_name)) => {
                    self.registry().resolve_type(type_name, association.owner())?
                }
                _ => association.target_type(self.registry())?,
            };
            let (attributes, projection) = match &filter {
                AssociationFilter::Unfiltered => (entry, None),
                AssociationFilter::Fields(projection) => {
                    (projection.apply(&entry), Some(projection.clone()))
                }
            };
            let mut document = Document::new(model, attributes);
            document.persisted = persisted;
            document.projection = projection;
            if association.kind().is_many() {
                document.position = Some(position);
            }
            self.callbacks.run_callbacks(CallbackKind::Initialize, &document)?;
            let handle = self.arena.insert_embedded(
                document,
                EmbeddedParent {
                    handle: parent,
                    relation: association.name().to_string(),
                },
            );
            children.push(handle);
        }

        let proxy = self.proxy_mut(parent, association)?;
        if association.kind().is_many() {
            proxy.replace(children.clone());
        } else {
            proxy.set_one(children.first().copied());
        }
        for child in children {
            Binding::new(self, parent, Arc::clone(association)).bind(child)?;
            self.callbacks.run_pending_callbacks(self.arena.get(child)?)?;
        }
        Ok(())
    }

    /// Current single target without fetching when the key already says enough
    async fn current_one(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
    ) -> OdmResult<Option<DocHandle>> {
        if let Some(proxy) = self.document(base)?.relation_proxy(association.name()) {
            if proxy.is_loaded() {
                return Ok(proxy.one());
            }
        }
        match association.kind() {
            RelationKind::BelongsTo => {
                let document = self.document(base)?;
                let key = document.attribute(association.foreign_key_or_default());
                if key.is_null() {
                    return Ok(None);
                }
                let model = match association.type_field().map(|field| document.attribute(field)) {
                    Some(Value::String(type_name)) if association.is_polymorphic() => {
                        type_name.clone()
                    }
                    _ if association.is_polymorphic() => return Ok(None),
                    _ => association.target_type(self.registry())?,
                };
                Ok(self.arena.lookup(&model, key))
            }
            RelationKind::HasOne if !self.document(base)?.is_persisted() => Ok(None),
            _ => Ok(self
                .without_autobuild()
                .get_relation(base, association.name(), None, false)
                .await?
                .one()),
        }
    }

    /// Setter: replace the target(s) of a relation
    pub async fn set(&mut self, base: DocHandle, name: &str, value: Relation) -> OdmResult<()> {
        let association = self.association_of(base, name)?;
        match (value, association.kind().is_many()) {
            (Relation::One(target), false) => {
                self.assign_one(base, &association, target, true).await
            }
            (Relation::One(target), true) => {
                let targets = target.into_iter().collect();
                self.assign_many(base, &association, targets, true).await
            }
            (Relation::Many(targets), true) => {
                self.assign_many(base, &association, targets, true).await
            }
            (Relation::Many(_), false) => Err(OdmError::WrongTargetType {
                owner: association.owner().to_string(),
                name: name.to_string(),
                expected: association.class_name().to_string(),
                actual: "a collection".to_string(),
            }),
        }
    }

    /// Setter for single-document relations; `None` clears the relation
    pub async fn set_one(
        &mut self,
        base: DocHandle,
        name: &str,
        target: Option<DocHandle>,
    ) -> OdmResult<()> {
        self.set(base, name, Relation::One(target)).await
    }

    async fn assign_one(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
        target: Option<DocHandle>,
        persist: bool,
    ) -> OdmResult<()> {
        if let Some(target) = target {
            self.check_target(base, association, target)?;
        }
        if association.kind().embeds() {
            self.materialize_embedded(base, association)?;
        }

        let previous = self.current_one(base, association).await?;
        if previous == target {
            self.proxy_mut(base, association)?.set_one(target);
            if let Some(target) = target {
                Binding::new(self, base, Arc::clone(association)).bind(target)?;
            }
            return Ok(());
        }

        let base_persisted = self.document(base)?.is_persisted();
        if let Some(old) = previous {
            Binding::new(self, base, Arc::clone(association)).unbind(old)?;
            match association.kind() {
                RelationKind::HasOne
                    if persist && base_persisted && self.document(old)?.is_persisted() =>
                {
                    self.release(association, old).await?;
                }
                RelationKind::EmbedsOne => self.document_mut(old)?.destroyed = true,
                _ => {}
            }
        }

        self.proxy_mut(base, association)?.set_one(target);
        match target {
            Some(target) => {
                Binding::new(self, base, Arc::clone(association)).bind(target)?;
                let saves_target =
                    matches!(association.kind(), RelationKind::HasOne | RelationKind::EmbedsOne);
                if persist && base_persisted && saves_target {
                    self.save(target).await?;
                }
            }
            None if persist && base_persisted && association.kind() == RelationKind::EmbedsOne => {
                self.save(base).await?;
            }
            None => {}
        }
        Ok(())
    }

    /// A persisted document leaving a has_one / has_many: removed per the
    /// relation's dependent strategy, otherwise saved with its key cleared
    async fn release(&mut self, association: &Association, member: DocHandle) -> OdmResult<()> {
        match association.dependent() {
            Some(DependentStrategy::Destroy) => {
                self.destroy(member).await?;
            }
            Some(DependentStrategy::DeleteAll) => self.delete(member).await?,
            _ => self.save(member).await?,
        }
        Ok(())
    }

    async fn assign_many(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
        targets: Vec<DocHandle>,
        persist: bool,
    ) -> OdmResult<()> {
        for target in &targets {
            self.check_target(base, association, *target)?;
        }
        let current = self.without_autobuild().relation_members(base, association.name()).await?;
        let base_persisted = self.document(base)?.is_persisted();

        for old in current.iter().copied().filter(|old| !targets.contains(old)) {
            Binding::new(self, base, Arc::clone(association)).unbind(old)?;
            let old_persisted = self.document(old)?.is_persisted();
            match association.kind() {
                RelationKind::HasMany if persist && base_persisted && old_persisted => {
                    self.release(association, old).await?;
                }
                RelationKind::HasAndBelongsToMany if persist && base_persisted && old_persisted => {
                    self.save(old).await?;
                }
                RelationKind::EmbedsMany => self.document_mut(old)?.destroyed = true,
                _ => {}
            }
        }

        let mut unique = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }
        self.proxy_mut(base, association)?.replace(unique.clone());
        for target in &unique {
            Binding::new(self, base, Arc::clone(association)).bind(*target)?;
        }
        if association.kind() == RelationKind::EmbedsMany {
            self.reindex(base, association.name())?;
        }

        if persist && base_persisted {
            match association.kind() {
                RelationKind::HasMany => {
                    for target in &unique {
                        self.save(*target).await?;
                    }
                }
                RelationKind::HasAndBelongsToMany => {
                    for target in &unique {
                        self.save(*target).await?;
                    }
                    self.save(base).await?;
                }
                RelationKind::EmbedsMany => self.save(base).await?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Append to a collection relation
    pub async fn push(&mut self, base: DocHandle, name: &str, target: DocHandle) -> OdmResult<()> {
        let association = self.association_of(base, name)?;
        if !association.kind().is_many() {
            return self.assign_one(base, &association, Some(target), true).await;
        }
        self.append(base, &association, target, true).await
    }

    async fn append(
        &mut self,
        base: DocHandle,
        association: &Arc<Association>,
        target: DocHandle,
        persist: bool,
    ) -> OdmResult<()> {
        self.check_target(base, association, target)?;
        if association.kind().embeds() {
            self.materialize_embedded(base, association)?;
        }

        self.proxy_mut(base, association)?.push(target);
        Binding::new(self, base, Arc::clone(association)).bind(target)?;

        if !persist || !self.document(base)?.is_persisted() {
            return Ok(());
        }
        match association.kind() {
            RelationKind::HasMany | RelationKind::EmbedsMany => self.save(target).await?,
            RelationKind::HasAndBelongsToMany => {
                self.save(target).await?;
                self.save(base).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Detach one member from a collection relation; returns whether it was a member
    pub async fn remove(
        &mut self,
        base: DocHandle,
        name: &str,
        target: DocHandle,
    ) -> OdmResult<bool> {
        let association = self.association_of(base, name)?;
        if association.kind().embeds() {
            self.materialize_embedded(base, &association)?;
        }

        let in_proxy = self.proxy_mut(base, &association)?.remove(target);
        let member = in_proxy || self.references(base, &association, target)?;
        if !member {
            return Ok(false);
        }

        Binding::new(self, base, Arc::clone(&association)).unbind(target)?;
        let base_persisted = self.document(base)?.is_persisted();
        let target_persisted = self.document(target)?.is_persisted();

        match association.kind() {
            RelationKind::EmbedsMany | RelationKind::EmbedsOne => {
                self.reindex(base, association.name())?;
                self.document_mut(target)?.destroyed = true;
                if base_persisted {
                    self.save(base).await?;
                }
            }
            RelationKind::HasMany | RelationKind::HasOne if base_persisted && target_persisted => {
                self.release(&association, target).await?;
            }
            RelationKind::HasAndBelongsToMany if base_persisted => {
                if target_persisted {
                    self.save(target).await?;
                }
                self.save(base).await?;
            }
            _ => {}
        }
        Ok(true)
    }

    /// Whether the stored keys link `target` to `base` through the relation
    fn references(
        &self,
        base: DocHandle,
        association: &Association,
        target: DocHandle,
    ) -> OdmResult<bool> {
        let base_document = self.document(base)?;
        let target_document = self.document(target)?;
        Ok(match association.kind() {
            RelationKind::HasOne | RelationKind::HasMany => {
                let key = base_document.attribute(association.primary_key());
                let foreign_key = target_document.attribute(association.foreign_key_or_default());
                !key.is_null() && foreign_key == key
            }
            RelationKind::HasAndBelongsToMany => {
                match base_document.attribute(association.foreign_key_or_default()) {
                    Value::Array(ids) => {
                        ids.contains(target_document.attribute(association.primary_key()))
                    }
                    _ => false,
                }
            }
            _ => false,
        })
    }

    /// Detach every member
    pub async fn clear(&mut self, base: DocHandle, name: &str) -> OdmResult<()> {
        let members = self.without_autobuild().relation_members(base, name).await?;
        for member in members {
            self.remove(base, name, member).await?;
        }
        let association = self.association_of(base, name)?;
        self.clear_proxy(base, association.name())
    }

    /// Clear the foreign keys linking targets to `base` without removing the targets
    pub async fn nullify(&mut self, base: DocHandle, name: &str) -> OdmResult<()> {
        let association = self.association_of(base, name)?;
        match association.kind() {
            RelationKind::HasOne | RelationKind::HasMany => {
                let in_memory = self
                    .document(base)?
                    .relation_proxy(name)
                    .map(|proxy| proxy.members())
                    .unwrap_or_default();

                if self.document(base)?.is_persisted() {
                    let target = association.target_type(self.registry())?;
                    let filter = self.referenced_filter(base, &association)?;
                    let mut changes = RawDocument::new();
                    changes.insert(association.foreign_key_or_default().to_string(), Value::Null);
                    let type_field =
                        association.type_field().filter(|_| association.role().is_some());
                    if let Some(type_field) = type_field {
                        changes.insert(type_field.to_string(), Value::Null);
                    }
                    let updated = self.store.update_matching(&target, filter, changes).await?;
                    debug!(
                        "Nullified {} {} document(s) of {}#{}",
                        updated,
                        target,
                        association.owner(),
                        name
                    );
                }
                for member in in_memory {
                    Binding::new(self, base, Arc::clone(&association)).unbind(member)?;
                }
                self.clear_proxy(base, name)
            }
            RelationKind::HasAndBelongsToMany => {
                let members = self.without_autobuild().relation_members(base, name).await?;
                let base_persisted = self.document(base)?.is_persisted();
                for member in members {
                    Binding::new(self, base, Arc::clone(&association)).unbind(member)?;
                    if base_persisted && self.document(member)?.is_persisted() {
                        self.save(member).await?;
                    }
                }
                if !self.document(base)?.is_immutable() {
                    let foreign_key = association.foreign_key_or_default();
                    self.document_mut(base)?.set_attribute(foreign_key, Value::Array(Vec::new()));
                }
                self.clear_proxy(base, name)
            }
            RelationKind::BelongsTo => {
                if let Some(current) = self.current_one(base, &association).await? {
                    Binding::new(self, base, Arc::clone(&association)).unbind(current)?;
                } else if !self.document(base)?.is_immutable() {
                    self.document_mut(base)?
                        .set_attribute(association.foreign_key_or_default(), Value::Null);
                }
                self.clear_proxy(base, name)
            }
            _ => Err(OdmError::UndefinedProxyMethod {
                relation: format!("{}#{}", association.owner(), name),
                method: ProxyMethod::Nullify.name().to_string(),
            }),
        }
    }

    /// Delete every member without callbacks or cascades; returns how many went
    pub async fn delete_all(&mut self, base: DocHandle, name: &str) -> OdmResult<usize> {
        let members = self.without_autobuild().relation_members(base, name).await?;
        let mut removed = 0;
        for member in members {
            if !self.document(member)?.is_destroyed() {
                self.delete(member).await?;
                removed += 1;
            }
        }
        self.clear_proxy(base, name)?;
        Ok(removed)
    }

    /// Loaded member handles of any relation
    pub(crate) async fn relation_members(
        &mut self,
        base: DocHandle,
        name: &str,
    ) -> OdmResult<Vec<DocHandle>> {
        Ok(self.get_relation(base, name, None, false).await?.into_handles())
    }

    /// Existence check; never autobuilds
    pub async fn exists(&mut self, base: DocHandle, name: &str) -> OdmResult<bool> {
        let relation = self.without_autobuild().get_relation(base, name, None, false).await?;
        Ok(!relation.is_empty())
    }

    /// Builder: new target attached in memory, not saved
    pub async fn build(
        &mut self,
        base: DocHandle,
        name: &str,
        attributes: RawDocument,
    ) -> OdmResult<DocHandle> {
        let association = self.association_of(base, name)?;
        if association.kind() == RelationKind::EmbeddedIn {
            return Err(OdmError::UndefinedProxyMethod {
                relation: format!("{}#{}", association.owner(), name),
                method: ProxyMethod::Build(RawDocument::new()).name().to_string(),
            });
        }
        let target_model = association.target_type(self.registry())?;
        let target = self.new_document(&target_model, attributes)?;

        if association.kind().is_many() {
            self.append(base, &association, target, false).await?;
        } else {
            self.assign_one(base, &association, Some(target), false).await?;
        }
        self.callbacks.run_callbacks(CallbackKind::Build, self.arena.get(target)?)?;
        debug!("Built {} through {}#{}", target_model, association.owner(), name);
        Ok(target)
    }

    /// Creator: build, then save
    pub async fn create(
        &mut self,
        base: DocHandle,
        name: &str,
        attributes: RawDocument,
    ) -> OdmResult<DocHandle> {
        let association = self.association_of(base, name)?;
        let requires_saved_base =
            !matches!(association.kind(), RelationKind::BelongsTo | RelationKind::EmbeddedIn);
        if requires_saved_base && self.document(base)?.is_new_record() {
            return Err(OdmError::UnsavedDocument {
                base: self.document(base)?.model().to_string(),
                document: association.class_name().to_string(),
            });
        }

        let target = self.build(base, name, attributes).await?;
        self.save(target).await?;
        if association.kind() == RelationKind::HasAndBelongsToMany {
            self.save(base).await?;
        }
        Ok(target)
    }

    /// Keys of the members of a collection relation
    pub async fn ids(&mut self, base: DocHandle, name: &str) -> OdmResult<Vec<Value>> {
        let association = self.association_of(base, name)?;
        match association.kind() {
            RelationKind::HasAndBelongsToMany => {
                let loaded = self
                    .document(base)?
                    .relation_proxy(name)
                    .map_or(false, |proxy| proxy.is_loaded());
                if !loaded {
                    let foreign_key = association.foreign_key_or_default();
                    return Ok(match self.document(base)?.attribute(foreign_key) {
                        Value::Array(ids) => ids.clone(),
                        _ => Vec::new(),
                    });
                }
            }
            RelationKind::HasMany | RelationKind::EmbedsMany => {}
            _ => {
                return Err(OdmError::UndefinedProxyMethod {
                    relation: format!("{}#{}", association.owner(), name),
                    method: ProxyMethod::Ids.name().to_string(),
                })
            }
        }

        let members = self.without_autobuild().relation_members(base, name).await?;
        members
            .into_iter()
            .map(|member| Ok(self.document(member)?.attribute(association.primary_key()).clone()))
            .collect()
    }

    /// Replace a collection relation by key
    pub async fn set_ids(&mut self, base: DocHandle, name: &str, ids: Vec<Value>) -> OdmResult<()> {
        let association = self.association_of(base, name)?;
        let collection =
            matches!(association.kind(), RelationKind::HasMany | RelationKind::HasAndBelongsToMany);
        if !collection {
            return Err(OdmError::UndefinedProxyMethod {
                relation: format!("{}#{}", association.owner(), name),
                method: "ids=".to_string(),
            });
        }
        let target_model = association.target_type(self.registry())?;
        let targets = if ids.is_empty() {
            Vec::new()
        } else {
            self.resolve_ids(&target_model, &association, &ids, true).await?
        };
        self.assign_many(base, &association, targets, true).await
    }

    /// Cache key of a relation: `<collection>/<count>[-<latest updated_at>]`.
    ///
    /// Loaded relations are summarized in memory; unloaded referenced
    /// collections use the store's aggregate so nothing is materialized.
    pub async fn cache_key(&mut self, base: DocHandle, name: &str) -> OdmResult<String> {
        let association = self.association_of(base, name)?;
        let proxy_state = self
            .document(base)?
            .relation_proxy(name)
            .map(|proxy| (proxy.is_loaded(), proxy.has_additions()));
        let unloaded = !matches!(proxy_state, Some((true, _)) | Some((_, true)));

        let (target_model, count, latest) = if unloaded
            && matches!(association.kind(), RelationKind::HasOne | RelationKind::HasMany)
            && self.document(base)?.is_persisted()
        {
            let target = association.target_type(self.registry())?;
            let filter = self.referenced_filter(base, &association)?;
            let stats = self.store.aggregate(&target, filter).await?;
            (target, stats.count, stats.latest_updated_at)
        } else {
            let members = self.without_autobuild().relation_members(base, name).await?;
            let mut latest: Option<DateTime<Utc>> = None;
            let mut target = None;
            for member in &members {
                let document = self.document(*member)?;
                target.get_or_insert_with(|| document.model().to_string());
                if let Value::String(raw) = document.attribute(UPDATED_AT_FIELD) {
                    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
                        let time = time.with_timezone(&Utc);
                        latest = Some(latest.map_or(time, |current| current.max(time)));
                    }
                }
            }
            let target = match target {
                Some(target) => target,
                None => association.class_name().to_string(),
            };
            (target, members.len(), latest)
        };

        let collection = collection_name(&target_model);
        Ok(match latest {
            Some(time) => format!("{}/{}-{}", collection, count, time.format("%Y%m%d%H%M%S%9f")),
            None => format!("{collection}/{count}"),
        })
    }

    /// Relation-level validation: required belongs_to targets and the validity
    /// of loaded targets of validated relations. Errors are also recorded on
    /// the document.
    pub async fn validate_relations(
        &mut self,
        handle: DocHandle,
    ) -> OdmResult<Vec<ValidationError>> {
        let model = self.document(handle)?.model().to_string();
        let definition = self.registry().require(&model)?;
        let required_by_default = self.config.belongs_to_required_by_default;

        let mut errors = Vec::new();
        for association in definition.associations() {
            if association.is_required(required_by_default) {
                let target = self
                    .without_autobuild()
                    .get_relation(handle, association.name(), None, false)
                    .await?
                    .one();
                if target.is_none() {
                    errors.push(ValidationError::new(association.name(), "must exist"));
                }
            }

            if association.is_validated() {
                let members = match self.document(handle)?.relation_proxy(association.name()) {
                    Some(proxy) if proxy.is_loaded() || proxy.has_additions() => proxy.members(),
                    _ => continue,
                };
                for member in members {
                    if !self.document(member)?.is_valid() {
                        errors.push(ValidationError::new(association.name(), "is invalid"));
                        break;
                    }
                }
            }
        }

        self.document_mut(handle)?.errors.extend(errors.iter().cloned());
        Ok(errors)
    }

    /// Forward a collection-style operation through a relation proxy
    pub async fn forward(
        &mut self,
        base: DocHandle,
        name: &str,
        method: ProxyMethod,
    ) -> OdmResult<ProxyOutput> {
        let association = self.association_of(base, name)?;
        if !forwards(association.kind(), &method) {
            return Err(OdmError::UndefinedProxyMethod {
                relation: format!("{}#{}", association.owner(), name),
                method: method.name().to_string(),
            });
        }

        Ok(match method {
            ProxyMethod::Count => ProxyOutput::Count(self.count(base, &association).await?),
            ProxyMethod::Size => {
                let members = self.without_autobuild().relation_members(base, name).await?;
                ProxyOutput::Count(members.len())
            }
            ProxyMethod::IsEmpty => {
                ProxyOutput::Bool(self.relation_is_empty(base, &association).await?)
            }
            ProxyMethod::Exists => ProxyOutput::Bool(self.exists(base, name).await?),
            ProxyMethod::First => {
                let members = self.without_autobuild().relation_members(base, name).await?;
                ProxyOutput::Document(members.first().copied())
            }
            ProxyMethod::Last => {
                let members = self.without_autobuild().relation_members(base, name).await?;
                ProxyOutput::Document(members.last().copied())
            }
            ProxyMethod::Ids => ProxyOutput::Ids(self.ids(base, name).await?),
            ProxyMethod::Include(target) => {
                let members = self.without_autobuild().relation_members(base, name).await?;
                ProxyOutput::Bool(members.contains(&target))
            }
            ProxyMethod::Find(id) => {
                let members = self.without_autobuild().relation_members(base, name).await?;
                let mut found = None;
                for member in members {
                    if self.document(member)?.id() == &id {
                        found = Some(member);
                        break;
                    }
                }
                if found.is_none() && self.config.raise_not_found_error {
                    return Err(OdmError::DocumentNotFound {
                        model: association.class_name().to_string(),
                        ids: vec![id_key(&id)],
                    });
                }
                ProxyOutput::Document(found)
            }
            ProxyMethod::Push(target) => {
                self.push(base, name, target).await?;
                ProxyOutput::Unit
            }
            ProxyMethod::Delete(target) => {
                ProxyOutput::Bool(self.remove(base, name, target).await?)
            }
            ProxyMethod::Clear => {
                self.clear(base, name).await?;
                ProxyOutput::Unit
            }
            ProxyMethod::Nullify => {
                self.nullify(base, name).await?;
                ProxyOutput::Unit
            }
            ProxyMethod::Reload => ProxyOutput::Relation(self.reload_relation(base, name).await?),
            ProxyMethod::Build(attributes) => {
                ProxyOutput::Document(Some(self.build(base, name, attributes).await?))
            }
            ProxyMethod::Create(attributes) => {
                ProxyOutput::Document(Some(self.create(base, name, attributes).await?))
            }
        })
    }

    /// Stored count plus unsaved additions, without loading an unloaded collection
    async fn count(&mut self, base: DocHandle, association: &Arc<Association>) -> OdmResult<usize> {
        let additions = match self.document(base)?.relation_proxy(association.name()) {
            Some(proxy) if proxy.is_loaded() => return Ok(proxy.members().len()),
            Some(proxy) => proxy.members(),
            None => Vec::new(),
        };

        match association.kind() {
            RelationKind::HasMany if self.document(base)?.is_persisted() => {
                let target = association.target_type(self.registry())?;
                let filter = self.referenced_filter(base, association)?;
                let stored = self.store.aggregate(&target, filter).await?.count;
                let mut unsaved = 0;
                for added in additions {
                    if self.document(added)?.is_new_record() {
                        unsaved += 1;
                    }
                }
                Ok(stored + unsaved)
            }
            RelationKind::HasAndBelongsToMany => {
                Ok(self.ids(base, association.name()).await?.len())
            }
            _ => {
                let members =
                    self.without_autobuild().relation_members(base, association.name()).await?;
                Ok(members.len())
            }
        }
    }

    /// Rewrite the positions of an embedded collection after a change
    pub(crate) fn reindex(&mut self, parent: DocHandle, name: &str) -> OdmResult<()> {
        let members = match self.document(parent)?.relation_proxy(name) {
            Some(proxy) if proxy.association().kind() == RelationKind::EmbedsMany => {
                proxy.members()
            }
            _ => return Ok(()),
        };
        for (position, member) in members.into_iter().enumerate() {
            self.document_mut(member)?.position = Some(position);
        }
        Ok(())
    }

    /// Mark a relation loaded and empty
    pub(crate) fn clear_proxy(&mut self, base: DocHandle, name: &str) -> OdmResult<()> {
        let association = self.association_of(base, name)?;
        let proxy = self.proxy_mut(base, &association)?;
        if association.kind().is_many() {
            proxy.replace(Vec::new());
        } else {
            proxy.set_one(None);
        }
        Ok(())
    }
}
