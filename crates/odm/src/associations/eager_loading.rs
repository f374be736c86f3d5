//! Eager loading - batched preloading of relations over a set of base documents
//!
//! Inclusions are processed breadth-first by owner type. An inclusion nested
//! under other inclusions waits until all of its parents have produced
//! documents. Each relation kind loads with one chunked `In` fetch per target
//! type, skipping documents the identity map already holds, then sets and
//! binds the proxies exactly as individual loading would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::binding::Binding;
use super::metadata::{Association, RelationKind};
use crate::backends::{FetchRequest, Filter};
use crate::document::{id_key, DocHandle, ID_FIELD};
use crate::error::{OdmError, OdmResult};
use crate::model::ModelRegistry;
use crate::session::Session;

/// One relation to preload, with the inclusion names it is nested under
#[derive(Debug, Clone)]
pub struct Inclusion {
    pub association: Arc<Association>,
    pub parent_inclusions: Vec<String>,
}

impl Inclusion {
    pub fn new(association: Arc<Association>) -> Self {
        Self {
            association,
            parent_inclusions: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_inclusions.push(parent.into());
        self
    }

    fn is_top_level(&self) -> bool {
        self.parent_inclusions.is_empty()
    }
}

/// Parser for dotted include paths (`"posts.comments"`)
pub struct IncludeTree;

impl IncludeTree {
    pub fn parse(
        registry: &ModelRegistry,
        base_model: &str,
        paths: &[&str],
    ) -> OdmResult<Vec<Inclusion>> {
        let mut inclusions: Vec<Inclusion> = Vec::new();

        for path in paths {
            let mut model = base_model.to_string();
            let mut parent: Option<&str> = None;
            let segments: Vec<&str> =
                path.split('.').filter(|segment| !segment.is_empty()).collect();

            for (depth, segment) in segments.iter().enumerate() {
                let association = registry.require(&model)?.require_association(segment)?;

                let existing = inclusions.iter().position(|inclusion| {
                    Arc::ptr_eq(&inclusion.association, &association)
                        && inclusion.is_top_level() == parent.is_none()
                });
                match (existing, parent) {
                    (Some(index), Some(parent)) => {
                        let parents = &mut inclusions[index].parent_inclusions;
                        if !parents.iter().any(|existing| existing == parent) {
                            parents.push(parent.to_string());
                        }
                    }
                    (Some(_), None) => {}
                    (None, parent) => {
                        let inclusion = Inclusion::new(Arc::clone(&association));
                        inclusions.push(match parent {
                            Some(parent) => inclusion.with_parent(parent),
                            None => inclusion,
                        });
                    }
                }

                if depth + 1 < segments.len() {
                    model = association.target_type(registry)?;
                }
                parent = Some(*segment);
            }
        }
        Ok(inclusions)
    }
}

impl Session {
    /// Preload `inclusions` for `bases`, returning the bases unchanged
    pub async fn preload(
        &mut self,
        inclusions: &[Inclusion],
        bases: &[DocHandle],
    ) -> OdmResult<Vec<DocHandle>> {
        if inclusions.is_empty() || bases.is_empty() {
            return Ok(bases.to_vec());
        }

        let base_model = self.document(bases[0])?.model().to_string();
        let max_depth = self.config.max_inclusion_depth;
        let mut docs_map: HashMap<String, Vec<DocHandle>> = HashMap::new();
        let mut processed: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(base_model.clone(), 1)]);

        while let Some((owner, depth)) = queue.pop_front() {
            if depth > max_depth {
                warn!("Eager loading stopped at depth {} (max {})", depth, max_depth);
                break;
            }

            for (index, inclusion) in inclusions.iter().enumerate() {
                if processed.contains(&index) || inclusion.association.owner() != owner {
                    continue;
                }

                let sources = if inclusion.is_top_level() {
                    if owner != base_model {
                        continue;
                    }
                    bases.to_vec()
                } else {
                    // Deferred until every parent has produced documents
                    let ready = inclusion
                        .parent_inclusions
                        .iter()
                        .all(|parent| docs_map.contains_key(parent));
                    if !ready {
                        continue;
                    }
                    let mut sources = Vec::new();
                    for parent in &inclusion.parent_inclusions {
                        for handle in &docs_map[parent] {
                            let same_owner = self.document(*handle)?.model() == owner;
                            if !sources.contains(handle) && same_owner {
                                sources.push(*handle);
                            }
                        }
                    }
                    sources
                };
                processed.insert(index);

                let association = Arc::clone(&inclusion.association);
                let loaded = self.preload_inclusion(&association, &sources).await?;
                debug!(
                    "Preloaded {} {} document(s) for {}#{}",
                    loaded.len(),
                    association.class_name(),
                    association.owner(),
                    association.name()
                );

                let mut next_types = Vec::new();
                for handle in &loaded {
                    let model = self.document(*handle)?.model().to_string();
                    if !next_types.contains(&model) {
                        next_types.push(model);
                    }
                }
                if next_types.is_empty() && !association.is_polymorphic() {
                    next_types.push(association.target_type(self.registry())?);
                }

                let entry = docs_map.entry(association.name().to_string()).or_default();
                for handle in loaded {
                    if !entry.contains(&handle) {
                        entry.push(handle);
                    }
                }
                for model in next_types {
                    queue.push_back((model, depth + 1));
                }
            }
        }

        let skipped = inclusions.len() - processed.len();
        if skipped > 0 {
            warn!("{} inclusion(s) were never reached while eager loading", skipped);
        }
        Ok(bases.to_vec())
    }

    async fn preload_inclusion(
        &mut self,
        association: &Arc<Association>,
        sources: &[DocHandle],
    ) -> OdmResult<Vec<DocHandle>> {
        let mut live = Vec::with_capacity(sources.len());
        for source in sources {
            if !self.document(*source)?.is_destroyed() {
                live.push(*source);
            }
        }

        match association.kind() {
            RelationKind::EmbedsOne | RelationKind::EmbedsMany => {
                let mut loaded = Vec::new();
                for source in live {
                    self.materialize_embedded(source, association)?;
                    if let Some(proxy) = self.document(source)?.relation_proxy(association.name()) {
                        loaded.extend(proxy.members());
                    }
                }
                Ok(loaded)
            }
            RelationKind::EmbeddedIn => {
                let mut loaded = Vec::new();
                for source in live {
                    let parent =
                        self.document(source)?.embedded_parent().map(|parent| parent.handle);
                    self.proxy_mut(source, association)?.set_one(parent);
                    if let Some(parent) = parent {
                        if !loaded.contains(&parent) {
                            loaded.push(parent);
                        }
                    }
                }
                Ok(loaded)
            }
            _ => {
                // Loaded proxies keep their in-memory members
                let mut loaded = Vec::new();
                let mut pending = Vec::new();
                for source in live {
                    match self.document(source)?.relation_proxy(association.name()) {
                        Some(proxy) if proxy.is_loaded() => loaded.extend(proxy.members()),
                        _ => pending.push(source),
                    }
                }

                let fetched = match association.kind() {
                    RelationKind::BelongsTo => {
                        self.preload_belongs_to(association, &pending).await?
                    }
                    RelationKind::HasAndBelongsToMany => {
                        self.preload_many_to_many(association, &pending).await?
                    }
                    _ => self.preload_referenced_many(association, &pending).await?,
                };
                for handle in fetched {
                    if !loaded.contains(&handle) {
                        loaded.push(handle);
                    }
                }
                Ok(loaded)
            }
        }
    }

    /// Chunked `In` fetch of the keys the identity map does not already hold
    async fn fetch_keys(
        &mut self,
        model: &str,
        field: &str,
        keys: Vec<Value>,
    ) -> OdmResult<Vec<DocHandle>> {
        let batch_size = self.config.preload_batch_size.max(1);
        let mut handles = Vec::new();
        for chunk in keys.chunks(batch_size) {
            let request = FetchRequest::new(model, Filter::any_of(field, chunk.to_vec()));
            for raw in self.store.fetch(request).await? {
                handles.push(self.instantiate(model, raw, None)?);
            }
        }
        Ok(handles)
    }

    async fn preload_belongs_to(
        &mut self,
        association: &Arc<Association>,
        sources: &[DocHandle],
    ) -> OdmResult<Vec<DocHandle>> {
        let primary_key = association.primary_key();
        let foreign_key = association.foreign_key_or_default();

        // (source, target type, key) for every source with a key set
        let mut pending: Vec<(DocHandle, String, Value)> = Vec::new();
        let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
        for source in sources {
            let document = self.document(*source)?;
            let key = document.attribute(foreign_key).clone();
            let model = if key.is_null() {
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

            let Some(model) = model else {
                self.proxy_mut(*source, association)?.set_one(None);
                continue;
            };
            match groups.iter_mut().find(|(group, _)| *group == model) {
                Some((_, keys)) => {
                    if !keys.contains(&key) {
                        keys.push(key.clone());
                    }
                }
                None => groups.push((model.clone(), vec![key.clone()])),
            }
            pending.push((*source, model, key));
        }

        let mut found: HashMap<(String, String), DocHandle> = HashMap::new();
        for (model, keys) in groups {
            self.check_mixed_for_preload(association, &model)?;
            let mut missing = Vec::new();
            for key in keys {
                match self.lookup_by_key(&model, primary_key, &key) {
                    Some(hit) => {
                        found.insert((model.clone(), id_key(&key)), hit);
                    }
                    None => missing.push(key),
                }
            }
            for handle in self.fetch_keys(&model, primary_key, missing).await? {
                let key = self.document(handle)?.attribute(primary_key).clone();
                found.insert((model.clone(), id_key(&key)), handle);
            }
        }

        let mut loaded = Vec::new();
        let mut not_found = Vec::new();
        for (source, model, key) in pending {
            let target = found.get(&(model.clone(), id_key(&key))).copied();
            self.proxy_mut(source, association)?.set_one(target);
            match target {
                Some(target) => {
                    Binding::new(self, source, Arc::clone(association)).bind(target)?;
                    if !loaded.contains(&target) {
                        loaded.push(target);
                    }
                }
                None => not_found.push((model, id_key(&key))),
            }
        }

        if let Some((model, _)) = not_found.first() {
            if self.config.raise_not_found_error {
                return Err(OdmError::DocumentNotFound {
                    model: model.clone(),
                    ids: not_found.iter().map(|(_, id)| id.clone()).collect(),
                });
            }
            warn!(
                "{} {} target(s) of {} were not found",
                not_found.len(),
                model,
                association.name()
            );
        }
        Ok(loaded)
    }

    async fn preload_referenced_many(
        &mut self,
        association: &Arc<Association>,
        sources: &[DocHandle],
    ) -> OdmResult<Vec<DocHandle>> {
        let target_model = association.target_type(self.registry())?;
        self.check_mixed_for_preload(association, &target_model)?;
        let primary_key = association.primary_key();
        let foreign_key = association.foreign_key_or_default();

        let mut keys = Vec::new();
        for source in sources {
            let document = self.document(*source)?;
            let key = document.attribute(primary_key);
            if document.is_persisted() && !key.is_null() && !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let batch_size = self.config.preload_batch_size.max(1);
        let mut fetched = Vec::new();
        for chunk in keys.chunks(batch_size) {
            let mut filter = Filter::any_of(foreign_key, chunk.to_vec());
            if let (Some(type_field), Some(_)) = (association.type_field(), association.role()) {
                let owner = Value::String(association.owner().to_string());
                filter = filter.and(Filter::eq(type_field, owner));
            }
            let request =
                FetchRequest::new(&target_model, filter).with_sort(association.order().to_vec());
            for raw in self.store.fetch(request).await? {
                let handle = self.instantiate(&target_model, raw, None)?;
                if !fetched.contains(&handle) {
                    fetched.push(handle);
                }
            }
        }

        // Group by the in-memory key so reassigned documents land with their new owner
        let mut grouped: HashMap<String, Vec<DocHandle>> = HashMap::new();
        for handle in &fetched {
            let document = self.document(*handle)?;
            if document.is_destroyed() {
                continue;
            }
            let key = document.attribute(foreign_key);
            if !key.is_null() {
                grouped.entry(id_key(key)).or_default().push(*handle);
            }
        }

        let mut loaded = Vec::new();
        for source in sources {
            let key = id_key(self.document(*source)?.attribute(primary_key));
            let members = if self.document(*source)?.is_persisted() {
                grouped.get(&key).cloned().unwrap_or_default()
            } else {
                Vec::new()
            };

            let proxy = self.proxy_mut(*source, association)?;
            proxy.finish_load(members);
            let members = proxy.members();
            for member in members {
                Binding::new(self, *source, Arc::clone(association)).bind(member)?;
                if !loaded.contains(&member) {
                    loaded.push(member);
                }
            }
        }
        Ok(loaded)
    }

    async fn preload_many_to_many(
        &mut self,
        association: &Arc<Association>,
        sources: &[DocHandle],
    ) -> OdmResult<Vec<DocHandle>> {
        let target_model = association.target_type(self.registry())?;
        self.check_mixed_for_preload(association, &target_model)?;
        let primary_key = association.primary_key();

        let mut per_source: Vec<(DocHandle, Vec<Value>)> = Vec::with_capacity(sources.len());
        let mut missing = Vec::new();
        for source in sources {
            let foreign_key = association.foreign_key_or_default();
            let ids = match self.document(*source)?.attribute(foreign_key) {
                Value::Array(ids) => ids.iter().filter(|id| !id.is_null()).cloned().collect(),
                _ => Vec::new(),
            };
            for id in &ids {
                let known = self.lookup_by_key(&target_model, primary_key, id).is_some();
                if !known && !missing.contains(id) {
                    missing.push(id.clone());
                }
            }
            per_source.push((*source, ids));
        }

        let mut found: HashMap<String, DocHandle> = HashMap::new();
        for handle in self.fetch_keys(&target_model, primary_key, missing).await? {
            let key = self.document(handle)?.attribute(primary_key).clone();
            found.insert(id_key(&key), handle);
        }

        let mut loaded = Vec::new();
        for (source, ids) in per_source {
            let mut members = Vec::new();
            for id in &ids {
                let handle = found
                    .get(&id_key(id))
                    .copied()
                    .or_else(|| self.lookup_by_key(&target_model, primary_key, id));
                if let Some(handle) = handle {
                    if !members.contains(&handle) {
                        members.push(handle);
                    }
                }
            }

            let proxy = self.proxy_mut(source, association)?;
            proxy.finish_load(members);
            let members = proxy.members();
            for member in members {
                Binding::new(self, source, Arc::clone(association)).bind(member)?;
                if !loaded.contains(&member) {
                    loaded.push(member);
                }
            }
        }
        Ok(loaded)
    }

    fn lookup_by_key(&self, model: &str, field: &str, key: &Value) -> Option<DocHandle> {
        if field == ID_FIELD {
            self.arena.lookup(model, key)
        } else {
            None
        }
    }

    fn check_mixed_for_preload(
        &self,
        association: &Association,
        target_model: &str,
    ) -> OdmResult<()> {
        if association.is_cyclic() || !self.registry().require(target_model)?.is_embedded() {
            return Ok(());
        }
        Err(OdmError::MixedRelations {
            root: association.owner().to_string(),
            embedded: target_model.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::options::AssociationOptions;
    use crate::model::ModelDefinition;

    fn registry() -> ModelRegistry {
        let registry = ModelRegistry::new();
        let mut person = ModelDefinition::new("Person");
        person
            .has_many("posts", AssociationOptions::new())
            .unwrap()
            .has_many("drafts", AssociationOptions::new().class_name("Post").inverse_of("author"))
            .unwrap();
        registry.register(person);

        let mut post = ModelDefinition::new("Post");
        post.belongs_to("person", AssociationOptions::new())
            .unwrap()
            .belongs_to(
                "author",
                AssociationOptions::new().class_name("Person").inverse_of("drafts"),
            )
            .unwrap()
            .has_many("comments", AssociationOptions::new())
            .unwrap();
        registry.register(post);

        let mut comment = ModelDefinition::new("Comment");
        comment.belongs_to("post", AssociationOptions::new()).unwrap();
        registry.register(comment);
        registry
    }

    #[test]
    fn test_parse_nested_paths() {
        let registry = registry();
        let inclusions =
            IncludeTree::parse(&registry, "Person", &["posts.comments", "posts"]).unwrap();

        assert_eq!(inclusions.len(), 2);
        assert_eq!(inclusions[0].association.name(), "posts");
        assert!(inclusions[0].parent_inclusions.is_empty());
        assert_eq!(inclusions[1].association.name(), "comments");
        assert_eq!(inclusions[1].parent_inclusions, vec!["posts"]);
    }

    #[test]
    fn test_parse_merges_parents_of_shared_descriptor() {
        let registry = registry();
        let paths = ["posts.comments", "drafts.comments"];
        let inclusions = IncludeTree::parse(&registry, "Person", &paths).unwrap();

        let comments: Vec<_> = inclusions
            .iter()
            .filter(|inclusion| inclusion.association.name() == "comments")
            .collect();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].parent_inclusions, vec!["posts", "drafts"]);
    }

    #[test]
    fn test_parse_rejects_unknown_relation() {
        let registry = registry();
        let err = IncludeTree::parse(&registry, "Person", &["posts.likes"]).unwrap_err();
        assert!(matches!(err, OdmError::UnknownRelation { ref name, .. } if name == "likes"));
    }
}
