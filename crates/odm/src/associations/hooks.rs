//! Definition-time hooks: autosave, counter caches, touch and index requests

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use super::metadata::{Association, RelationKind};
use crate::backends::Filter;
use crate::document::{DocHandle, RawDocument, UPDATED_AT_FIELD};
use crate::error::OdmResult;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Autosave,
    CounterCache,
    Touch,
}

/// Hook registered on a model when a relation declares it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationHook {
    pub relation: String,
    pub kind: HookKind,
}

/// Index the storage layer should create for a relation's key fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub relation: String,
    pub fields: Vec<String>,
}

impl Session {
    /// Save the loaded targets of every autosaving relation
    pub(crate) async fn run_autosave(&mut self, handle: DocHandle) -> OdmResult<()> {
        let model = self.document(handle)?.model().to_string();
        let definition = self.registry().require(&model)?;

        for hook in definition.hooks_of(HookKind::Autosave) {
            let members = match self.document(handle)?.relation_proxy(&hook.relation) {
                Some(proxy) if proxy.is_loaded() || proxy.has_additions() => proxy.members(),
                _ => continue,
            };
            for member in members {
                let document = self.document(member)?;
                if document.is_destroyed() || self.saving.contains(&member) {
                    continue;
                }
                debug!("Autosaving {}#{} member {:?}", model, hook.relation, member);
                self.save(member).await?;
            }
        }
        Ok(())
    }

    /// Adjust the parent counter of every counter-cached belongs_to by `delta`.
    ///
    /// Increments go to the parent the key currently names; decrements go to the
    /// parent the document was last counted against.
    pub(crate) async fn update_counter_caches(
        &mut self,
        handle: DocHandle,
        delta: i64,
    ) -> OdmResult<()> {
        let model = self.document(handle)?.model().to_string();
        let definition = self.registry().require(&model)?;

        for hook in definition.hooks_of(HookKind::CounterCache) {
            let association = definition.require_association(&hook.relation)?;
            let parent = if delta < 0 {
                self.counted_parent(handle, &association)?
            } else {
                self.referenced_parent(handle, &association)?
            };
            if let Some((target, key)) = &parent {
                self.adjust_counter(&association, target, key, delta).await?;
            }
            let counted = if delta < 0 { None } else { parent };
            self.document_mut(handle)?.counted_parents.insert(hook.relation.clone(), counted);
        }
        Ok(())
    }

    /// Move counts from the old parent to the new one when a saved document's
    /// counter-cached key changed since it was last counted
    pub(crate) async fn move_counter_caches(&mut self, handle: DocHandle) -> OdmResult<()> {
        let model = self.document(handle)?.model().to_string();
        let definition = self.registry().require(&model)?;

        for hook in definition.hooks_of(HookKind::CounterCache) {
            let association = definition.require_association(&hook.relation)?;
            let previous = self.counted_parent(handle, &association)?;
            let current = self.referenced_parent(handle, &association)?;
            if previous == current {
                continue;
            }
            if let Some((target, key)) = &previous {
                self.adjust_counter(&association, target, key, -1).await?;
            }
            if let Some((target, key)) = &current {
                self.adjust_counter(&association, target, key, 1).await?;
            }
            self.document_mut(handle)?.counted_parents.insert(hook.relation.clone(), current);
        }
        Ok(())
    }

    /// Record the stored parents of a document just read from storage
    pub(crate) fn remember_counted_parents(&mut self, handle: DocHandle) -> OdmResult<()> {
        let model = self.document(handle)?.model().to_string();
        let definition = self.registry().require(&model)?;

        for hook in definition.hooks_of(HookKind::CounterCache) {
            let association = definition.require_association(&hook.relation)?;
            let parent = match self.referenced_parent(handle, &association) {
                Ok(parent) => parent,
                Err(err) => {
                    warn!("Cannot resolve counted parent {}#{}: {}", model, hook.relation, err);
                    None
                }
            };
            self.document_mut(handle)?.counted_parents.insert(hook.relation.clone(), parent);
        }
        Ok(())
    }

    fn counted_parent(
        &self,
        handle: DocHandle,
        association: &Association,
    ) -> OdmResult<Option<(String, Value)>> {
        match self.document(handle)?.counted_parents.get(association.name()) {
            Some(parent) => Ok(parent.clone()),
            None => self.referenced_parent(handle, association),
        }
    }

    async fn adjust_counter(
        &mut self,
        association: &Association,
        target: &str,
        key: &Value,
        delta: i64,
    ) -> OdmResult<()> {
        let column = association.counter_cache_column();
        let filter = Filter::eq(association.primary_key(), key.clone());
        self.store.increment(target, filter, &column, delta).await?;

        if let Some(parent) = self.arena.lookup(target, key) {
            let document = self.document_mut(parent)?;
            let current = document.attribute(&column).as_i64().unwrap_or(0);
            document.set_attribute(&column, Value::from(current + delta));
        }
        debug!("Counter {}.{} adjusted by {}", target, column, delta);
        Ok(())
    }

    /// Bump `updated_at` on the parents of touching belongs_to relations
    pub(crate) async fn touch_referenced_parents(&mut self, handle: DocHandle) -> OdmResult<()> {
        let model = self.document(handle)?.model().to_string();
        let definition = self.registry().require(&model)?;

        for hook in definition.hooks_of(HookKind::Touch) {
            let association = definition.require_association(&hook.relation)?;
            if association.kind() != RelationKind::BelongsTo {
                continue;
            }
            let Some((target, key)) = self.referenced_parent(handle, &association)? else {
                continue;
            };
            let now = Value::String(Utc::now().to_rfc3339());
            let mut changes = RawDocument::new();
            changes.insert(UPDATED_AT_FIELD.to_string(), now.clone());
            let filter = Filter::eq(association.primary_key(), key.clone());
            self.store.update_matching(&target, filter, changes).await?;

            if let Some(parent) = self.arena.lookup(&target, &key) {
                self.document_mut(parent)?.set_attribute(UPDATED_AT_FIELD, now);
            }
        }
        Ok(())
    }

    /// Bump `updated_at` up an embedded chain for as long as each level touches
    pub(crate) fn touch_embedded_parents(&mut self, handle: DocHandle) -> OdmResult<()> {
        let now = Value::String(Utc::now().to_rfc3339());
        let mut current = handle;
        let mut visited = vec![handle];

        loop {
            let document = self.document(current)?;
            let Some(parent) = document.embedded_parent().map(|parent| parent.handle) else {
                break;
            };
            let definition = self.registry().require(document.model())?;
            let touches = definition.hooks_of(HookKind::Touch).any(|hook| {
                definition
                    .association(&hook.relation)
                    .map_or(false, |association| association.kind() == RelationKind::EmbeddedIn)
            });
            if !touches || visited.contains(&parent) {
                break;
            }
            self.document_mut(parent)?.set_attribute(UPDATED_AT_FIELD, now.clone());
            visited.push(parent);
            current = parent;
        }
        Ok(())
    }

    /// Target type and key of the parent a belongs_to points at, if set
    fn referenced_parent(
        &self,
        handle: DocHandle,
        association: &Association,
    ) -> OdmResult<Option<(String, Value)>> {
        let document = self.document(handle)?;
        let key = document.attribute(association.foreign_key_or_default()).clone();
        if key.is_null() {
            return Ok(None);
        }
        let target = if association.is_polymorphic() {
            match association.type_field().map(|field| document.attribute(field)) {
                Some(Value::String(type_name)) => {
                    self.registry().resolve_type(type_name, association.owner())?
                }
                _ => return Ok(None),
            }
        } else {
            association.target_type(self.registry())?
        };
        Ok(Some((target, key)))
    }
}
