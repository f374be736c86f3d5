//! Binding - keeps both sides of a relation pointing at each other
//!
//! A binding is ephemeral: it writes foreign keys and type discriminators on
//! whichever side stores them and sets the in-memory back-reference on the
//! inverse side. Back-references are only written when they do not already
//! point at the expected document, which makes binding idempotent and keeps
//! self-referential graphs from looping.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::metadata::{Association, RelationKind};
use crate::document::{AssociationRef, DocHandle, EmbeddedParent};
use crate::error::{OdmError, OdmResult};
use crate::session::Session;

pub struct Binding<'s> {
    session: &'s mut Session,
    base: DocHandle,
    association: Arc<Association>,
}

impl<'s> Binding<'s> {
    pub fn new(session: &'s mut Session, base: DocHandle, association: Arc<Association>) -> Self {
        Self {
            session,
            base,
            association,
        }
    }

    /// Link `target` to the base through the association
    pub fn bind(&mut self, target: DocHandle) -> OdmResult<()> {
        self.apply(target, true)
    }

    /// Remove the link between `target` and the base
    pub fn unbind(&mut self, target: DocHandle) -> OdmResult<()> {
        self.apply(target, false)
    }

    fn apply(&mut self, target: DocHandle, binding: bool) -> OdmResult<()> {
        match self.association.kind() {
            RelationKind::HasOne | RelationKind::HasMany => self.referenced_target(target, binding),
            RelationKind::BelongsTo => self.referenced_owner(target, binding),
            RelationKind::HasAndBelongsToMany => self.many_to_many(target, binding),
            RelationKind::EmbedsOne | RelationKind::EmbedsMany => {
                self.embedded_child(target, binding)
            }
            RelationKind::EmbeddedIn => self.embedding_parent(target, binding),
        }
    }

    fn owner_ref(&self) -> AssociationRef {
        AssociationRef::new(self.association.owner(), self.association.name())
    }

    fn inverse_not_found(&self, target_model: &str, key: &str) -> OdmError {
        OdmError::InverseNotFound {
            owner: self.association.owner().to_string(),
            name: self.association.name().to_string(),
            target: target_model.to_string(),
            key: key.to_string(),
        }
    }

    /// Inverse descriptor on the target model; an explicit `inverse_of` must exist
    fn resolve_inverse(&self, target_model: &str) -> OdmResult<Option<Arc<Association>>> {
        let registry = self.session.registry();
        let definition = registry.require(target_model)?;

        if let Some(Some(explicit)) = self.association.inverse_of() {
            return definition
                .association(explicit)
                .map(Some)
                .ok_or_else(|| self.inverse_not_found(target_model, explicit));
        }

        let candidates = self.association.inverse_candidates(registry, Some(target_model))?;
        if self.association.is_polymorphic() && candidates.len() > 1 {
            return Err(OdmError::InvalidSetPolymorphicRelation {
                owner: self.association.owner().to_string(),
                name: self.association.name().to_string(),
                target: target_model.to_string(),
            });
        }
        Ok(candidates.first().and_then(|name| definition.association(name)))
    }

    /// Write a key on a document unless it is immutable or already holds the value
    fn write_key(&mut self, handle: DocHandle, field: &str, value: Value) -> OdmResult<()> {
        let document = self.session.document(handle)?;
        if document.is_immutable() || document.attribute(field) == &value {
            return Ok(());
        }
        let model = document.model().to_string();
        let value = self.session.coerce(&model, field, value)?;
        self.session.document_mut(handle)?.set_attribute(field, value);
        Ok(())
    }

    /// Set a one-sided back-reference when it does not already point where it should
    fn point_one(
        &mut self,
        holder: DocHandle,
        inverse: &Arc<Association>,
        to: Option<DocHandle>,
        from: DocHandle,
    ) -> OdmResult<()> {
        let proxy = self.session.proxy_mut(holder, inverse)?;
        match to {
            Some(target) if proxy.one() != Some(target) || !proxy.is_loaded() => {
                proxy.set_one(Some(target))
            }
            None if proxy.one() == Some(from) => proxy.set_one(None),
            _ => {}
        }
        Ok(())
    }

    /// has_one / has_many: the target stores the foreign key
    fn referenced_target(&mut self, target: DocHandle, binding: bool) -> OdmResult<()> {
        let target_model = self.session.document(target)?.model().to_string();
        let foreign_key = self.association.foreign_key_or_default().to_string();

        let target_definition = self.session.registry().require(&target_model)?;
        if !target_definition.has_field(&foreign_key) {
            return Err(self.inverse_not_found(&target_model, &foreign_key));
        }
        let inverse = self.resolve_inverse(&target_model)?;

        let key = if binding {
            self.session.document(self.base)?.attribute(self.association.primary_key()).clone()
        } else {
            Value::Null
        };
        self.write_key(target, &foreign_key, key)?;

        let type_field = match self.association.role() {
            Some(_) => self.association.type_field().map(str::to_string),
            None => None,
        };
        if let Some(type_field) = type_field {
            let discriminator = if binding {
                Value::String(self.association.owner().to_string())
            } else {
                Value::Null
            };
            self.write_key(target, &type_field, discriminator)?;
        }

        if let Some(inverse) = &inverse {
            let to = binding.then_some(self.base);
            self.point_one(target, inverse, to, self.base)?;
        }

        let owner = self.owner_ref();
        let document = self.session.document_mut(target)?;
        if binding {
            if document.association.as_ref() != Some(&owner) {
                document.association = Some(owner);
            }
        } else if document.association.as_ref() == Some(&owner) {
            document.association = None;
        }
        Ok(())
    }

    /// belongs_to: the base stores the foreign key (and type, when polymorphic)
    fn referenced_owner(&mut self, target: DocHandle, binding: bool) -> OdmResult<()> {
        let target_model = self.session.document(target)?.model().to_string();
        let inverse = self.resolve_inverse(&target_model)?;

        let key = if binding {
            self.session.document(target)?.attribute(self.association.primary_key()).clone()
        } else {
            Value::Null
        };
        let foreign_key = self.association.foreign_key_or_default().to_string();
        self.write_key(self.base, &foreign_key, key)?;

        if self.association.is_polymorphic() {
            let type_field = self.association.type_field().map(str::to_string);
            if let Some(type_field) = type_field {
                let discriminator = if binding {
                    Value::String(target_model.clone())
                } else {
                    Value::Null
                };
                self.write_key(self.base, &type_field, discriminator)?;
            }
        }

        if let Some(inverse) = &inverse {
            if inverse.kind().is_many() {
                let proxy = self.session.proxy_mut(target, inverse)?;
                if binding {
                    proxy.push(self.base);
                } else {
                    proxy.remove(self.base);
                }
            } else {
                let to = binding.then_some(self.base);
                self.point_one(target, inverse, to, self.base)?;
            }

            // The owner answers to whichever descriptor resolved as inverse most recently
            let answering = AssociationRef::new(inverse.owner(), inverse.name());
            let document = self.session.document_mut(self.base)?;
            if binding && document.association.as_ref() != Some(&answering) {
                debug!(
                    "Switching answering association of {} to {}#{}",
                    document.model(),
                    answering.owner,
                    answering.name
                );
                document.association = Some(answering);
            } else if !binding && document.association.as_ref() == Some(&answering) {
                document.association = None;
            }
        }
        Ok(())
    }

    /// has_and_belongs_to_many: both sides store an array of keys
    fn many_to_many(&mut self, target: DocHandle, binding: bool) -> OdmResult<()> {
        let target_model = self.session.document(target)?.model().to_string();
        let inverse = match self.association.inverse_of() {
            Some(None) => None,
            _ => self.resolve_inverse(&target_model)?,
        };

        let target_key = self
            .session
            .document(target)?
            .attribute(self.association.primary_key())
            .clone();
        let foreign_key = self.association.foreign_key_or_default().to_string();
        self.toggle_key(self.base, &foreign_key, target_key, binding)?;

        if let Some(inverse) = &inverse {
            let inverse_key = self
                .association
                .inverse_foreign_key()
                .unwrap_or(inverse.foreign_key_or_default())
                .to_string();
            let base_key = self
                .session
                .document(self.base)?
                .attribute(self.association.inverse_primary_key())
                .clone();
            self.toggle_key(target, &inverse_key, base_key, binding)?;

            let proxy = self.session.proxy_mut(target, inverse)?;
            if binding {
                proxy.push(self.base);
            } else {
                proxy.remove(self.base);
            }
        }
        Ok(())
    }

    /// Add or remove one key in an array-of-keys field
    fn toggle_key(
        &mut self,
        handle: DocHandle,
        field: &str,
        key: Value,
        present: bool,
    ) -> OdmResult<()> {
        let document = self.session.document(handle)?;
        if document.is_immutable() || key.is_null() {
            return Ok(());
        }
        let mut keys = match document.attribute(field) {
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        };
        let contained = keys.contains(&key);
        match (present, contained) {
            (true, false) => keys.push(key),
            (false, true) => keys.retain(|existing| existing != &key),
            _ if document.attribute(field).is_array() => return Ok(()),
            _ => {}
        }
        let model = document.model().to_string();
        let keys = self.session.coerce(&model, field, Value::Array(keys))?;
        self.session.document_mut(handle)?.set_attribute(field, keys);
        Ok(())
    }

    /// embeds_one / embeds_many: the base is the parent of the target
    fn embedded_child(&mut self, target: DocHandle, binding: bool) -> OdmResult<()> {
        let target_model = self.session.document(target)?.model().to_string();
        let inverse = self.resolve_inverse(&target_model)?;
        let relation = self.association.name().to_string();

        let position = if binding && self.association.kind().is_many() {
            self.session
                .document(self.base)?
                .relation_proxy(&relation)
                .and_then(|proxy| proxy.members().iter().position(|member| *member == target))
        } else {
            None
        };

        let owner = self.owner_ref();
        let base = self.base;
        let document = self.session.document_mut(target)?;
        if binding {
            let parent = EmbeddedParent {
                handle: base,
                relation: relation.clone(),
            };
            if document.embedded_parent.as_ref() != Some(&parent) {
                document.embedded_parent = Some(parent);
            }
            if position.is_some() {
                document.position = position;
            }
            document.association = Some(owner);
        } else if document
            .embedded_parent
            .as_ref()
            .map_or(false, |parent| parent.handle == base && parent.relation == relation)
        {
            document.embedded_parent = None;
            document.position = None;
            document.association = None;
        }

        if let Some(inverse) = &inverse {
            let to = binding.then_some(base);
            self.point_one(target, inverse, to, base)?;
        }
        Ok(())
    }

    /// embedded_in: the target is the parent of the base
    fn embedding_parent(&mut self, target: DocHandle, binding: bool) -> OdmResult<()> {
        let target_model = self.session.document(target)?.model().to_string();
        let inverse = self
            .resolve_inverse(&target_model)?
            .ok_or_else(|| self.inverse_not_found(&target_model, self.association.name()))?;

        if binding {
            self.session.materialize_embedded(target, &inverse)?;
        }

        let base = self.base;
        let proxy = self.session.proxy_mut(target, &inverse)?;
        let mut displaced = None;
        if binding {
            if inverse.kind().is_many() {
                proxy.push(base);
            } else if proxy.one() != Some(base) {
                displaced = proxy.one();
                proxy.set_one(Some(base));
            }
        } else {
            proxy.remove(base);
        }
        let position = proxy.members().iter().position(|member| *member == base);

        if let Some(previous) = displaced {
            let document = self.session.document_mut(previous)?;
            document.embedded_parent = None;
            document.position = None;
        }

        let document = self.session.document_mut(base)?;
        if binding {
            document.embedded_parent = Some(EmbeddedParent {
                handle: target,
                relation: inverse.name().to_string(),
            });
            document.position = if inverse.kind().is_many() { position } else { None };
            document.association = Some(AssociationRef::new(inverse.owner(), inverse.name()));
        } else {
            document.embedded_parent = None;
            document.position = None;
            document.association = None;
        }

        let association = Arc::clone(&self.association);
        let to = binding.then_some(target);
        self.point_one(base, &association, to, target)?;

        if !binding && inverse.kind().is_many() {
            self.session.reindex(target, inverse.name())?;
        }
        Ok(())
    }
}
