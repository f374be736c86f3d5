//! Model definitions - the ordered set of fields and relation descriptors of one model type

use std::collections::HashMap;
use std::sync::Arc;

use crate::associations::dependent::DependentEntry;
use crate::associations::hooks::{AssociationHook, HookKind, IndexRequest};
use crate::associations::inference::{namespace_of, pluralize, underscore};
use crate::associations::metadata::{Association, RelationKind};
use crate::associations::options::AssociationOptions;
use crate::coercion::FieldType;
use crate::document::ID_FIELD;
use crate::error::{OdmError, OdmResult};

/// Declaration of one model type.
///
/// Relation declarations are constructor calls that validate the options,
/// derive the descriptor and register its side effects (cascade entry,
/// index request, autosave / counter cache / touch hooks) in declaration order.
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    name: String,
    fields: Vec<(String, FieldType)>,
    associations: Vec<Arc<Association>>,
    association_index: HashMap<String, usize>,
    dependents: Vec<DependentEntry>,
    hooks: Vec<AssociationHook>,
    index_requests: Vec<IndexRequest>,
    embedded: bool,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![(ID_FIELD.to_string(), FieldType::Any)],
            associations: Vec::new(),
            association_index: HashMap::new(),
            dependents: Vec::new(),
            hooks: Vec::new(),
            index_requests: Vec::new(),
            embedded: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        namespace_of(&self.name)
    }

    /// Declare a field; redeclaring replaces the type
    pub fn field(&mut self, name: impl Into<String>, field_type: FieldType) -> &mut Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = field_type,
            None => self.fields.push((name, field_type)),
        }
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(field, _)| field == name)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, field_type)| *field_type)
    }

    pub fn fields(&self) -> &[(String, FieldType)] {
        &self.fields
    }

    pub fn embeds_one(&mut self, name: &str, options: AssociationOptions) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::EmbedsOne, options)
    }

    pub fn embeds_many(&mut self, name: &str, options: AssociationOptions) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::EmbedsMany, options)
    }

    pub fn embedded_in(&mut self, name: &str, options: AssociationOptions) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::EmbeddedIn, options)
    }

    pub fn has_one(&mut self, name: &str, options: AssociationOptions) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::HasOne, options)
    }

    pub fn has_many(&mut self, name: &str, options: AssociationOptions) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::HasMany, options)
    }

    pub fn has_and_belongs_to_many(
        &mut self,
        name: &str,
        options: AssociationOptions,
    ) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::HasAndBelongsToMany, options)
    }

    pub fn belongs_to(&mut self, name: &str, options: AssociationOptions) -> OdmResult<&mut Self> {
        self.associate(name, RelationKind::BelongsTo, options)
    }

    /// Self-referential embedded tree: `child_<plural>` / `parent_<singular>`
    pub fn recursively_embeds_many(&mut self) -> OdmResult<&mut Self> {
        let singular = underscore(&self.name);
        let child = format!("child_{}", pluralize(&singular));
        self.recursively_embed(RelationKind::EmbedsMany, child, singular)
    }

    /// Self-referential embedded chain: `child_<singular>` / `parent_<singular>`
    pub fn recursively_embeds_one(&mut self) -> OdmResult<&mut Self> {
        let singular = underscore(&self.name);
        self.recursively_embed(RelationKind::EmbedsOne, format!("child_{singular}"), singular)
    }

    fn recursively_embed(
        &mut self,
        kind: RelationKind,
        child: String,
        singular: String,
    ) -> OdmResult<&mut Self> {
        let parent = format!("parent_{singular}");
        let class_name = self.name.clone();
        self.associate(
            &child,
            kind,
            AssociationOptions::new()
                .class_name(class_name.clone())
                .cyclic()
                .inverse_of(parent.clone()),
        )?;
        self.associate(
            &parent,
            RelationKind::EmbeddedIn,
            AssociationOptions::new().class_name(class_name).cyclic().inverse_of(child),
        )
    }

    /// Declare a relation and register its definition-time side effects
    pub fn associate(
        &mut self,
        name: &str,
        kind: RelationKind,
        options: AssociationOptions,
    ) -> OdmResult<&mut Self> {
        if self.association_index.contains_key(name) {
            return Err(OdmError::DuplicateRelation {
                owner: self.name.clone(),
                name: name.to_string(),
            });
        }

        let association = Association::define(&self.name, name, kind, options)?;

        if kind.stores_foreign_key() {
            if let Some(foreign_key) = association.foreign_key() {
                if !self.has_field(foreign_key) {
                    let field_type = if kind.is_many() { FieldType::Array } else { FieldType::Any };
                    self.field(foreign_key.to_string(), field_type);
                }
            }
        }
        if let Some(type_field) = association.type_field() {
            if association.is_polymorphic() && !self.has_field(type_field) {
                self.field(type_field.to_string(), FieldType::String);
            }
        }

        if association.is_indexed() {
            let mut fields: Vec<String> =
                association.foreign_key().into_iter().map(str::to_string).collect();
            if association.is_polymorphic() {
                fields.extend(association.type_field().map(str::to_string));
            }
            self.index_requests.push(IndexRequest {
                relation: name.to_string(),
                fields,
            });
        }

        if let Some(strategy) = association.dependent() {
            self.dependents.push(DependentEntry {
                relation: name.to_string(),
                strategy,
            });
        }

        for (enabled, hook_kind) in [
            (association.is_autosaving(), HookKind::Autosave),
            (association.has_counter_cache(), HookKind::CounterCache),
            (association.is_touching(), HookKind::Touch),
        ] {
            if enabled {
                self.hooks.push(AssociationHook {
                    relation: name.to_string(),
                    kind: hook_kind,
                });
            }
        }

        if kind == RelationKind::EmbeddedIn && !association.is_cyclic() {
            self.embedded = true;
        }

        self.association_index.insert(name.to_string(), self.associations.len());
        self.associations.push(Arc::new(association));
        Ok(self)
    }

    /// Descriptors in declaration order
    pub fn associations(&self) -> &[Arc<Association>] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<Arc<Association>> {
        self.association_index
            .get(name)
            .map(|index| Arc::clone(&self.associations[*index]))
    }

    pub fn require_association(&self, name: &str) -> OdmResult<Arc<Association>> {
        self.association(name).ok_or_else(|| OdmError::UnknownRelation {
            model: self.name.clone(),
            name: name.to_string(),
        })
    }

    /// Cascade entries in declaration order
    pub fn dependents(&self) -> &[DependentEntry] {
        &self.dependents
    }

    pub fn hooks(&self) -> &[AssociationHook] {
        &self.hooks
    }

    pub fn hooks_of(&self, kind: HookKind) -> impl Iterator<Item = &AssociationHook> {
        self.hooks.iter().filter(move |hook| hook.kind == kind)
    }

    pub fn index_requests(&self) -> &[IndexRequest] {
        &self.index_requests
    }

    /// Only ever stored inside a parent document
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::dependent::DependentStrategy;

    #[test]
    fn test_declaration_side_effects() {
        let mut post = ModelDefinition::new("Post");
        let comments = AssociationOptions::new().dependent(DependentStrategy::Destroy).autosave();
        post.belongs_to(
            "person",
            AssociationOptions::new().index().counter_cache().touch(),
        )
        .unwrap()
        .has_many("comments", comments)
        .unwrap();

        assert!(post.has_field("person_id"));
        assert_eq!(post.index_requests()[0].fields, vec!["person_id"]);
        assert_eq!(post.dependents()[0].relation, "comments");
        assert_eq!(post.hooks_of(HookKind::CounterCache).count(), 1);
        assert_eq!(post.hooks_of(HookKind::Touch).count(), 1);
        assert_eq!(post.hooks_of(HookKind::Autosave).next().unwrap().relation, "comments");
    }

    #[test]
    fn test_polymorphic_index_covers_type_field() {
        let mut rating = ModelDefinition::new("Rating");
        rating
            .belongs_to("ratable", AssociationOptions::new().polymorphic().index())
            .unwrap();

        assert_eq!(rating.field_type("ratable_type"), Some(FieldType::String));
        assert_eq!(rating.index_requests()[0].fields, vec!["ratable_id", "ratable_type"]);
    }

    #[test]
    fn test_duplicate_relation_is_rejected() {
        let mut person = ModelDefinition::new("Person");
        person.has_many("posts", AssociationOptions::new()).unwrap();
        let err = person.has_one("posts", AssociationOptions::new()).unwrap_err();
        assert!(matches!(err, OdmError::DuplicateRelation { .. }));
    }

    #[test]
    fn test_dependents_keep_declaration_order() {
        let mut person = ModelDefinition::new("Person");
        person
            .has_many(
                "posts",
                AssociationOptions::new().dependent(DependentStrategy::RestrictWithException),
            )
            .unwrap()
            .has_many("notes", AssociationOptions::new().dependent(DependentStrategy::DeleteAll))
            .unwrap();

        let order: Vec<_> =
            person.dependents().iter().map(|entry| entry.relation.as_str()).collect();
        assert_eq!(order, vec!["posts", "notes"]);
    }

    #[test]
    fn test_recursively_embeds_many() {
        let mut role = ModelDefinition::new("Role");
        role.recursively_embeds_many().unwrap();

        let children = role.association("child_roles").unwrap();
        let parent = role.association("parent_role").unwrap();
        assert!(children.is_cyclic());
        assert_eq!(children.kind(), RelationKind::EmbedsMany);
        assert_eq!(parent.inverse_of(), Some(Some("child_roles")));
        assert!(!role.is_embedded());
    }

    #[test]
    fn test_embedded_model_detection() {
        let mut address = ModelDefinition::new("Address");
        address.embedded_in("person", AssociationOptions::new()).unwrap();
        assert!(address.is_embedded());
    }
}
