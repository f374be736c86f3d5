//! Association descriptors - immutable per-model metadata for one declared relation

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::dependent::DependentStrategy;
use super::inference::{
    classify, collection_name, foreign_key_for, ids_key_for, type_key_for, underscore,
};
use super::options::{AssociationOptions, OptionKey, RelationOption};
use crate::backends::SortSpec;
use crate::document::ID_FIELD;
use crate::error::{OdmError, OdmResult};
use crate::model::ModelRegistry;

/// Names that would collide with document methods
const RESERVED_NAMES: &[&str] = &[
    "_id",
    "id",
    "type",
    "attributes",
    "changes",
    "delete",
    "destroy",
    "save",
    "reload",
    "new_record",
    "persisted",
    "errors",
    "fields",
    "relations",
    "freeze",
    "frozen",
    "valid",
    "validate",
    "update",
    "initialize",
    "class",
    "object_id",
    "send",
    "clone",
    "dup",
    "hash",
];

/// Options every relation kind accepts
const SHARED_OPTIONS: &[OptionKey] =
    &[OptionKey::ClassName, OptionKey::InverseOf, OptionKey::Validate];

/// The closed set of relation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    EmbedsOne,
    EmbedsMany,
    EmbeddedIn,
    HasOne,
    HasMany,
    HasAndBelongsToMany,
    BelongsTo,
}

impl RelationKind {
    /// Target lives inside the parent's stored document
    pub fn is_embedded(self) -> bool {
        matches!(self, Self::EmbedsOne | Self::EmbedsMany | Self::EmbeddedIn)
    }

    /// This side is the embedding parent
    pub fn embeds(self) -> bool {
        matches!(self, Self::EmbedsOne | Self::EmbedsMany)
    }

    /// Target is an ordered collection
    pub fn is_many(self) -> bool {
        matches!(self, Self::EmbedsMany | Self::HasMany | Self::HasAndBelongsToMany)
    }

    /// The owner's own stored document holds the foreign key
    pub fn stores_foreign_key(self) -> bool {
        matches!(self, Self::BelongsTo | Self::HasAndBelongsToMany)
    }

    /// Kinds that may answer this kind from the other side
    pub fn complements(self) -> &'static [RelationKind] {
        match self {
            Self::EmbedsOne | Self::EmbedsMany => &[Self::EmbeddedIn],
            Self::EmbeddedIn => &[Self::EmbedsOne, Self::EmbedsMany],
            Self::HasOne | Self::HasMany => &[Self::BelongsTo],
            Self::BelongsTo => &[Self::HasOne, Self::HasMany],
            Self::HasAndBelongsToMany => &[Self::HasAndBelongsToMany],
        }
    }

    /// Option keys accepted when declaring a relation of this kind
    pub fn allowed_options(self) -> Vec<OptionKey> {
        let specific: &[OptionKey] = match self {
            Self::EmbedsOne => &[
                OptionKey::As,
                OptionKey::Autobuild,
                OptionKey::Cyclic,
                OptionKey::StoreAs,
            ],
            Self::EmbedsMany => &[
                OptionKey::As,
                OptionKey::Cyclic,
                OptionKey::Order,
                OptionKey::StoreAs,
            ],
            Self::EmbeddedIn => &[OptionKey::Cyclic, OptionKey::Polymorphic, OptionKey::Touch],
            Self::HasOne => &[
                OptionKey::As,
                OptionKey::Autobuild,
                OptionKey::Autosave,
                OptionKey::Dependent,
                OptionKey::ForeignKey,
                OptionKey::PrimaryKey,
            ],
            Self::HasMany => &[
                OptionKey::As,
                OptionKey::Autosave,
                OptionKey::Dependent,
                OptionKey::ForeignKey,
                OptionKey::Order,
                OptionKey::PrimaryKey,
            ],
            Self::HasAndBelongsToMany => &[
                OptionKey::Autosave,
                OptionKey::Dependent,
                OptionKey::ForeignKey,
                OptionKey::Index,
                OptionKey::InverseForeignKey,
                OptionKey::InversePrimaryKey,
                OptionKey::Order,
                OptionKey::PrimaryKey,
            ],
            Self::BelongsTo => &[
                OptionKey::Autobuild,
                OptionKey::Autosave,
                OptionKey::CounterCache,
                OptionKey::Dependent,
                OptionKey::ForeignKey,
                OptionKey::Index,
                OptionKey::Optional,
                OptionKey::Polymorphic,
                OptionKey::PrimaryKey,
                OptionKey::Touch,
            ],
        };
        SHARED_OPTIONS.iter().chain(specific).copied().collect()
    }

    /// Declaration name, as used in error messages
    pub fn macro_name(self) -> &'static str {
        match self {
            Self::EmbedsOne => "embeds_one",
            Self::EmbedsMany => "embeds_many",
            Self::EmbeddedIn => "embedded_in",
            Self::HasOne => "has_one",
            Self::HasMany => "has_many",
            Self::HasAndBelongsToMany => "has_and_belongs_to_many",
            Self::BelongsTo => "belongs_to",
        }
    }
}

/// Accessor names derived once from the relation name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorNames {
    pub getter: String,
    pub setter: String,
    pub exists: String,
    pub has_exists: String,
    pub builder: Option<String>,
    pub creator: Option<String>,
    pub ids_getter: Option<String>,
    pub ids_setter: Option<String>,
}

impl AccessorNames {
    fn derive(name: &str, kind: RelationKind) -> Self {
        let buildable = kind != RelationKind::EmbeddedIn;
        let ids = matches!(kind, RelationKind::HasMany | RelationKind::HasAndBelongsToMany);
        let ids_name = ids_key_for(name);
        Self {
            getter: name.to_string(),
            setter: format!("{name}="),
            exists: format!("{name}?"),
            has_exists: format!("has_{name}?"),
            builder: buildable.then(|| format!("build_{name}")),
            creator: buildable.then(|| format!("create_{name}")),
            ids_getter: ids.then(|| ids_name.clone()),
            ids_setter: ids.then(|| format!("{ids_name}=")),
        }
    }
}

/// Descriptor of one declared relation, shared read-only by every instance of the owner
#[derive(Debug)]
pub struct Association {
    owner: String,
    name: String,
    kind: RelationKind,
    class_name: String,
    explicit_class_name: bool,
    foreign_key: Option<String>,
    primary_key: String,
    inverse_of: Option<Option<String>>,
    role: Option<String>,
    polymorphic: bool,
    type_field: Option<String>,
    dependent: Option<DependentStrategy>,
    autobuild: bool,
    autosave: bool,
    order: Vec<SortSpec>,
    validate: bool,
    counter_cache: bool,
    touch: bool,
    index: bool,
    cyclic: bool,
    optional: Option<bool>,
    store_as: Option<String>,
    inverse_foreign_key: Option<String>,
    inverse_primary_key: String,
    accessors: AccessorNames,
    resolved_target: OnceCell<String>,
}

impl Association {
    /// Validate a declaration and derive every memoized name from it
    pub fn define(
        owner: &str,
        name: &str,
        kind: RelationKind,
        options: AssociationOptions,
    ) -> OdmResult<Self> {
        if name.is_empty() || RESERVED_NAMES.contains(&name) {
            return Err(OdmError::InvalidRelation {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }

        let allowed = kind.allowed_options();
        let mut association = Self {
            owner: owner.to_string(),
            name: name.to_string(),
            kind,
            class_name: classify(name, kind.is_many()),
            explicit_class_name: false,
            foreign_key: None,
            primary_key: ID_FIELD.to_string(),
            inverse_of: None,
            role: None,
            polymorphic: false,
            type_field: None,
            dependent: None,
            autobuild: false,
            autosave: false,
            order: Vec::new(),
            validate: !matches!(kind, RelationKind::BelongsTo | RelationKind::EmbeddedIn),
            counter_cache: false,
            touch: false,
            index: false,
            cyclic: false,
            optional: None,
            store_as: None,
            inverse_foreign_key: None,
            inverse_primary_key: ID_FIELD.to_string(),
            accessors: AccessorNames::derive(name, kind),
            resolved_target: OnceCell::new(),
        };

        for option in options.iter() {
            if !allowed.contains(&option.key()) {
                return Err(OdmError::InvalidRelationOption {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    option: option.key().as_str().to_string(),
                    valid: allowed.iter().map(|key| key.as_str().to_string()).collect(),
                });
            }
            association.apply_option(option)?;
        }

        association.derive_keys();
        Ok(association)
    }

    fn apply_option(&mut self, option: &RelationOption) -> OdmResult<()> {
        match option {
            RelationOption::As(role) => self.role = Some(self.non_empty(OptionKey::As, role)?),
            RelationOption::Autobuild(value) => self.autobuild = *value,
            RelationOption::Autosave(value) => self.autosave = *value,
            RelationOption::ClassName(class_name) => {
                self.class_name = self.non_empty(OptionKey::ClassName, class_name)?;
                self.explicit_class_name = true;
            }
            RelationOption::CounterCache(value) => self.counter_cache = *value,
            RelationOption::Cyclic(value) => self.cyclic = *value,
            RelationOption::Dependent(strategy) => {
                let parsed = DependentStrategy::parse(strategy).ok_or_else(|| {
                    OdmError::InvalidDependentStrategy {
                        owner: self.owner.clone(),
                        name: self.name.clone(),
                        strategy: strategy.clone(),
                        valid: DependentStrategy::ALL
                            .iter()
                            .map(|s| s.as_str().to_string())
                            .collect(),
                    }
                })?;
                self.dependent = Some(parsed);
            }
            RelationOption::ForeignKey(key) => {
                self.foreign_key = Some(self.non_empty(OptionKey::ForeignKey, key)?)
            }
            RelationOption::Index(value) => self.index = *value,
            RelationOption::InverseForeignKey(key) => {
                self.inverse_foreign_key = Some(self.non_empty(OptionKey::InverseForeignKey, key)?)
            }
            RelationOption::InverseOf(inverse) => self.inverse_of = Some(inverse.clone()),
            RelationOption::InversePrimaryKey(key) => {
                self.inverse_primary_key = self.non_empty(OptionKey::InversePrimaryKey, key)?
            }
            RelationOption::Optional(value) => self.optional = Some(*value),
            RelationOption::Order(specs) => self.order.extend(specs.iter().cloned()),
            RelationOption::Polymorphic(value) => self.polymorphic = *value,
            RelationOption::PrimaryKey(key) => {
                self.primary_key = self.non_empty(OptionKey::PrimaryKey, key)?
            }
            RelationOption::StoreAs(key) => {
                self.store_as = Some(self.non_empty(OptionKey::StoreAs, key)?)
            }
            RelationOption::Touch(value) => self.touch = *value,
            RelationOption::Validate(value) => self.validate = *value,
        }
        Ok(())
    }

    fn non_empty(&self, option: OptionKey, value: &str) -> OdmResult<String> {
        if value.trim().is_empty() {
            return Err(OdmError::InvalidOptionValue {
                owner: self.owner.clone(),
                name: self.name.clone(),
                option: option.as_str().to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(value.to_string())
    }

    fn derive_keys(&mut self) {
        if self.foreign_key.is_none() {
            self.foreign_key = match self.kind {
                RelationKind::BelongsTo => Some(foreign_key_for(&self.name)),
                RelationKind::HasOne | RelationKind::HasMany => {
                    Some(match (&self.role, &self.inverse_of) {
                        (Some(role), _) => foreign_key_for(role),
                        (None, Some(Some(inverse))) => foreign_key_for(inverse),
                        _ => foreign_key_for(&underscore(&self.owner)),
                    })
                }
                RelationKind::HasAndBelongsToMany => Some(ids_key_for(&self.name)),
                _ => None,
            };
        }

        self.type_field = match (&self.role, self.polymorphic) {
            (Some(role), _) => Some(type_key_for(role)),
            (None, true) => Some(type_key_for(&self.name)),
            (None, false) => None,
        };
    }

    /// Model that declares the relation
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Relation name as declared
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the relation kind
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Declared or inferred (still unresolved) target type name
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Foreign key field, when this kind stores one on either side
    pub fn foreign_key(&self) -> Option<&str> {
        self.foreign_key.as_deref()
    }

    /// Foreign key field, falling back to the primary key for kinds without one
    pub fn foreign_key_or_default(&self) -> &str {
        self.foreign_key.as_deref().unwrap_or(&self.primary_key)
    }

    /// Field the foreign key points at, `_id` unless overridden
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Field this side is looked up by: the foreign key if stored here, else the primary key
    pub fn key(&self) -> &str {
        match self.kind {
            RelationKind::BelongsTo | RelationKind::HasAndBelongsToMany => {
                self.foreign_key_or_default()
            }
            RelationKind::EmbedsOne | RelationKind::EmbedsMany => self.storage_key(),
            _ => &self.primary_key,
        }
    }

    /// Key under which embedded targets are stored in the parent document
    pub fn storage_key(&self) -> &str {
        self.store_as.as_deref().unwrap_or(&self.name)
    }

    /// `Some(None)` when declared without inverse, `None` when not declared at all
    pub fn inverse_of(&self) -> Option<Option<&str>> {
        self.inverse_of.as_ref().map(|inverse| inverse.as_deref())
    }

    /// Role name given with `as`, for the owning side of a polymorphic pair
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Polymorphic reference side (`polymorphic: true`)
    pub fn is_polymorphic(&self) -> bool {
        self.polymorphic
    }

    /// Discriminator field holding the target model name on polymorphic relations
    pub fn type_field(&self) -> Option<&str> {
        self.type_field.as_deref()
    }

    /// Cascade applied on destroy, if any
    pub fn dependent(&self) -> Option<DependentStrategy> {
        self.dependent
    }

    /// An empty single relation builds a fresh target on access
    pub fn is_autobuilding(&self) -> bool {
        self.autobuild
    }

    /// Saving the base also saves loaded targets
    pub fn is_autosaving(&self) -> bool {
        self.autosave
    }

    /// Sort applied when loading referenced collections
    pub fn order(&self) -> &[SortSpec] {
        &self.order
    }

    /// Loaded targets are validated along with the base
    pub fn is_validated(&self) -> bool {
        self.validate
    }

    /// The parent keeps a `<collection>_count` column for this relation
    pub fn has_counter_cache(&self) -> bool {
        self.counter_cache
    }

    /// Saving this side bumps the parent's `updated_at`
    pub fn is_touching(&self) -> bool {
        self.touch
    }

    /// An index was requested for the foreign key
    pub fn is_indexed(&self) -> bool {
        self.index
    }

    /// Declared by `recursively_embeds_*`
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    /// Ids field on the other side of a has_and_belongs_to_many pair
    pub fn inverse_foreign_key(&self) -> Option<&str> {
        self.inverse_foreign_key.as_deref()
    }

    /// Field the other side's ids point at
    pub fn inverse_primary_key(&self) -> &str {
        &self.inverse_primary_key
    }

    /// Accessor names derived when the relation was defined
    pub fn accessors(&self) -> &AccessorNames {
        &self.accessors
    }

    /// Whether a missing target is a validation error
    pub fn is_required(&self, required_by_default: bool) -> bool {
        self.kind == RelationKind::BelongsTo
            && self.optional.map_or(required_by_default, |optional| !optional)
    }

    /// Parent column maintained by a counter cache (`Post#person` -> `posts_count`)
    pub fn counter_cache_column(&self) -> String {
        format!("{}_count", collection_name(&self.owner))
    }

    /// Resolve the target type once, relative to the owner's namespace
    pub fn target_type(&self, registry: &ModelRegistry) -> OdmResult<String> {
        if self.polymorphic {
            return Err(OdmError::UnresolvedType {
                name: self.class_name.clone(),
                context: format!("{}#{}", self.owner, self.name),
                attempted: self.type_field.clone().unwrap_or_default(),
            });
        }
        self.resolved_target
            .get_or_try_init(|| registry.resolve_type(&self.class_name, &self.owner))
            .cloned()
    }

    /// Names of the descriptors on the other side that may answer this one.
    ///
    /// `other` is the concrete type of the target; it is required for
    /// polymorphic references and defaults to the declared target otherwise.
    pub fn inverse_candidates(
        &self,
        registry: &ModelRegistry,
        other: Option<&str>,
    ) -> OdmResult<Vec<String>> {
        match &self.inverse_of {
            Some(Some(inverse)) => return Ok(vec![inverse.clone()]),
            Some(None) => return Ok(Vec::new()),
            None => {}
        }

        if let Some(role) = &self.role {
            return Ok(vec![role.clone()]);
        }

        if self.polymorphic {
            let Some(other) = other else {
                return Ok(Vec::new());
            };
            let definition = registry.require(other)?;
            return Ok(definition
                .associations()
                .iter()
                .filter(|candidate| self.kind.complements().contains(&candidate.kind()))
                .filter(|candidate| candidate.role() == Some(self.name.as_str()))
                .map(|candidate| candidate.name().to_string())
                .collect());
        }

        let target = match other {
            Some(other) => other.to_string(),
            None => self.target_type(registry)?,
        };
        let definition = registry.require(&target)?;
        let candidates: Vec<String> = definition
            .associations()
            .iter()
            .filter(|candidate| self.kind.complements().contains(&candidate.kind()))
            .filter(|candidate| !(candidate.owner() == self.owner && candidate.name() == self.name))
            .filter(|candidate| candidate.role().is_none())
            .filter(|candidate| match candidate.inverse_of() {
                Some(Some(inverse)) => inverse == self.name,
                Some(None) => false,
                None => true,
            })
            .filter(|candidate| {
                candidate
                    .target_type(registry)
                    .map(|resolved| resolved == self.owner)
                    .unwrap_or(false)
            })
            .map(|candidate| candidate.name().to_string())
            .collect();

        if candidates.len() > 1 {
            return Err(OdmError::AmbiguousRelationship {
                owner: self.owner.clone(),
                name: self.name.clone(),
                target,
                candidates,
            });
        }
        Ok(candidates)
    }

    /// The single inverse name, if any
    pub fn inverse(
        &self,
        registry: &ModelRegistry,
        other: Option<&str>,
    ) -> OdmResult<Option<String>> {
        let mut candidates = self.inverse_candidates(registry, other)?;
        if candidates.len() > 1 {
            warn!(
                "{}#{} has several polymorphic inverses on {} ({}); using '{}'",
                self.owner,
                self.name,
                other.unwrap_or("?"),
                candidates.join(", "),
                candidates[0]
            );
        }
        Ok(if candidates.is_empty() {
            None
        } else {
            Some(candidates.swap_remove(0))
        })
    }

    /// Descriptor of the inverse on the target type
    pub fn inverse_association(
        &self,
        registry: &ModelRegistry,
        other: Option<&str>,
    ) -> OdmResult<Option<Arc<Association>>> {
        let Some(inverse) = self.inverse(registry, other)? else {
            return Ok(None);
        };
        let target = match other {
            Some(other) => other.to_string(),
            None => self.target_type(registry)?,
        };
        Ok(registry.require(&target)?.association(&inverse))
    }
}
