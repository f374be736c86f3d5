//! Relation options - the closed set of knobs a relation declaration accepts

use crate::backends::{SortDirection, SortSpec};

use super::dependent::DependentStrategy;

/// Option names, used to validate declarations per relation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    As,
    Autobuild,
    Autosave,
    ClassName,
    CounterCache,
    Cyclic,
    Dependent,
    ForeignKey,
    Index,
    InverseForeignKey,
    InverseOf,
    InversePrimaryKey,
    Optional,
    Order,
    Polymorphic,
    PrimaryKey,
    StoreAs,
    Touch,
    Validate,
}

impl OptionKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::As => "as",
            OptionKey::Autobuild => "autobuild",
            OptionKey::Autosave => "autosave",
            OptionKey::ClassName => "class_name",
            OptionKey::CounterCache => "counter_cache",
            OptionKey::Cyclic => "cyclic",
            OptionKey::Dependent => "dependent",
            OptionKey::ForeignKey => "foreign_key",
            OptionKey::Index => "index",
            OptionKey::InverseForeignKey => "inverse_foreign_key",
            OptionKey::InverseOf => "inverse_of",
            OptionKey::InversePrimaryKey => "inverse_primary_key",
            OptionKey::Optional => "optional",
            OptionKey::Order => "order",
            OptionKey::Polymorphic => "polymorphic",
            OptionKey::PrimaryKey => "primary_key",
            OptionKey::StoreAs => "store_as",
            OptionKey::Touch => "touch",
            OptionKey::Validate => "validate",
        }
    }
}

/// One option value
#[derive(Debug, Clone, PartialEq)]
pub enum RelationOption {
    As(String),
    Autobuild(bool),
    Autosave(bool),
    ClassName(String),
    CounterCache(bool),
    Cyclic(bool),
    /// Strategy name, checked when the relation is defined
    Dependent(String),
    ForeignKey(String),
    Index(bool),
    InverseForeignKey(String),
    /// `None` declares that the relation has no inverse
    InverseOf(Option<String>),
    InversePrimaryKey(String),
    Optional(bool),
    Order(Vec<SortSpec>),
    Polymorphic(bool),
    PrimaryKey(String),
    StoreAs(String),
    Touch(bool),
    Validate(bool),
}

impl RelationOption {
    pub fn key(&self) -> OptionKey {
        match self {
            RelationOption::As(_) => OptionKey::As,
            RelationOption::Autobuild(_) => OptionKey::Autobuild,
            RelationOption::Autosave(_) => OptionKey::Autosave,
            RelationOption::ClassName(_) => OptionKey::ClassName,
            RelationOption::CounterCache(_) => OptionKey::CounterCache,
            RelationOption::Cyclic(_) => OptionKey::Cyclic,
            RelationOption::Dependent(_) => OptionKey::Dependent,
            RelationOption::ForeignKey(_) => OptionKey::ForeignKey,
            RelationOption::Index(_) => OptionKey::Index,
            RelationOption::InverseForeignKey(_) => OptionKey::InverseForeignKey,
            RelationOption::InverseOf(_) => OptionKey::InverseOf,
            RelationOption::InversePrimaryKey(_) => OptionKey::InversePrimaryKey,
            RelationOption::Optional(_) => OptionKey::Optional,
            RelationOption::Order(_) => OptionKey::Order,
            RelationOption::Polymorphic(_) => OptionKey::Polymorphic,
            RelationOption::PrimaryKey(_) => OptionKey::PrimaryKey,
            RelationOption::StoreAs(_) => OptionKey::StoreAs,
            RelationOption::Touch(_) => OptionKey::Touch,
            RelationOption::Validate(_) => OptionKey::Validate,
        }
    }
}

/// Builder for the options of one relation declaration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssociationOptions {
    options: Vec<RelationOption>,
}

impl AssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, option: RelationOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn class_name(self, name: impl Into<String>) -> Self {
        self.with(RelationOption::ClassName(name.into()))
    }

    pub fn inverse_of(self, name: impl Into<String>) -> Self {
        self.with(RelationOption::InverseOf(Some(name.into())))
    }

    /// Declare that the relation has no inverse
    pub fn without_inverse(self) -> Self {
        self.with(RelationOption::InverseOf(None))
    }

    pub fn foreign_key(self, key: impl Into<String>) -> Self {
        self.with(RelationOption::ForeignKey(key.into()))
    }

    pub fn primary_key(self, key: impl Into<String>) -> Self {
        self.with(RelationOption::PrimaryKey(key.into()))
    }

    /// Polymorphic role name (`as:`) the target refers back through
    pub fn as_role(self, role: impl Into<String>) -> Self {
        self.with(RelationOption::As(role.into()))
    }

    pub fn polymorphic(self) -> Self {
        self.with(RelationOption::Polymorphic(true))
    }

    pub fn dependent(self, strategy: DependentStrategy) -> Self {
        self.with(RelationOption::Dependent(strategy.as_str().to_string()))
    }

    /// Dependent strategy given by name, validated at definition time
    pub fn dependent_named(self, strategy: impl Into<String>) -> Self {
        self.with(RelationOption::Dependent(strategy.into()))
    }

    pub fn autobuild(self) -> Self {
        self.with(RelationOption::Autobuild(true))
    }

    pub fn autosave(self) -> Self {
        self.with(RelationOption::Autosave(true))
    }

    pub fn order_by(self, field: impl Into<String>, direction: SortDirection) -> Self {
        let spec = SortSpec {
            field: field.into(),
            direction,
        };
        self.with(RelationOption::Order(vec![spec]))
    }

    pub fn validate(self, validate: bool) -> Self {
        self.with(RelationOption::Validate(validate))
    }

    pub fn counter_cache(self) -> Self {
        self.with(RelationOption::CounterCache(true))
    }

    pub fn touch(self) -> Self {
        self.with(RelationOption::Touch(true))
    }

    pub fn index(self) -> Self {
        self.with(RelationOption::Index(true))
    }

    pub fn store_as(self, key: impl Into<String>) -> Self {
        self.with(RelationOption::StoreAs(key.into()))
    }

    pub fn cyclic(self) -> Self {
        self.with(RelationOption::Cyclic(true))
    }

    pub fn optional(self) -> Self {
        self.with(RelationOption::Optional(true))
    }

    pub fn required(self) -> Self {
        self.with(RelationOption::Optional(false))
    }

    pub fn inverse_foreign_key(self, key: impl Into<String>) -> Self {
        self.with(RelationOption::InverseForeignKey(key.into()))
    }

    pub fn inverse_primary_key(self, key: impl Into<String>) -> Self {
        self.with(RelationOption::InversePrimaryKey(key.into()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelationOption> {
        self.options.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
