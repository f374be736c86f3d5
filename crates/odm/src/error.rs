//! Error types for the association engine
//!
//! Every variant carries the owner model, the relation name and the values
//! involved so callers can render an actionable message without digging
//! through lower-level causes.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for association operations
pub type OdmResult<T> = Result<T, OdmError>;

/// Error types for relation definition, resolution, binding and cascades
#[derive(Debug, Error)]
pub enum OdmError {
    // Definition-time errors
    #[error(
        "Invalid option '{option}' on relation '{name}' of {owner}. Valid options are: {}",
        .valid.join(", ")
    )]
    InvalidRelationOption {
        owner: String,
        name: String,
        option: String,
        valid: Vec<String>,
    },

    #[error(
        "Defining a relation named '{name}' on {owner} is not allowed: \
         it collides with a reserved method"
    )]
    InvalidRelation { owner: String, name: String },

    #[error(
        "Invalid dependent strategy '{strategy}' on relation '{name}' of {owner}. \
         Valid strategies are: {}",
        .valid.join(", ")
    )]
    InvalidDependentStrategy {
        owner: String,
        name: String,
        strategy: String,
        valid: Vec<String>,
    },

    #[error("Relation '{name}' is already defined on {owner}")]
    DuplicateRelation { owner: String, name: String },

    #[error("Invalid value for option '{option}' on relation '{name}' of {owner}: {reason}")]
    InvalidOptionValue {
        owner: String,
        name: String,
        option: String,
        reason: String,
    },

    // Resolution errors
    #[error(
        "When binding {target} to {owner}#{name}, the inverse could not be determined. \
         The attempted key was '{key}'"
    )]
    InverseNotFound {
        owner: String,
        name: String,
        target: String,
        key: String,
    },

    #[error(
        "Ambiguous relation {owner}#{name}: {target} declares several candidate inverses ({}). \
         Set `inverse_of` to pick one",
        .candidates.join(", ")
    )]
    AmbiguousRelationship {
        owner: String,
        name: String,
        target: String,
        candidates: Vec<String>,
    },

    #[error("Could not resolve type '{name}' referenced from {context} (attempted '{attempted}')")]
    UnresolvedType {
        name: String,
        context: String,
        attempted: String,
    },

    #[error("Model '{model}' is not registered")]
    UnknownModel { model: String },

    #[error("Model '{model}' has no relation named '{name}'")]
    UnknownRelation { model: String, name: String },

    #[error("Document handle {handle} does not belong to this session")]
    UnknownDocument { handle: usize },

    // Consistency errors
    #[error(
        "Referencing a(n) {embedded} document from the {root} document via a relational \
         association is not allowed since the {embedded} is embedded"
    )]
    MixedRelations { root: String, embedded: String },

    #[error(
        "Cannot set {owner}#{name} to a(n) {target}: {target} declares more than one \
         relation referencing it. Set `inverse_of` to pick one"
    )]
    InvalidSetPolymorphicRelation {
        owner: String,
        name: String,
        target: String,
    },

    #[error("Relation {owner}#{name} expects a(n) {expected} but was given a(n) {actual}")]
    WrongTargetType {
        owner: String,
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Attribute '{field}' of {model} was not loaded by the field projection in effect")]
    MissingAttribute { model: String, field: String },

    // Cascade errors
    #[error("Cannot delete {model} because of dependent '{relation}'")]
    DeleteRestriction { model: String, relation: String },

    // Unsaved-parent errors
    #[error("Attempted to save a(n) {document} through {base} while {base} is not yet persisted")]
    UnsavedDocument { base: String, document: String },

    // Collaborator errors
    #[error("Document(s) of {model} not found for id(s): {}", .ids.join(", "))]
    DocumentNotFound { model: String, ids: Vec<String> },

    #[error("Invalid value for field '{field}': {value}. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Callback '{callback}' on {model} aborted: {reason}")]
    CallbackAborted {
        model: String,
        callback: String,
        reason: String,
    },

    #[error("Relation '{relation}' does not forward '{method}'")]
    UndefinedProxyMethod { relation: String, method: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OdmError {
    /// Create a storage error from any displayable cause
    pub fn storage(cause: impl std::fmt::Display) -> Self {
        Self::Storage(cause.to_string())
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl std::fmt::Display,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }

    /// Whether this error is the controlled abort of a restrict cascade
    pub fn is_delete_restriction(&self) -> bool {
        matches!(self, Self::DeleteRestriction { .. })
    }

    /// Whether this error was raised while a relation was being declared
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRelationOption { .. }
                | Self::InvalidRelation { .. }
                | Self::InvalidDependentStrategy { .. }
                | Self::DuplicateRelation { .. }
                | Self::InvalidOptionValue { .. }
        )
    }
}

impl From<serde_json::Error> for OdmError {
    fn from(err: serde_json::Error) -> Self {
        OdmError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_message_lists_valid_options() {
        let err = OdmError::InvalidRelationOption {
            owner: "Person".to_string(),
            name: "posts".to_string(),
            option: "polymorphic".to_string(),
            valid: vec!["as".to_string(), "dependent".to_string()],
        };

        let message = err.to_string();
        assert!(message.contains("'polymorphic'"));
        assert!(message.contains("as, dependent"));
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_inverse_not_found_carries_context() {
        let err = OdmError::InverseNotFound {
            owner: "Person".to_string(),
            name: "posts".to_string(),
            target: "Post".to_string(),
            key: "person_id".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("Person#posts"));
        assert!(message.contains("person_id"));
        assert!(!err.is_delete_restriction());
    }

    #[test]
    fn test_delete_restriction_detection() {
        let err = OdmError::DeleteRestriction {
            model: "Person".to_string(),
            relation: "posts".to_string(),
        };
        assert!(err.is_delete_restriction());
        assert_eq!(err.to_string(), "Cannot delete Person because of dependent 'posts'");
    }
}
