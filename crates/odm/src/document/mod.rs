//! Documents - raw attributes plus the relation proxies owned by each instance

pub mod arena;
pub mod projection;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::associations::proxy::RelationProxy;
use crate::error::{OdmError, OdmResult};

pub use arena::DocumentArena;
pub use projection::{AssociationFilter, Projection};

/// Raw stored form of a document
pub type RawDocument = serde_json::Map<String, Value>;

/// Identity field of every document
pub const ID_FIELD: &str = "_id";

/// Timestamp field maintained on save and by `touch`
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Opaque reference to a document living in a [`DocumentArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocHandle(pub(crate) usize);

impl DocHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Validation-style error attached to a document (e.g. by `restrict_with_error`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub attribute: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

/// Reference to a descriptor by its identity `(owner, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationRef {
    pub owner: String,
    pub name: String,
}

impl AssociationRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

/// Weak back-reference from an embedded document to its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedParent {
    pub handle: DocHandle,
    /// Name of the embedding relation on the parent
    pub relation: String,
}

/// One model instance
#[derive(Debug, Clone)]
pub struct Document {
    model: String,
    pub(crate) attributes: RawDocument,
    pub(crate) persisted: bool,
    pub(crate) destroyed: bool,
    pub(crate) frozen: bool,
    pub(crate) projection: Option<Projection>,
    pub(crate) embedded_parent: Option<EmbeddedParent>,
    /// Offset inside the parent's embedded collection
    pub(crate) position: Option<usize>,
    /// The descriptor on the other side this document currently answers to
    pub(crate) association: Option<AssociationRef>,
    pub(crate) relations: HashMap<String, RelationProxy>,
    /// Parent (model, key) each counter-cached relation was last counted against
    pub(crate) counted_parents: HashMap<String, Option<(String, Value)>>,
    pub(crate) errors: Vec<ValidationError>,
}

impl Document {
    pub fn new(model: impl Into<String>, attributes: RawDocument) -> Self {
        Self {
            model: model.into(),
            attributes,
            persisted: false,
            destroyed: false,
            frozen: false,
            projection: None,
            embedded_parent: None,
            position: None,
            association: None,
            relations: HashMap::new(),
            counted_parents: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// New document carrying only an identity
    pub fn with_id(model: impl Into<String>, id: Value) -> Self {
        let mut attributes = RawDocument::new();
        attributes.insert(ID_FIELD.to_string(), id);
        Self::new(model, attributes)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> &Value {
        self.attributes.get(ID_FIELD).unwrap_or(&Value::Null)
    }

    pub fn attributes(&self) -> &RawDocument {
        &self.attributes
    }

    /// Read an attribute, honouring the projection the document was loaded with
    pub fn read_attribute(&self, field: &str) -> OdmResult<Value> {
        if let Some(projection) = &self.projection {
            if !projection.allows(field) {
                return Err(OdmError::MissingAttribute {
                    model: self.model.clone(),
                    field: field.to_string(),
                });
            }
        }
        Ok(self.attributes.get(field).cloned().unwrap_or(Value::Null))
    }

    /// Raw attribute value, `Null` when absent
    pub fn attribute(&self, field: &str) -> &Value {
        self.attributes.get(field).unwrap_or(&Value::Null)
    }

    pub(crate) fn set_attribute(&mut self, field: &str, value: Value) {
        self.attributes.insert(field.to_string(), value);
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_new_record(&self) -> bool {
        !self.persisted
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Destroyed or frozen documents never have their keys rewritten
    pub fn is_immutable(&self) -> bool {
        self.destroyed || self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded_parent.is_some()
    }

    pub fn embedded_parent(&self) -> Option<&EmbeddedParent> {
        self.embedded_parent.as_ref()
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    pub fn association(&self) -> Option<&AssociationRef> {
        self.association.as_ref()
    }

    pub fn relation_proxy(&self, name: &str) -> Option<&RelationProxy> {
        self.relations.get(name)
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Hashable form of an identity value
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fresh document identity
pub fn generate_id() -> Value {
    Value::String(uuid::Uuid::new_v4().to_string())
}
