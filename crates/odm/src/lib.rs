//! # elif-odm: association engine for document models
//!
//! Relation descriptors declared on model definitions, lazy per-instance
//! relation proxies, bidirectional binding of keys and back-references,
//! batched eager loading and dependent cascades on destroy.
//!
//! Documents live in a [`Session`] arena and are addressed by [`DocHandle`];
//! the session talks to storage through the [`DocumentStore`] and
//! [`Persister`] traits. [`MemoryStore`] implements both.

pub mod error;
pub mod config;
pub mod backends;
pub mod coercion;
pub mod callbacks;
pub mod document;
pub mod model;
pub mod associations;
pub mod session;

pub use associations::*;
pub use backends::{
    AggregateStats, DocumentStore, FetchRequest, Filter, MemoryStore, Persister, SortDirection,
    SortSpec,
};
pub use callbacks::{CallbackKind, CallbackRunner, NoopCallbacks};
pub use coercion::{FieldCoercer, FieldType, SchemaCoercer};
pub use config::{ConfigError, OdmConfig};
pub use document::{
    AssociationFilter, AssociationRef, DocHandle, Document, DocumentArena, EmbeddedParent,
    Projection, RawDocument, ValidationError, ID_FIELD, UPDATED_AT_FIELD,
};
pub use error::{OdmError, OdmResult};
pub use model::{global_registry, ModelDefinition, ModelRegistry, RegistryStats};
pub use session::{LocalBoxFuture, Session, WithoutAutobuild};
