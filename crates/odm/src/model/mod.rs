//! Model definitions and their registry

pub mod definition;
pub mod registry;

pub use definition::ModelDefinition;
pub use registry::{global_registry, ModelRegistry, RegistryStats};
