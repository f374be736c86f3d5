//! Model registry - runtime lookup of model definitions and type-name resolution

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use super::definition::ModelDefinition;
use crate::associations::inference::namespace_of;
use crate::associations::metadata::RelationKind;
use crate::error::{OdmError, OdmResult};

/// Thread-safe registry of frozen model definitions
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Arc<DashMap<String, Arc<ModelDefinition>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze a definition and make it resolvable by name
    pub fn register(&self, definition: ModelDefinition) -> Arc<ModelDefinition> {
        let definition = Arc::new(definition);
        debug!(
            "Registered model {} with {} relation(s)",
            definition.name(),
            definition.associations().len()
        );
        self.models.insert(definition.name().to_string(), Arc::clone(&definition));
        definition
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDefinition>> {
        self.models.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn require(&self, name: &str) -> OdmResult<Arc<ModelDefinition>> {
        self.get(name).ok_or_else(|| OdmError::UnknownModel {
            model: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve a possibly namespaced type name the way it would resolve lexically
    /// inside `context`: `Context::Name`, then each enclosing namespace, then the
    /// top level. A leading `::` makes the name absolute. Failure reports the
    /// innermost attempt.
    pub fn resolve_type(&self, name: &str, context: &str) -> OdmResult<String> {
        if let Some(absolute) = name.strip_prefix("::") {
            return if self.contains(absolute) {
                Ok(absolute.to_string())
            } else {
                Err(OdmError::UnresolvedType {
                    name: name.to_string(),
                    context: context.to_string(),
                    attempted: absolute.to_string(),
                })
            };
        }

        let mut attempts = Vec::new();
        let mut scope = Some(context);
        while let Some(current) = scope {
            let candidate = format!("{current}::{name}");
            if self.contains(&candidate) {
                return Ok(candidate);
            }
            attempts.push(candidate);
            scope = namespace_of(current);
        }

        if self.contains(name) {
            return Ok(name.to_string());
        }
        attempts.push(name.to_string());

        Err(OdmError::UnresolvedType {
            name: name.to_string(),
            context: context.to_string(),
            attempted: attempts.swap_remove(0),
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_models: self.models.len(),
            ..RegistryStats::default()
        };
        for entry in self.models.iter() {
            let definition = entry.value();
            stats.total_associations += definition.associations().len();
            stats.dependent_entries += definition.dependents().len();
            for association in definition.associations() {
                *stats.kind_counts.entry(association.kind()).or_insert(0) += 1;
            }
        }
        stats
    }

    pub fn clear(&self) {
        self.models.clear();
    }
}

/// Statistics about the model registry
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_models: usize,
    pub total_associations: usize,
    pub dependent_entries: usize,
    pub kind_counts: HashMap<RelationKind, usize>,
}

impl RegistryStats {
    /// Most frequently declared relation kind
    pub fn most_common_kind(&self) -> Option<(RelationKind, usize)> {
        self.kind_counts
            .iter()
            .max_by_key(|(_, count)| *count)
            .map(|(kind, count)| (*kind, *count))
    }
}

static GLOBAL_REGISTRY: Lazy<ModelRegistry> = Lazy::new(ModelRegistry::new);

/// Process-wide registry for applications that do not thread their own
pub fn global_registry() -> &'static ModelRegistry {
    &GLOBAL_REGISTRY
}
