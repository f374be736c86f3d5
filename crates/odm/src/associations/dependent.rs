//! Dependent registry - cascade strategies applied when a base document is destroyed

use std::fmt;

use serde_json::Value;
use tracing::debug;

use super::metadata::{Association, RelationKind};
use crate::backends::Filter;
use crate::document::{DocHandle, ValidationError};
use crate::error::{OdmError, OdmResult};
use crate::session::Session;

/// Cascade policy of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependentStrategy {
    DeleteAll,
    Destroy,
    Nullify,
    RestrictWithException,
    RestrictWithError,
}

impl DependentStrategy {
    pub const ALL: [DependentStrategy; 5] = [
        DependentStrategy::DeleteAll,
        DependentStrategy::Destroy,
        DependentStrategy::Nullify,
        DependentStrategy::RestrictWithException,
        DependentStrategy::RestrictWithError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependentStrategy::DeleteAll => "delete_all",
            DependentStrategy::Destroy => "destroy",
            DependentStrategy::Nullify => "nullify",
            DependentStrategy::RestrictWithException => "restrict_with_exception",
            DependentStrategy::RestrictWithError => "restrict_with_error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|strategy| strategy.as_str() == name)
    }

    pub fn is_restrict(&self) -> bool {
        matches!(
            self,
            DependentStrategy::RestrictWithException | DependentStrategy::RestrictWithError
        )
    }
}

impl fmt::Display for DependentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registry entry, kept in declaration order on the model definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentEntry {
    pub relation: String,
    pub strategy: DependentStrategy,
}

impl Session {
    /// Run the cascades declared on `base`'s model in declaration order.
    ///
    /// Returns `Ok(false)` when a `restrict_with_error` entry fired; the base then
    /// carries a validation error and must not be removed. A firing
    /// `restrict_with_exception` entry returns `DeleteRestriction`.
    pub async fn apply_delete_dependencies(&mut self, base: DocHandle) -> OdmResult<bool> {
        let model = self.document(base)?.model().to_string();
        let definition = self.registry().require(&model)?;

        for entry in definition.dependents() {
            let association = definition.require_association(&entry.relation)?;
            debug!(
                "Applying dependent {} on {}#{}",
                entry.strategy, model, entry.relation
            );

            match entry.strategy {
                DependentStrategy::DeleteAll => self.cascade_delete_all(base, &association).await?,
                DependentStrategy::Destroy => {
                    let members =
                        self.without_autobuild().relation_members(base, &entry.relation).await?;
                    for member in members {
                        if !self.document(member)?.is_destroyed() {
                            self.destroy(member).await?;
                        }
                    }
                }
                DependentStrategy::Nullify => self.nullify(base, &entry.relation).await?,
                DependentStrategy::RestrictWithException => {
                    if !self.relation_is_empty(base, &association).await? {
                        return Err(OdmError::DeleteRestriction {
                            model,
                            relation: entry.relation.clone(),
                        });
                    }
                }
                DependentStrategy::RestrictWithError => {
                    if !self.relation_is_empty(base, &association).await? {
                        let message = format!(
                            "Cannot delete record because dependent {} exist",
                            entry.relation
                        );
                        self.document_mut(base)?
                            .errors
                            .push(ValidationError::new(entry.relation.clone(), message));
                        return Ok(false);
                    }
                }
            }
        }

        Ok(true)
    }

    async fn cascade_delete_all(
        &mut self,
        base: DocHandle,
        association: &Association,
    ) -> OdmResult<()> {
        let bulk = match association.kind() {
            RelationKind::HasOne | RelationKind::HasMany => {
                let target = association.target_type(self.registry())?;
                self.registry().require(&target)?.dependents().is_empty()
            }
            _ => false,
        };

        if bulk && self.document(base)?.is_persisted() {
            let target = association.target_type(self.registry())?;
            let filter = self.referenced_filter(base, association)?;
            let resident = self.resident_members(base, association, &target, &filter)?;
            let removed = self.store().delete_matching(&target, filter).await?;
            debug!("Bulk deleted {} {} documents", removed, target);
            for member in resident {
                self.mark_deleted(member)?;
            }
        } else {
            let members =
                self.without_autobuild().relation_members(base, association.name()).await?;
            for member in members {
                if !self.document(member)?.is_destroyed() {
                    self.delete(member).await?;
                }
            }
        }

        self.clear_proxy(base, association.name())?;
        Ok(())
    }

    /// Targets of a referenced relation already in the arena; never fetches
    fn resident_members(
        &self,
        base: DocHandle,
        association: &Association,
        target: &str,
        filter: &Filter,
    ) -> OdmResult<Vec<DocHandle>> {
        let mut members = self
            .document(base)?
            .relation_proxy(association.name())
            .map(|proxy| proxy.members())
            .unwrap_or_default();
        for handle in self.arena().handles() {
            let document = self.document(handle)?;
            if document.model() == target
                && !document.is_destroyed()
                && document.embedded_parent().is_none()
                && filter.matches(&document.attributes)
                && !members.contains(&handle)
            {
                members.push(handle);
            }
        }
        members.retain(|handle| {
            self.document(*handle)
                .is_ok_and(|document| !document.is_destroyed())
        });
        Ok(members)
    }

    /// Emptiness check that avoids loading an unloaded referenced collection
    pub(crate) async fn relation_is_empty(
        &mut self,
        base: DocHandle,
        association: &Association,
    ) -> OdmResult<bool> {
        if let Some(proxy) = self.document(base)?.relation_proxy(association.name()) {
            if proxy.is_loaded() || proxy.has_additions() {
                return Ok(proxy.members().is_empty());
            }
        }

        match association.kind() {
            RelationKind::HasOne | RelationKind::HasMany => {
                if !self.document(base)?.is_persisted() {
                    return Ok(true);
                }
                let target = association.target_type(self.registry())?;
                let filter = self.referenced_filter(base, association)?;
                Ok(self.store().aggregate(&target, filter).await?.count == 0)
            }
            RelationKind::HasAndBelongsToMany => {
                let foreign_key = association.foreign_key_or_default();
                let ids = self.document(base)?.attribute(foreign_key).clone();
                Ok(match ids {
                    Value::Array(items) => items.is_empty(),
                    _ => true,
                })
            }
            RelationKind::BelongsTo => {
                let foreign_key = association.foreign_key_or_default();
                Ok(self.document(base)?.attribute(foreign_key).is_null())
            }
            _ => Ok(self
                .without_autobuild()
                .relation_members(base, association.name())
                .await?
                .is_empty()),
        }
    }

    /// Filter selecting the stored targets of a has_one / has_many relation
    pub(crate) fn referenced_filter(
        &self,
        base: DocHandle,
        association: &Association,
    ) -> OdmResult<Filter> {
        let document = self.document(base)?;
        let key = document.attribute(association.primary_key()).clone();
        let mut filter = Filter::eq(association.foreign_key_or_default(), key);
        if let Some(type_field) = association.type_field() {
            if association.role().is_some() {
                let model = Value::String(document.model().to_string());
                filter = filter.and(Filter::eq(type_field, model));
            }
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in DependentStrategy::ALL {
            assert_eq!(DependentStrategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(DependentStrategy::parse("explode"), None);
    }

    #[test]
    fn test_restrict_detection() {
        assert!(DependentStrategy::RestrictWithError.is_restrict());
        assert!(DependentStrategy::RestrictWithException.is_restrict());
        assert!(!DependentStrategy::Nullify.is_restrict());
    }
}
