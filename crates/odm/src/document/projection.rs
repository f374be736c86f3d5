//! Field projections (`only` / `without`) and their propagation into embedded associations

use serde_json::Value;

use super::{RawDocument, ID_FIELD};

/// Positional-match projection key
const POSITIONAL: &str = "$";

/// A field projection recorded on a document loaded with `only` or `without`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    /// Projected paths in declaration order, `true` for inclusion
    fields: Vec<(String, bool)>,
}

/// How an embedded association of a projected document must be filtered
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationFilter {
    /// Every field of the association is available
    Unfiltered,
    /// Only the nested projection applies to the association's documents
    Fields(Projection),
}

impl Projection {
    /// Inclusive projection over the given (possibly dotted) paths
    pub fn only<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|f| (f.into(), true)).collect(),
        }
    }

    /// Exclusionary projection over the given (possibly dotted) paths
    pub fn without<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|f| (f.into(), false)).collect(),
        }
    }

    /// Append a path to the projection
    pub fn with_field(mut self, field: impl Into<String>, included: bool) -> Self {
        self.fields.push((field.into(), included));
        self
    }

    pub fn fields(&self) -> &[(String, bool)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether every projected path is an exclusion
    pub fn is_exclusionary(&self) -> bool {
        !self.fields.is_empty() && self.fields.iter().all(|(_, included)| !included)
    }

    /// Whether the top-level field was loaded under this projection
    pub fn allows(&self, field: &str) -> bool {
        if self.fields.is_empty() || field == ID_FIELD {
            return true;
        }

        let last_mention = self
            .fields
            .iter()
            .rev()
            .find(|(path, _)| head(path) == field);

        match last_mention {
            // A nested exclusion still loads the enclosing field
            Some((path, included)) => *included || path.as_str() != field,
            None => self.is_exclusionary(),
        }
    }

    /// Projection to apply to the documents of the association stored under `key`
    pub fn for_association(&self, key: &str) -> AssociationFilter {
        if self.is_exclusionary() && !self.fields.iter().any(|(path, _)| head(path) == key) {
            return AssociationFilter::Unfiltered;
        }

        let mut nested: Vec<(String, bool)> = Vec::new();
        for (path, included) in &self.fields {
            match path.split_once('.') {
                Some((first, rest)) if first == key => nested.push((rest.to_string(), *included)),
                // Projecting the whole association overrides narrower paths seen before it
                None if path == key => nested.clear(),
                _ => {}
            }
        }

        if nested.is_empty() || (nested.len() == 1 && nested[0].0 == POSITIONAL) {
            AssociationFilter::Unfiltered
        } else {
            AssociationFilter::Fields(Projection { fields: nested })
        }
    }

    /// Filter a raw document down to the projected fields, descending into nested documents
    pub fn apply(&self, raw: &RawDocument) -> RawDocument {
        if self.fields.is_empty() {
            return raw.clone();
        }

        raw.iter()
            .filter(|(field, _)| self.allows(field))
            .map(|(field, value)| {
                let value = match self.for_association(field) {
                    AssociationFilter::Fields(nested) => nested.apply_value(value),
                    AssociationFilter::Unfiltered => value.clone(),
                };
                (field.clone(), value)
            })
            .collect()
    }

    fn apply_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.apply(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.apply_value(item)).collect())
            }
            other => other.clone(),
        }
    }
}

fn head(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}
