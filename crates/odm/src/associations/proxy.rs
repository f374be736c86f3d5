//! Relation proxy - per-instance lazy wrapper around a relation's target
//!
//! State machine: `Unloaded -> Loaded` on first read, `Loaded -> Loaded` on
//! assignment, `Loaded -> Unloaded` on reset / reload.

use std::sync::Arc;

use serde_json::Value;

use super::metadata::{Association, RelationKind};
use crate::document::{DocHandle, RawDocument};

/// Whether a proxy's target has been resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loaded,
}

/// Target owned by a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    One(Option<DocHandle>),
    Many(Vec<DocHandle>),
}

/// Snapshot of a relation's target handed back to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    One(Option<DocHandle>),
    Many(Vec<DocHandle>),
}

impl Relation {
    /// Single target, or the first member of a collection
    pub fn one(&self) -> Option<DocHandle> {
        match self {
            Relation::One(handle) => *handle,
            Relation::Many(handles) => handles.first().copied(),
        }
    }

    /// Members as a slice; a single target yields zero or one
    pub fn many(&self) -> &[DocHandle] {
        match self {
            Relation::One(Some(handle)) => std::slice::from_ref(handle),
            Relation::One(None) => &[],
            Relation::Many(handles) => handles,
        }
    }

    /// Consume the snapshot into its member handles
    pub fn into_handles(self) -> Vec<DocHandle> {
        match self {
            Relation::One(handle) => handle.into_iter().collect(),
            Relation::Many(handles) => handles,
        }
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.many().len()
    }

    /// No target at all
    pub fn is_empty(&self) -> bool {
        self.many().is_empty()
    }
}

/// Lazy view of one relation on one document
#[derive(Debug, Clone)]
pub struct RelationProxy {
    association: Arc<Association>,
    target: Target,
    /// Members appended while the collection was still unloaded
    added: Vec<DocHandle>,
    load_state: LoadState,
}

impl RelationProxy {
    /// Unloaded proxy for a relation
    pub fn new(association: Arc<Association>) -> Self {
        let target = if association.kind().is_many() {
            Target::Many(Vec::new())
        } else {
            Target::One(None)
        };
        Self {
            association,
            target,
            added: Vec::new(),
            load_state: LoadState::Unloaded,
        }
    }

    /// Descriptor the proxy was created for
    pub fn association(&self) -> &Arc<Association> {
        &self.association
    }

    /// Get the current load state
    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    /// Whether the target has been resolved
    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    /// Loaded target, not counting unloaded additions
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Members were appended before the collection was loaded
    pub fn has_additions(&self) -> bool {
        !self.added.is_empty()
    }

    /// Single target, or the first loaded member of a collection
    pub fn one(&self) -> Option<DocHandle> {
        match &self.target {
            Target::One(handle) => *handle,
            Target::Many(handles) => handles.first().copied(),
        }
    }

    /// Every member known in memory, including unloaded additions
    pub fn members(&self) -> Vec<DocHandle> {
        let mut members = match &self.target {
            Target::One(handle) => handle.iter().copied().collect(),
            Target::Many(handles) => handles.clone(),
        };
        members.extend(self.added.iter().copied().filter(|h| !members_contains(&self.target, *h)));
        members
    }

    /// Whether `handle` is a member, loaded or added
    pub fn contains(&self, handle: DocHandle) -> bool {
        members_contains(&self.target, handle) || self.added.contains(&handle)
    }

    /// Snapshot of the current members
    pub fn relation(&self) -> Relation {
        match &self.target {
            Target::One(handle) => Relation::One(*handle),
            Target::Many(_) => Relation::Many(self.members()),
        }
    }

    /// Set a single target and mark the proxy loaded
    pub(crate) fn set_one(&mut self, handle: Option<DocHandle>) {
        self.target = Target::One(handle);
        self.load_state = LoadState::Loaded;
    }

    /// Replace a collection wholesale
    pub(crate) fn replace(&mut self, handles: Vec<DocHandle>) {
        self.target = Target::Many(handles);
        self.added.clear();
        self.load_state = LoadState::Loaded;
    }

    /// Append a member; on an unloaded collection the member is tracked without a fetch
    pub(crate) fn push(&mut self, handle: DocHandle) -> bool {
        if self.contains(handle) {
            return false;
        }
        if !self.association.kind().is_many() {
            self.set_one(Some(handle));
        } else if self.load_state == LoadState::Unloaded {
            self.added.push(handle);
        } else if let Target::Many(handles) = &mut self.target {
            handles.push(handle);
        }
        true
    }

    /// Remove a member, returning whether it was present
    pub(crate) fn remove(&mut self, handle: DocHandle) -> bool {
        let before = self.added.len();
        self.added.retain(|h| *h != handle);
        let mut removed = before != self.added.len();
        match &mut self.target {
            Target::One(current) if *current == Some(handle) => {
                *current = None;
                removed = true;
            }
            Target::Many(handles) => {
                let before = handles.len();
                handles.retain(|h| *h != handle);
                removed |= before != handles.len();
            }
            Target::One(_) => {}
        }
        removed
    }

    /// Complete a load with the fetched members, keeping unloaded additions after them
    pub(crate) fn finish_load(&mut self, fetched: Vec<DocHandle>) {
        match &mut self.target {
            Target::One(current) => *current = fetched.first().copied(),
            Target::Many(handles) => {
                let mut merged = fetched;
                for handle in self.added.drain(..) {
                    if !merged.contains(&handle) {
                        merged.push(handle);
                    }
                }
                *handles = merged;
            }
        }
        self.added.clear();
        self.load_state = LoadState::Loaded;
    }

    /// Drop every member and mark the relation loaded, so nothing is fetched again
    pub(crate) fn detach_all(&mut self) {
        self.target = match self.target {
            Target::One(_) => Target::One(None),
            Target::Many(_) => Target::Many(Vec::new()),
        };
        self.added.clear();
        self.load_state = LoadState::Loaded;
    }

    /// Forget the loaded target; additions still pending merge into the next load
    pub(crate) fn reset(&mut self) {
        self.target = match self.target {
            Target::One(_) => Target::One(None),
            Target::Many(_) => Target::Many(Vec::new()),
        };
        self.load_state = LoadState::Unloaded;
    }
}

fn members_contains(target: &Target, handle: DocHandle) -> bool {
    match target {
        Target::One(current) => *current == Some(handle),
        Target::Many(handles) => handles.contains(&handle),
    }
}

/// Operations a proxy forwards to its target
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyMethod {
    Count,
    Size,
    IsEmpty,
    Exists,
    First,
    Last,
    Ids,
    Include(DocHandle),
    Find(Value),
    Push(DocHandle),
    Delete(DocHandle),
    Clear,
    Nullify,
    Reload,
    Build(RawDocument),
    Create(RawDocument),
}

impl ProxyMethod {
    /// Method name as callers spell it
    pub fn name(&self) -> &'static str {
        match self {
            ProxyMethod::Count => "count",
            ProxyMethod::Size => "size",
            ProxyMethod::IsEmpty => "empty?",
            ProxyMethod::Exists => "exists?",
            ProxyMethod::First => "first",
            ProxyMethod::Last => "last",
            ProxyMethod::Ids => "ids",
            ProxyMethod::Include(_) => "include?",
            ProxyMethod::Find(_) => "find",
            ProxyMethod::Push(_) => "push",
            ProxyMethod::Delete(_) => "delete",
            ProxyMethod::Clear => "clear",
            ProxyMethod::Nullify => "nullify",
            ProxyMethod::Reload => "reload",
            ProxyMethod::Build(_) => "build",
            ProxyMethod::Create(_) => "create",
        }
    }
}

/// Result of a forwarded operation
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyOutput {
    Count(usize),
    Bool(bool),
    Document(Option<DocHandle>),
    Relation(Relation),
    Ids(Vec<Value>),
    Unit,
}

/// Capability set of each relation kind
pub fn forwards(kind: RelationKind, method: &ProxyMethod) -> bool {
    use ProxyMethod::*;

    match kind {
        RelationKind::HasMany | RelationKind::HasAndBelongsToMany => true,
        RelationKind::EmbedsMany => !matches!(method, Nullify),
        RelationKind::HasOne | RelationKind::EmbedsOne | RelationKind::BelongsTo => {
            matches!(method, Exists | IsEmpty | Reload | Build(_) | Create(_) | Nullify)
                && !(kind == RelationKind::EmbedsOne && matches!(method, Nullify))
        }
        RelationKind::EmbeddedIn => matches!(method, Exists | IsEmpty | Reload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::options::AssociationOptions;

    fn posts() -> Arc<Association> {
        let options = AssociationOptions::new();
        Arc::new(Association::define("Person", "posts", RelationKind::HasMany, options).unwrap())
    }

    #[test]
    fn test_unloaded_push_is_tracked_and_merged_on_load() {
        let mut proxy = RelationProxy::new(posts());
        assert!(proxy.push(DocHandle(7)));
        assert!(!proxy.is_loaded());
        assert_eq!(proxy.members(), vec![DocHandle(7)]);

        proxy.finish_load(vec![DocHandle(1), DocHandle(7), DocHandle(2)]);
        assert!(proxy.is_loaded());
        assert!(!proxy.has_additions());
        assert_eq!(proxy.members(), vec![DocHandle(1), DocHandle(7), DocHandle(2)]);
    }

    #[test]
    fn test_push_is_idempotent() {
        let mut proxy = RelationProxy::new(posts());
        proxy.replace(vec![DocHandle(1)]);
        assert!(!proxy.push(DocHandle(1)));
        assert_eq!(proxy.relation(), Relation::Many(vec![DocHandle(1)]));
    }

    #[test]
    fn test_reset_returns_to_unloaded() {
        let mut proxy = RelationProxy::new(posts());
        proxy.push(DocHandle(3));
        proxy.finish_load(vec![DocHandle(1)]);
        proxy.reset();
        assert_eq!(proxy.load_state(), LoadState::Unloaded);
        assert!(proxy.members().is_empty());
    }

    #[test]
    fn test_detach_all_stays_loaded_and_empty() {
        let mut proxy = RelationProxy::new(posts());
        proxy.push(DocHandle(4));
        proxy.detach_all();
        assert!(proxy.is_loaded());
        assert!(!proxy.has_additions());
        assert_eq!(proxy.relation(), Relation::Many(Vec::new()));
    }

    #[test]
    fn test_remove_reports_presence() {
        let mut proxy = RelationProxy::new(posts());
        proxy.replace(vec![DocHandle(1), DocHandle(2)]);
        assert!(proxy.remove(DocHandle(1)));
        assert!(!proxy.remove(DocHandle(9)));
        assert_eq!(proxy.members(), vec![DocHandle(2)]);
    }

    #[test]
    fn test_capability_sets() {
        assert!(forwards(RelationKind::HasMany, &ProxyMethod::Nullify));
        assert!(!forwards(RelationKind::EmbedsMany, &ProxyMethod::Nullify));
        assert!(forwards(RelationKind::HasOne, &ProxyMethod::Exists));
        assert!(!forwards(RelationKind::BelongsTo, &ProxyMethod::Push(DocHandle(0))));
        assert!(!forwards(RelationKind::EmbeddedIn, &ProxyMethod::Build(RawDocument::new())));
    }
}
