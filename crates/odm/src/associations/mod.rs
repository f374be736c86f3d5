//! Associations - relation metadata, proxies, binding, eager loading and cascades

pub mod inference;
pub mod options;
pub mod metadata;
pub mod proxy;
pub mod binding;
pub mod accessors;
pub mod eager_loading;
pub mod dependent;
pub mod hooks;

pub use accessors::Seed;
pub use binding::Binding;
pub use dependent::{DependentEntry, DependentStrategy};
pub use eager_loading::{IncludeTree, Inclusion};
pub use hooks::{AssociationHook, HookKind, IndexRequest};
pub use metadata::{AccessorNames, Association, RelationKind};
pub use options::{AssociationOptions, OptionKey, RelationOption};
pub use proxy::{forwards, LoadState, ProxyMethod, ProxyOutput, Relation, RelationProxy, Target};
