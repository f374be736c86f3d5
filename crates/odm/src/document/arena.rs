//! Document arena and identity map
//!
//! Every document of a unit of work lives here and is addressed by a
//! [`DocHandle`]. Parent/child links between embedded documents are handles,
//! never owning pointers, so self-referential trees need no recursive types.

use std::collections::HashMap;

use serde_json::Value;

use super::{id_key, DocHandle, Document, EmbeddedParent};
use crate::error::{OdmError, OdmResult};

#[derive(Debug, Default)]
pub struct DocumentArena {
    documents: Vec<Document>,
    /// (model, id) -> handle, top-level documents only
    identity: HashMap<(String, String), DocHandle>,
}

impl DocumentArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a top-level document and register its identity
    pub fn insert(&mut self, document: Document) -> DocHandle {
        let handle = DocHandle(self.documents.len());
        let key = (document.model().to_string(), id_key(document.id()));
        self.documents.push(document);
        self.identity.insert(key, handle);
        handle
    }

    /// Store a document embedded in `parent`; embedded documents bypass the identity map
    pub fn insert_embedded(&mut self, mut document: Document, parent: EmbeddedParent) -> DocHandle {
        let handle = DocHandle(self.documents.len());
        document.embedded_parent = Some(parent);
        self.documents.push(document);
        handle
    }

    /// Store a document that will be attached to a parent later
    pub fn insert_detached(&mut self, document: Document) -> DocHandle {
        let handle = DocHandle(self.documents.len());
        self.documents.push(document);
        handle
    }

    pub fn get(&self, handle: DocHandle) -> OdmResult<&Document> {
        self.documents
            .get(handle.0)
            .ok_or(OdmError::UnknownDocument { handle: handle.0 })
    }

    pub fn get_mut(&mut self, handle: DocHandle) -> OdmResult<&mut Document> {
        self.documents
            .get_mut(handle.0)
            .ok_or(OdmError::UnknownDocument { handle: handle.0 })
    }

    /// Already materialized top-level document with this identity
    pub fn lookup(&self, model: &str, id: &Value) -> Option<DocHandle> {
        self.identity.get(&(model.to_string(), id_key(id))).copied()
    }

    /// Forget a document's identity so a later fetch materializes a fresh copy
    pub fn evict(&mut self, model: &str, id: &Value) {
        self.identity.remove(&(model.to_string(), id_key(id)));
    }

    /// Top-most ancestor of a (possibly embedded) document
    pub fn root_of(&self, handle: DocHandle) -> OdmResult<DocHandle> {
        let mut current = handle;
        let mut hops = 0;
        while let Some(parent) = &self.get(current)?.embedded_parent {
            current = parent.handle;
            hops += 1;
            // A corrupted parent chain would otherwise never terminate
            if hops > self.documents.len() {
                break;
            }
        }
        Ok(current)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = DocHandle> + '_ {
        (0..self.documents.len()).map(DocHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_map_lookup() {
        let mut arena = DocumentArena::new();
        let handle = arena.insert(Document::with_id("Person", json!("p1")));

        assert_eq!(arena.lookup("Person", &json!("p1")), Some(handle));
        assert_eq!(arena.lookup("Post", &json!("p1")), None);

        arena.evict("Person", &json!("p1"));
        assert_eq!(arena.lookup("Person", &json!("p1")), None);
    }

    #[test]
    fn test_embedded_documents_resolve_their_root() {
        let mut arena = DocumentArena::new();
        let root = arena.insert(Document::with_id("Person", json!("p1")));
        let child = arena.insert_embedded(
            Document::with_id("Address", json!("a1")),
            EmbeddedParent {
                handle: root,
                relation: "addresses".to_string(),
            },
        );
        let grandchild = arena.insert_embedded(
            Document::with_id("Code", json!("c1")),
            EmbeddedParent {
                handle: child,
                relation: "code".to_string(),
            },
        );

        assert_eq!(arena.root_of(grandchild).unwrap(), root);
        assert_eq!(arena.lookup("Address", &json!("a1")), None);
    }

    #[test]
    fn test_unknown_handle() {
        let arena = DocumentArena::new();
        let err = arena.get(DocHandle(3)).unwrap_err();
        assert!(matches!(err, OdmError::UnknownDocument { handle: 3 }));
    }
}
