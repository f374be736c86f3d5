//! Callback runner collaborator
//!
//! Hooks are opaque to the association engine: the only thing it consults is
//! whether a callback aborted.

use crate::document::Document;
use crate::error::OdmResult;

/// Lifecycle points the session runs callbacks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Build,
    Initialize,
    Save,
    Destroy,
}

impl CallbackKind {
    /// Callback name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Build => "build",
            CallbackKind::Initialize => "initialize",
            CallbackKind::Save => "save",
            CallbackKind::Destroy => "destroy",
        }
    }
}

/// Runs model lifecycle callbacks on behalf of the session
pub trait CallbackRunner: Send + Sync {
    /// Run the callbacks of `kind` for a document; an error aborts the operation
    fn run_callbacks(&self, _kind: CallbackKind, _document: &Document) -> OdmResult<()> {
        Ok(())
    }

    /// Run callbacks deferred until an embedded document has been materialized
    fn run_pending_callbacks(&self, _document: &Document) -> OdmResult<()> {
        Ok(())
    }
}

/// Callback runner that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl CallbackRunner for NoopCallbacks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OdmError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct Aborting {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl CallbackRunner for Aborting {
        fn run_callbacks(&self, kind: CallbackKind, document: &Document) -> OdmResult<()> {
            self.calls.lock().unwrap().push(format!("{}:{}", kind.as_str(), document.model()));
            if kind == CallbackKind::Destroy {
                return Err(OdmError::CallbackAborted {
                    model: document.model().to_string(),
                    callback: kind.as_str().to_string(),
                    reason: "locked".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_noop_runner_never_aborts() {
        let document = Document::with_id("Person", json!("p1"));
        assert!(NoopCallbacks.run_callbacks(CallbackKind::Save, &document).is_ok());
        assert!(NoopCallbacks.run_pending_callbacks(&document).is_ok());
    }

    #[test]
    fn test_custom_runner_can_abort() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = Aborting { calls: calls.clone() };
        let document = Document::with_id("Person", json!("p1"));

        assert!(runner.run_callbacks(CallbackKind::Build, &document).is_ok());
        assert!(runner.run_callbacks(CallbackKind::Destroy, &document).is_err());
        assert_eq!(*calls.lock().unwrap(), vec!["build:Person", "destroy:Person"]);
    }
}
