// Lookup of currently open graph documents.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use super::live::LiveDocument;

/// Finds the open document of a graph, if any.
pub trait DocumentLookup: Send + Sync {
    fn lookup(&self, graph_id: &str) -> Option<Arc<LiveDocument>>;
}

/// Weak index of live documents keyed by graph id.
///
/// Registration and removal are driven by the transport; the registry never
/// keeps a document alive on its own.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    documents: Arc<RwLock<HashMap<String, Weak<LiveDocument>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, document: &Arc<LiveDocument>) {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        documents.insert(document.graph_id().to_owned(), Arc::downgrade(document));
    }

    /// Removes the entry only if it still points at `document`.
    pub fn unregister(&self, document: &Arc<LiveDocument>) {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let is_current = documents
            .get(document.graph_id())
            .is_some_and(|registered| registered.as_ptr() == Arc::as_ptr(document));
        if is_current {
            documents.remove(document.graph_id());
        }
    }

    pub fn open_graphs(&self) -> usize {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents.values().filter(|document| document.strong_count() > 0).count()
    }
}

impl DocumentLookup for SessionRegistry {
    fn lookup(&self, graph_id: &str) -> Option<Arc<LiveDocument>> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents.get(graph_id).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::document::GraphDocument;

    #[test]
    fn lookup_returns_registered_document() {
        let registry = SessionRegistry::new();
        let live = LiveDocument::new("g1", GraphDocument::new());
        registry.register(&live);

        let found = registry.lookup("g1").expect("registered");
        assert!(Arc::ptr_eq(&found, &live));
        assert!(registry.lookup("g2").is_none());
    }

    #[test]
    fn dropped_documents_are_not_resurrected() {
        let registry = SessionRegistry::new();
        let live = LiveDocument::new("g1", GraphDocument::new());
        registry.register(&live);
        drop(live);

        assert!(registry.lookup("g1").is_none());
        assert_eq!(registry.open_graphs(), 0);
    }

    #[test]
    fn stale_unregister_keeps_newer_document() {
        let registry = SessionRegistry::new();
        let old = LiveDocument::new("g1", GraphDocument::new());
        registry.register(&old);
        let newer = LiveDocument::new("g1", GraphDocument::new());
        registry.register(&newer);

        registry.unregister(&old);
        let found = registry.lookup("g1").expect("newer stays registered");
        assert!(Arc::ptr_eq(&found, &newer));
    }
}
