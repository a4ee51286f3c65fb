// Flushes graph documents back to the relational store.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::document::GraphDocument;
use super::entries::document_node_row;
use crate::store::{DocumentNodeRow, GraphStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Quiet time after the latest merge.
    pub debounce: Duration,
    /// Upper bound measured from the first unflushed merge.
    pub max_debounce: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self { debounce: Duration::from_secs(2), max_debounce: Duration::from_secs(10) }
    }
}

impl FlushPolicy {
    pub fn new(debounce: Duration, max_debounce: Duration) -> Self {
        Self { debounce, max_debounce: max_debounce.max(debounce) }
    }

    /// When a document with pending merges should be flushed.
    pub fn deadline(&self, first_unflushed: Instant, last_change: Instant) -> Instant {
        (last_change + self.debounce).min(first_unflushed + self.max_debounce)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored { snapshot_bytes: usize, nodes_synced: usize },
    /// The snapshot write failed; the live document is untouched.
    Failed,
}

/// Point-in-time copy of everything a flush writes.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub state: Vec<u8>,
    pub rows: Vec<DocumentNodeRow>,
}

impl DocumentSnapshot {
    pub fn capture(document: &GraphDocument) -> Self {
        let rows = document
            .nodes()
            .iter()
            .filter_map(|(node_id, entry)| document_node_row(node_id, entry))
            .collect();
        Self { state: document.encode_state(), rows }
    }
}

#[derive(Clone)]
pub struct DocumentPersister {
    store: GraphStore,
}

impl DocumentPersister {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// Writes the snapshot, then upserts node rows from the document.
    ///
    /// Errors are logged and swallowed. A later flush supersedes a failed one.
    pub async fn persist(&self, graph_id: &str, document: &GraphDocument) -> PersistOutcome {
        self.store_snapshot(graph_id, DocumentSnapshot::capture(document)).await
    }

    pub async fn store_snapshot(&self, graph_id: &str, snapshot: DocumentSnapshot) -> PersistOutcome {
        let DocumentSnapshot { state, rows } = snapshot;

        if let Err(error) = self.store.update_yjs_state(graph_id, &state).await {
            error!(graph_id, ?error, "failed to store graph document snapshot");
            return PersistOutcome::Failed;
        }
        debug!(graph_id, snapshot_bytes = state.len(), "stored graph document snapshot");

        let nodes_synced = match self.store.upsert_nodes_from_document(graph_id, &rows).await {
            Ok(()) => rows.len(),
            Err(error) => {
                warn!(graph_id, ?error, "failed to sync document nodes to node table");
                0
            }
        };
        info!(graph_id, snapshot_bytes = state.len(), nodes_synced, "flushed graph document");

        PersistOutcome::Stored { snapshot_bytes: state.len(), nodes_synced }
    }
}
