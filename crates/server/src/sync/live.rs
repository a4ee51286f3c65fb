// A graph document that is currently open by at least one client.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde_json::{Map as JsonMap, Value};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use yrs::sync::{Awareness, Message, SyncMessage};
use yrs::updates::encoder::Encode;

use cdm_common::events::NodeChanged;

use super::changes::ChangeTracker;
use super::document::GraphDocument;

/// Origin id used for frames produced by the server itself.
pub const SERVER_ORIGIN: u64 = 0;

const UPDATE_BUFFER_SIZE: usize = 256;

/// Shared by every connection of one graph. The transport owns the `Arc`.
pub struct LiveDocument {
    graph_id: String,
    document: GraphDocument,
    awareness: Mutex<Awareness>,
    updates_tx: broadcast::Sender<(u64, Vec<u8>)>,
    tracker: StdMutex<ChangeTracker>,
}

impl LiveDocument {
    pub fn new(graph_id: impl Into<String>, document: GraphDocument) -> Arc<Self> {
        let graph_id = graph_id.into();
        let awareness = Awareness::new(document.doc().clone());
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER_SIZE);

        let mut tracker = ChangeTracker::new();
        tracker.observe(&graph_id, &document.nodes());

        Arc::new(Self {
            graph_id,
            document,
            awareness: Mutex::new(awareness),
            updates_tx,
            tracker: StdMutex::new(tracker),
        })
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Exclusive access for the sync protocol. The document is shared with
    /// the awareness, so every read or write goes through this lock.
    pub async fn awareness(&self) -> MutexGuard<'_, Awareness> {
        self.awareness.lock().await
    }

    pub async fn read<R>(&self, read: impl FnOnce(&GraphDocument) -> R) -> R {
        let _guard = self.awareness.lock().await;
        read(&self.document)
    }

    /// Frames broadcast to connections, tagged with the originating client.
    pub fn subscribe(&self) -> broadcast::Receiver<(u64, Vec<u8>)> {
        self.updates_tx.subscribe()
    }

    /// Fans a y-sync frame out to every connection except `origin`.
    pub fn broadcast(&self, origin: u64, frame: Vec<u8>) {
        let _ = self.updates_tx.send((origin, frame));
    }

    /// Patches one node entry and broadcasts the delta to all connections.
    ///
    /// Returns `false` when the node is not part of this document.
    pub async fn patch_node<F>(&self, node_id: &str, patch: F) -> bool
    where
        F: FnOnce(&mut JsonMap<String, Value>),
    {
        let delta = {
            let _guard = self.awareness.lock().await;
            self.document.patch_node(node_id, patch)
        };
        match delta {
            Some(delta) => {
                let frame = Message::Sync(SyncMessage::Update(delta)).encode_v1();
                self.broadcast(SERVER_ORIGIN, frame);
                true
            }
            None => false,
        }
    }

    /// Node entries whose tracked fields changed since the last call.
    pub async fn take_changes(&self) -> Vec<NodeChanged> {
        let entries = self.read(GraphDocument::nodes).await;
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.observe(&self.graph_id, &entries)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn live_with_node() -> Arc<LiveDocument> {
        let document = GraphDocument::new();
        document.write(|writer| writer.set_node("n1", &json!({ "id": "n1", "label": "Pump" })));
        LiveDocument::new("g1", document)
    }

    #[tokio::test]
    async fn patch_broadcasts_server_frame() {
        let live = live_with_node();
        let mut frames = live.subscribe();

        assert!(live.patch_node("n1", |entry| { entry.insert("label".into(), json!("Valve")); }).await);
        let (origin, frame) = frames.recv().await.expect("frame");
        assert_eq!(origin, SERVER_ORIGIN);
        assert!(!frame.is_empty());

        let label = live.read(|document| document.node("n1")).await.expect("entry")["label"].clone();
        assert_eq!(label, "Valve");
    }

    #[tokio::test]
    async fn patch_of_absent_node_is_a_no_op() {
        let live = live_with_node();
        let mut frames = live.subscribe();
        assert!(!live.patch_node("missing", |_| {}).await);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn hydrated_entries_seed_the_tracker() {
        let live = live_with_node();
        assert!(live.take_changes().await.is_empty());

        live.patch_node("n1", |entry| { entry.insert("label".into(), json!("Valve")); }).await;
        let changes = live.take_changes().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].node_name, "Valve");
    }
}
