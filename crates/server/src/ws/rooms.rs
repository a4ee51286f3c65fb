// Lifecycle of open graph documents: join, debounced flushing, teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cdm_common::events::DomainEvent;

use crate::events::EventBus;
use crate::store::GraphStore;
use crate::sync::{
    DocumentHydrator, DocumentPersister, DocumentSnapshot, FlushPolicy, GraphDocument,
    LiveDocument, PersistOutcome, SessionRegistry,
};

/// Shared state of the collaboration endpoint.
#[derive(Clone)]
pub struct CollabState {
    pub(super) inner: Arc<CollabInner>,
}

pub(super) struct CollabInner {
    hydrator: DocumentHydrator,
    persister: DocumentPersister,
    registry: SessionRegistry,
    events: EventBus,
    policy: FlushPolicy,
    grace_period: Duration,
    rooms: Mutex<HashMap<String, Room>>,
    next_client_id: AtomicU64,
}

struct Room {
    live: Arc<LiveDocument>,
    connections: usize,
    /// Bumped on every join so a stale grace timer can tell it lost the race.
    generation: u64,
    flush_tx: mpsc::Sender<()>,
}

/// One connection's handle on its room.
pub struct Session {
    pub live: Arc<LiveDocument>,
    flush_tx: mpsc::Sender<()>,
}

impl Session {
    /// Marks the document dirty. Repeated calls before the worker wakes coalesce.
    pub fn schedule_flush(&self) {
        let _ = self.flush_tx.try_send(());
    }
}

impl CollabState {
    pub fn new(
        store: GraphStore,
        events: EventBus,
        registry: SessionRegistry,
        policy: FlushPolicy,
        grace_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CollabInner {
                hydrator: DocumentHydrator::new(store.clone()),
                persister: DocumentPersister::new(store),
                registry,
                events,
                policy,
                grace_period,
                rooms: Mutex::new(HashMap::new()),
                // Zero is reserved for frames the server produces itself.
                next_client_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms().len()
    }

    pub fn connections(&self, graph_id: &str) -> usize {
        self.rooms().get(graph_id).map_or(0, |room| room.connections)
    }

    pub(super) fn next_client_id(&self) -> u64 {
        self.inner.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, HashMap<String, Room>> {
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a connection to the graph's room, hydrating it on first use.
    ///
    /// Hydration runs without the room lock held. If two connections race to
    /// open the same graph, the first one to finish wins and the other
    /// hydrated copy is dropped.
    pub async fn join(&self, graph_id: &str) -> Session {
        if let Some(session) = self.join_existing(graph_id) {
            return session;
        }

        let document = match self.inner.hydrator.hydrate(graph_id).await {
            Ok(document) => document,
            Err(error) => {
                warn!(graph_id, ?error, "hydration failed; serving an empty document");
                GraphDocument::new()
            }
        };

        let mut rooms = self.rooms();
        if let Some(room) = rooms.get_mut(graph_id) {
            room.connections += 1;
            room.generation += 1;
            return Session { live: room.live.clone(), flush_tx: room.flush_tx.clone() };
        }

        let live = LiveDocument::new(graph_id, document);
        self.inner.registry.register(&live);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        tokio::spawn(run_flush_worker(
            live.clone(),
            self.inner.persister.clone(),
            self.inner.policy,
            flush_rx,
        ));
        rooms.insert(
            graph_id.to_owned(),
            Room { live: live.clone(), connections: 1, generation: 0, flush_tx: flush_tx.clone() },
        );
        info!(graph_id, "graph document opened");
        Session { live, flush_tx }
    }

    fn join_existing(&self, graph_id: &str) -> Option<Session> {
        let mut rooms = self.rooms();
        let room = rooms.get_mut(graph_id)?;
        room.connections += 1;
        room.generation += 1;
        Some(Session { live: room.live.clone(), flush_tx: room.flush_tx.clone() })
    }

    /// Detaches a connection. The last one out starts the grace timer.
    pub fn leave(&self, graph_id: &str) {
        let generation = {
            let mut rooms = self.rooms();
            let Some(room) = rooms.get_mut(graph_id) else {
                return;
            };
            room.connections = room.connections.saturating_sub(1);
            if room.connections > 0 {
                return;
            }
            room.generation
        };

        let state = self.clone();
        let graph_id = graph_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(state.inner.grace_period).await;
            state.close_if_idle(&graph_id, generation).await;
        });
    }

    /// Publishes node changes merged since the last call.
    pub async fn publish_changes(&self, live: &LiveDocument) {
        for change in live.take_changes().await {
            self.inner.events.publish(DomainEvent::NodeChanged(change)).await;
        }
    }

    async fn close_if_idle(&self, graph_id: &str, generation: u64) {
        let live = {
            let rooms = self.rooms();
            match rooms.get(graph_id) {
                Some(room) if room.connections == 0 && room.generation == generation => {
                    room.live.clone()
                }
                _ => return,
            }
        };

        // Stop live-sync patches before the final snapshot.
        self.inner.registry.unregister(&live);
        flush(&live, &self.inner.persister).await;

        let mut rooms = self.rooms();
        let still_idle = rooms
            .get(graph_id)
            .is_some_and(|room| room.connections == 0 && room.generation == generation);
        if still_idle {
            rooms.remove(graph_id);
            info!(graph_id, "graph document closed");
        } else if let Some(room) = rooms.get(graph_id) {
            debug!(graph_id, "client rejoined during close; keeping document open");
            self.inner.registry.register(&room.live);
        }
    }
}

async fn flush(live: &LiveDocument, persister: &DocumentPersister) -> PersistOutcome {
    let snapshot = live.read(DocumentSnapshot::capture).await;
    persister.store_snapshot(live.graph_id(), snapshot).await
}

/// Flushes once per burst of merges, as scheduled by `policy`.
///
/// Exits when the room drops its sender. The closing path writes the final
/// snapshot itself.
async fn run_flush_worker(
    live: Arc<LiveDocument>,
    persister: DocumentPersister,
    policy: FlushPolicy,
    mut signals: mpsc::Receiver<()>,
) {
    while signals.recv().await.is_some() {
        let first_unflushed = Instant::now();
        let mut last_change = first_unflushed;
        loop {
            let deadline = policy.deadline(first_unflushed, last_change);
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(()) => last_change = Instant::now(),
                    None => return,
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }
        flush(&live, &persister).await;
    }
}

#[cfg(test)]
mod tests {
    use cdm_common::types::{Graph, Node};
    use serde_json::json;

    use super::*;
    use crate::sync::DocumentLookup;

    async fn state_with_graph(grace_period: Duration) -> (CollabState, GraphStore) {
        let store = GraphStore::in_memory();
        store.insert_graph(Graph::new("g1", "Plant")).await.expect("graph");
        store.insert_node(Node::new("n1", "g1", "Pump")).await.expect("node");
        let state = CollabState::new(
            store.clone(),
            EventBus::new(),
            SessionRegistry::new(),
            FlushPolicy::new(Duration::from_millis(100), Duration::from_millis(500)),
            grace_period,
        );
        (state, store)
    }

    async fn stored_state(store: &GraphStore) -> Option<Vec<u8>> {
        store
            .find_graph_with_relations("g1")
            .await
            .expect("load")
            .and_then(|relations| relations.graph.yjs_state)
    }

    #[tokio::test]
    async fn second_join_shares_the_document() {
        let (state, _) = state_with_graph(Duration::from_secs(30)).await;
        let first = state.join("g1").await;
        let second = state.join("g1").await;

        assert!(Arc::ptr_eq(&first.live, &second.live));
        assert_eq!(state.connections("g1"), 2);
        assert!(state.registry().lookup("g1").is_some());
        assert!(first.live.read(|document| document.node("n1")).await.is_some());
    }

    #[tokio::test]
    async fn unknown_graph_degrades_to_empty_document() {
        let (state, _) = state_with_graph(Duration::from_secs(30)).await;
        let session = state.join("ghost").await;
        assert!(session.live.read(GraphDocument::nodes).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_flush_writes_snapshot() {
        let (state, store) = state_with_graph(Duration::from_secs(30)).await;
        let session = state.join("g1").await;
        session.live.patch_node("n1", |entry| {
            entry.insert("label".into(), json!("Valve"));
        })
        .await;
        session.schedule_flush();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stored_state(&store).await.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(stored_state(&store).await.is_some());
        let node = store.find_node("n1").await.expect("load").expect("node");
        assert_eq!(node.label, "Valve");
    }

    #[tokio::test(start_paused = true)]
    async fn last_leave_closes_after_grace_period() {
        let (state, store) = state_with_graph(Duration::from_secs(1)).await;
        state.join("g1").await;
        state.leave("g1");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state.open_rooms(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state.open_rooms(), 0);
        assert!(state.registry().lookup("g1").is_none());
        assert!(stored_state(&store).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_grace_keeps_document_open() {
        let (state, _) = state_with_graph(Duration::from_secs(1)).await;
        let first = state.join("g1").await;
        state.leave("g1");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let again = state.join("g1").await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(state.open_rooms(), 1);
        assert!(Arc::ptr_eq(&first.live, &again.live));
        assert!(state.registry().lookup("g1").is_some());
    }
}
