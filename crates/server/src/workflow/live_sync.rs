// Mirrors committed workflow state into graph documents that are open.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map as JsonMap, Value};
use tracing::debug;

use cdm_common::events::DomainEvent;
use cdm_common::types::TaskStatus;

use crate::events::{EventHandler, HandlerFuture};
use crate::store::GraphStore;
use crate::sync::DocumentLookup;

/// Patches node entries of open documents after a relational write.
///
/// Every method is a no-op when nobody has the graph open or the node is not
/// part of the document. The relational row stays authoritative either way.
#[derive(Clone)]
pub struct LiveSyncBridge {
    lookup: Arc<dyn DocumentLookup>,
    store: GraphStore,
}

impl LiveSyncBridge {
    pub fn new(lookup: Arc<dyn DocumentLookup>, store: GraphStore) -> Self {
        Self { lookup, store }
    }

    /// Copies the stored approval of `node_id` onto its document entry.
    ///
    /// Returns whether an open document was patched.
    pub async fn sync_approval(&self, node_id: &str) -> anyhow::Result<bool> {
        let Some(node) = self.store.find_node(node_id).await? else {
            debug!(node_id, "approval sync skipped; node is gone");
            return Ok(false);
        };
        let Some(live) = self.lookup.lookup(&node.graph_id) else {
            return Ok(false);
        };

        let approval = match &node.approval {
            Some(pipeline) => serde_json::to_value(pipeline).context("serialize approval pipeline")?,
            None => Value::Null,
        };
        let patched = live
            .patch_node(node_id, |entry| {
                entry.insert("approval".into(), approval);
            })
            .await;
        debug!(node_id, graph_id = %node.graph_id, patched, "approval mirrored into live document");
        Ok(patched)
    }

    /// Writes a task status into `props.status` of the node entry.
    pub async fn apply_unlock(&self, graph_id: &str, node_id: &str, status: TaskStatus) -> bool {
        let Some(live) = self.lookup.lookup(graph_id) else {
            return false;
        };
        let patched = live
            .patch_node(node_id, |entry| {
                let props = entry
                    .entry("props")
                    .or_insert_with(|| Value::Object(JsonMap::new()));
                if !props.is_object() {
                    *props = Value::Object(JsonMap::new());
                }
                if let Value::Object(props) = props {
                    props.insert("status".into(), Value::String(status.as_str().to_owned()));
                }
            })
            .await;
        debug!(node_id, graph_id, patched, status = status.as_str(), "task status mirrored into live document");
        patched
    }
}

impl EventHandler for LiveSyncBridge {
    fn name(&self) -> &'static str {
        "live-sync"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            match event {
                DomainEvent::ApprovalRequested(_) | DomainEvent::ApprovalResolved(_) => {
                    self.sync_approval(event.node_id()).await?;
                }
                DomainEvent::NodeChanged(_) => {}
            }
            Ok(())
        })
    }
}
