// Unlocks successor tasks once all of their prerequisites are approved.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use cdm_common::approval::ApprovalPipeline;
use cdm_common::events::{DomainEvent, Resolution, TaskUnlocked};
use cdm_common::types::{EdgeKind, TaskStatus};

use super::live_sync::LiveSyncBridge;
use crate::events::{EventHandler, HandlerFuture};
use crate::store::{GraphStore, StoreError};

/// Looks one dependency hop past an approved node.
///
/// Chains advance one link per approval: in `A -> B -> C`, approving `A` can
/// unlock `B`, and `C` waits until `B` is approved in its own right.
#[derive(Clone)]
pub struct UnlockPropagator {
    store: GraphStore,
    live_sync: LiveSyncBridge,
}

impl UnlockPropagator {
    pub fn new(store: GraphStore, live_sync: LiveSyncBridge) -> Self {
        Self { store, live_sync }
    }

    /// Tries every direct successor of `approved_node_id`. A failure on one
    /// successor is logged and the rest are still attempted.
    pub async fn propagate(
        &self,
        approved_node_id: &str,
        approver_id: &str,
    ) -> Result<Vec<TaskUnlocked>, StoreError> {
        let successors: BTreeSet<String> = self
            .store
            .find_edges_by_source(approved_node_id, EdgeKind::Dependency)
            .await?
            .into_iter()
            .map(|edge| edge.target_id)
            .collect();

        let mut unlocked = Vec::new();
        for successor_id in successors {
            match self.try_unlock(&successor_id, approver_id).await {
                Ok(Some(task)) => {
                    info!(
                        node_id = %task.node_id,
                        graph_id = %task.graph_id,
                        unlocked_by = approver_id,
                        "task unlocked"
                    );
                    unlocked.push(task);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        predecessor_id = approved_node_id,
                        successor_id = %successor_id,
                        ?error,
                        "failed to unlock successor task"
                    );
                }
            }
        }
        Ok(unlocked)
    }

    async fn try_unlock(
        &self,
        successor_id: &str,
        approver_id: &str,
    ) -> Result<Option<TaskUnlocked>, StoreError> {
        let Some(successor) = self.store.find_node(successor_id).await? else {
            return Ok(None);
        };
        if !successor.is_task() {
            return Ok(None);
        }
        let status = successor.task_props.as_ref().and_then(|props| props.status);
        if status == Some(TaskStatus::Todo) {
            return Ok(None);
        }

        let predecessor_ids: Vec<String> = self
            .store
            .find_edges_by_target(successor_id, EdgeKind::Dependency)
            .await?
            .into_iter()
            .map(|edge| edge.source_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let approvals = self.store.find_nodes_by_ids(&predecessor_ids).await?;

        // Predecessors without a node row count as not approved.
        let blocking = predecessor_ids.iter().find(|predecessor_id| {
            !approvals.iter().any(|found| {
                &found.id == *predecessor_id
                    && found.approval.as_ref().is_some_and(ApprovalPipeline::is_approved)
            })
        });
        if let Some(blocking) = blocking {
            debug!(successor_id, blocking_predecessor = %blocking, "task stays locked");
            return Ok(None);
        }

        self.store.update_task_status(successor_id, TaskStatus::Todo).await?;
        self.live_sync.apply_unlock(&successor.graph_id, successor_id, TaskStatus::Todo).await;

        Ok(Some(TaskUnlocked {
            node_id: successor.id,
            graph_id: successor.graph_id,
            unlocked_by: approver_id.to_owned(),
            status: TaskStatus::Todo,
        }))
    }
}

impl EventHandler for UnlockPropagator {
    fn name(&self) -> &'static str {
        "dependency-unlock"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let DomainEvent::ApprovalResolved(resolved) = event {
                if resolved.status == Resolution::Approved {
                    self.propagate(&resolved.node_id, &resolved.approver_id).await?;
                }
            }
            Ok(())
        })
    }
}
