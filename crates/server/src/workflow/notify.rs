// Approval notifications. Delivery is pluggable; the default only logs.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use cdm_common::events::{ApprovalRequested, ApprovalResolved, DomainEvent, Resolution};

use crate::events::{EventHandler, HandlerFuture};
use crate::store::GraphStore;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    ApprovalRequested,
    ApprovalResolved,
}

impl NotificationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApprovalRequested => "APPROVAL_REQUESTED",
            Self::ApprovalResolved => "APPROVAL_RESOLVED",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub node_id: String,
    pub node_name: String,
    pub sender_id: String,
    pub step_index: usize,
}

pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: &'a Notification) -> HandlerFuture<'a>;
}

/// Writes each notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(
                recipient_id = %notification.recipient_id,
                kind = notification.kind.as_str(),
                node_id = %notification.node_id,
                sender_id = %notification.sender_id,
                step_index = notification.step_index,
                title = %notification.title,
                "notification"
            );
            Ok(())
        })
    }
}

/// Turns approval events into notifications: the step assignee hears about
/// requests and the original submitter hears about resolutions.
#[derive(Clone)]
pub struct NotificationHandler {
    store: GraphStore,
    notifier: Arc<dyn Notifier>,
}

impl NotificationHandler {
    pub fn new(store: GraphStore, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    async fn requested(&self, event: &ApprovalRequested) -> anyhow::Result<()> {
        let Some(node) = self.store.find_node(&event.node_id).await? else {
            debug!(node_id = %event.node_id, "node gone before notification");
            return Ok(());
        };

        let notification = Notification {
            recipient_id: event.approver_id.clone(),
            kind: NotificationKind::ApprovalRequested,
            title: format!("Approval requested: {}", node.label),
            node_id: node.id,
            node_name: node.label,
            sender_id: event.requester_id.clone(),
            step_index: event.step_index,
        };
        self.notifier.notify(&notification).await
    }

    async fn resolved(&self, event: &ApprovalResolved) -> anyhow::Result<()> {
        let Some(node) = self.store.find_node(&event.node_id).await? else {
            debug!(node_id = %event.node_id, "node gone before notification");
            return Ok(());
        };
        let Some(submitter) = node.approval.as_ref().and_then(|pipeline| pipeline.submitter()) else {
            debug!(node_id = %event.node_id, "resolved approval has no submitter to notify");
            return Ok(());
        };

        let verdict = match event.status {
            Resolution::Approved => "approved",
            Resolution::Rejected => "rejected",
        };
        let notification = Notification {
            recipient_id: submitter.to_owned(),
            kind: NotificationKind::ApprovalResolved,
            title: format!("Approval {verdict}: {}", node.label),
            node_id: node.id.clone(),
            node_name: node.label.clone(),
            sender_id: event.approver_id.clone(),
            step_index: event.step_index,
        };
        self.notifier.notify(&notification).await
    }
}

impl EventHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            match event {
                DomainEvent::ApprovalRequested(requested) => self.requested(requested).await,
                DomainEvent::ApprovalResolved(resolved) => self.resolved(resolved).await,
                DomainEvent::NodeChanged(_) => Ok(()),
            }
        })
    }
}
