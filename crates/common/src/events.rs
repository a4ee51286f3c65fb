// Domain event payloads published on the in-process event bus.

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalStatus;
use crate::types::TaskStatus;

/// Named topic a handler subscribes to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Topic {
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.resolved")]
    ApprovalResolved,
    #[serde(rename = "collab.node.changed")]
    NodeChanged,
}

impl Topic {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalResolved => "approval.resolved",
            Self::NodeChanged => "collab.node.changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequested {
    pub node_id: String,
    pub step_index: usize,
    pub approver_id: String,
    pub requester_id: String,
}

/// Final outcome of an approval cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Resolution {
    Approved,
    Rejected,
}

impl From<Resolution> for ApprovalStatus {
    fn from(value: Resolution) -> Self {
        match value {
            Resolution::Approved => ApprovalStatus::Approved,
            Resolution::Rejected => ApprovalStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolved {
    pub node_id: String,
    pub status: Resolution,
    pub approver_id: String,
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A successor task whose prerequisites are now all approved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskUnlocked {
    pub node_id: String,
    pub graph_id: String,
    pub unlocked_by: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeChanged {
    pub graph_id: String,
    pub node_id: String,
    pub node_name: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    ApprovalRequested(ApprovalRequested),
    ApprovalResolved(ApprovalResolved),
    NodeChanged(NodeChanged),
}

impl DomainEvent {
    pub const fn topic(&self) -> Topic {
        match self {
            Self::ApprovalRequested(_) => Topic::ApprovalRequested,
            Self::ApprovalResolved(_) => Topic::ApprovalResolved,
            Self::NodeChanged(_) => Topic::NodeChanged,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::ApprovalRequested(event) => &event.node_id,
            Self::ApprovalResolved(event) => &event.node_id,
            Self::NodeChanged(event) => &event.node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_match_wire_names() {
        assert_eq!(Topic::ApprovalResolved.as_str(), "approval.resolved");
        assert_eq!(
            serde_json::to_value(Topic::NodeChanged).expect("serialize"),
            "collab.node.changed"
        );
    }

    #[test]
    fn resolved_event_omits_missing_reason() {
        let event = ApprovalResolved {
            node_id: "n1".into(),
            status: Resolution::Approved,
            approver_id: "u2".into(),
            step_index: 1,
            reason: None,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["status"], "APPROVED");
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn domain_event_reports_topic_and_node() {
        let event = DomainEvent::NodeChanged(NodeChanged {
            graph_id: "g".into(),
            node_id: "t".into(),
            node_name: "Pump".into(),
            change_type: ChangeType::Delete,
        });
        assert_eq!(event.topic(), Topic::NodeChanged);
        assert_eq!(event.node_id(), "t");
    }

    #[test]
    fn unlocked_task_serializes_status_in_kebab_case() {
        let unlocked = TaskUnlocked {
            node_id: "t".into(),
            graph_id: "g".into(),
            unlocked_by: "a".into(),
            status: TaskStatus::Todo,
        };
        let value = serde_json::to_value(&unlocked).expect("serialize");
        assert_eq!(value["status"], "todo");
        assert_eq!(value["unlockedBy"], "a");
    }
}
