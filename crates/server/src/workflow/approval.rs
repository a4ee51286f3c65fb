// Approval commands: load the node, apply a pipeline transition, write it
// back with a version guard, then publish the resulting event.

use chrono::Utc;
use tracing::{info, warn};

use cdm_common::approval::{ApprovalPipeline, ApproveOutcome, StepConfig, TransitionError};
use cdm_common::events::{ApprovalRequested, ApprovalResolved, DomainEvent, Resolution};
use cdm_common::types::{Deliverable, Node};

use super::WorkflowError;
use crate::events::EventBus;
use crate::store::GraphStore;

#[derive(Clone)]
pub struct ApprovalService {
    store: GraphStore,
    events: EventBus,
}

impl ApprovalService {
    pub fn new(store: GraphStore, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn get_status(&self, node_id: &str) -> Result<Option<ApprovalPipeline>, WorkflowError> {
        Ok(self.load(node_id).await?.approval)
    }

    /// Replaces the pipeline of a TASK node with a fresh one.
    pub async fn configure(
        &self,
        node_id: &str,
        steps: Vec<StepConfig>,
    ) -> Result<ApprovalPipeline, WorkflowError> {
        let node = self.load(node_id).await?;
        if !node.is_task() {
            return Err(WorkflowError::BadRequest(
                "Approval can only be configured for TASK nodes".into(),
            ));
        }
        validate_steps(&steps)?;
        if let Some(current) = &node.approval {
            current.ensure_reconfigurable()?;
        }

        let pipeline = ApprovalPipeline::configured(steps)?;
        self.commit(&node, &pipeline).await?;
        info!(node_id, steps = pipeline.steps.len(), "approval workflow configured");
        Ok(pipeline)
    }

    pub async fn submit(
        &self,
        node_id: &str,
        actor_id: &str,
    ) -> Result<ApprovalPipeline, WorkflowError> {
        let node = self.load_task(node_id).await?;
        let mut pipeline = node.approval.clone().ok_or(TransitionError::NotConfigured)?;
        if node.deliverables().is_empty() {
            return Err(WorkflowError::BadRequest(
                "Cannot submit for approval without deliverables".into(),
            ));
        }

        let activation = pipeline.submit(actor_id, Utc::now())?;
        self.commit(&node, &pipeline).await?;
        info!(
            node_id,
            actor_id,
            step_index = activation.step_index,
            approver_id = %activation.assignee_id,
            "submitted for approval"
        );

        self.events
            .publish(DomainEvent::ApprovalRequested(ApprovalRequested {
                node_id: node_id.to_owned(),
                step_index: activation.step_index,
                approver_id: activation.assignee_id,
                requester_id: actor_id.to_owned(),
            }))
            .await;
        Ok(pipeline)
    }

    /// Approves the current step. The approver of an intermediate step
    /// becomes the requester of the next one.
    pub async fn approve(
        &self,
        node_id: &str,
        approver_id: &str,
    ) -> Result<(ApprovalPipeline, ApproveOutcome), WorkflowError> {
        let node = self.load(node_id).await?;
        let mut pipeline = node.approval.clone().unwrap_or_default();

        let outcome = pipeline.approve(approver_id, Utc::now())?;
        self.commit(&node, &pipeline).await?;

        let event = match &outcome {
            ApproveOutcome::Advanced { approved_step, next } => {
                info!(
                    node_id,
                    actor_id = approver_id,
                    step_index = approved_step,
                    next_step = next.step_index,
                    "approval step approved"
                );
                DomainEvent::ApprovalRequested(ApprovalRequested {
                    node_id: node_id.to_owned(),
                    step_index: next.step_index,
                    approver_id: next.assignee_id.clone(),
                    requester_id: approver_id.to_owned(),
                })
            }
            ApproveOutcome::Resolved { approved_step } => {
                info!(node_id, actor_id = approver_id, step_index = approved_step, "fully approved");
                DomainEvent::ApprovalResolved(ApprovalResolved {
                    node_id: node_id.to_owned(),
                    status: Resolution::Approved,
                    approver_id: approver_id.to_owned(),
                    step_index: *approved_step,
                    reason: None,
                })
            }
        };
        self.events.publish(event).await;
        Ok((pipeline, outcome))
    }

    pub async fn reject(
        &self,
        node_id: &str,
        approver_id: &str,
        reason: &str,
    ) -> Result<ApprovalPipeline, WorkflowError> {
        if reason.trim().is_empty() {
            return Err(TransitionError::EmptyReason.into());
        }
        let node = self.load(node_id).await?;
        let mut pipeline = node.approval.clone().unwrap_or_default();

        let step_index = pipeline.reject(approver_id, reason, Utc::now())?;
        self.commit(&node, &pipeline).await?;
        info!(node_id, actor_id = approver_id, step_index, "approval rejected");

        self.events
            .publish(DomainEvent::ApprovalResolved(ApprovalResolved {
                node_id: node_id.to_owned(),
                status: Resolution::Rejected,
                approver_id: approver_id.to_owned(),
                step_index,
                reason: Some(reason.trim().to_owned()),
            }))
            .await;
        Ok(pipeline)
    }

    pub async fn add_deliverable(
        &self,
        node_id: &str,
        deliverable: Deliverable,
    ) -> Result<Vec<Deliverable>, WorkflowError> {
        if deliverable.id.trim().is_empty() || deliverable.file_id.trim().is_empty() {
            return Err(WorkflowError::BadRequest("deliverable id and fileId are required".into()));
        }
        let node = self.load_task(node_id).await?;
        let mut deliverables = node.deliverables().to_vec();
        if deliverables.iter().any(|existing| existing.id == deliverable.id) {
            return Err(WorkflowError::BadRequest(format!(
                "deliverable {} is already attached",
                deliverable.id
            )));
        }

        deliverables.push(deliverable);
        self.store.update_deliverables(node_id, &deliverables).await?;
        info!(node_id, deliverables = deliverables.len(), "deliverable added");
        Ok(deliverables)
    }

    pub async fn remove_deliverable(
        &self,
        node_id: &str,
        deliverable_id: &str,
    ) -> Result<Vec<Deliverable>, WorkflowError> {
        let node = self.load_task(node_id).await?;
        let mut deliverables = node.deliverables().to_vec();
        let before = deliverables.len();
        deliverables.retain(|deliverable| deliverable.id != deliverable_id);
        if deliverables.len() == before {
            return Err(WorkflowError::NotFound(format!("deliverable {deliverable_id} not found")));
        }

        self.store.update_deliverables(node_id, &deliverables).await?;
        info!(node_id, deliverable_id, "deliverable removed");
        Ok(deliverables)
    }

    async fn load(&self, node_id: &str) -> Result<Node, WorkflowError> {
        self.store
            .find_node(node_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("node {node_id} not found")))
    }

    async fn load_task(&self, node_id: &str) -> Result<Node, WorkflowError> {
        let node = self.load(node_id).await?;
        if !node.is_task() {
            return Err(WorkflowError::BadRequest(format!(
                "node {node_id} is a {} node, not a TASK",
                node.node_type
            )));
        }
        Ok(node)
    }

    /// Writes `pipeline` only if nobody changed the node's approval since `node` was read.
    async fn commit(&self, node: &Node, pipeline: &ApprovalPipeline) -> Result<(), WorkflowError> {
        if self.store.update_approval(&node.id, node.approval_version, pipeline).await? {
            return Ok(());
        }
        warn!(
            node_id = %node.id,
            expected_version = node.approval_version,
            "approval write lost a concurrent update"
        );
        Err(WorkflowError::Conflict(format!(
            "approval of node {} was modified concurrently; re-fetch and retry",
            node.id
        )))
    }
}

fn validate_steps(steps: &[StepConfig]) -> Result<(), WorkflowError> {
    if steps.is_empty() {
        return Err(TransitionError::NoSteps.into());
    }
    for (index, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() || step.assignee_id.trim().is_empty() {
            return Err(WorkflowError::BadRequest(format!(
                "step {index} needs a name and an assigneeId"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use cdm_common::approval::{ApprovalStatus, StepStatus};
    use cdm_common::events::Topic;
    use cdm_common::types::{Graph, TaskProps};

    use super::*;
    use crate::events::{EventHandler, HandlerFuture};

    #[derive(Default)]
    struct Captured(Mutex<Vec<DomainEvent>>);

    impl EventHandler for Captured {
        fn name(&self) -> &'static str {
            "captured"
        }

        fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.0.lock().expect("lock").push(event.clone());
                Ok(())
            })
        }
    }

    fn deliverable(id: &str) -> Deliverable {
        Deliverable {
            id: id.into(),
            file_id: format!("file-{id}"),
            file_name: format!("{id}.pdf"),
            uploaded_at: Utc::now(),
        }
    }

    async fn service() -> (ApprovalService, GraphStore, Arc<Captured>) {
        let store = GraphStore::in_memory();
        store.insert_graph(Graph::new("g1", "Plant")).await.expect("graph");
        store
            .insert_node(Node::new("t1", "g1", "Pump sizing").as_task(TaskProps::default()))
            .await
            .expect("task");
        store.insert_node(Node::new("n1", "g1", "Note")).await.expect("node");

        let events = EventBus::new();
        let captured = Arc::new(Captured::default());
        events.subscribe(Topic::ApprovalRequested, captured.clone());
        events.subscribe(Topic::ApprovalResolved, captured.clone());
        (ApprovalService::new(store.clone(), events), store, captured)
    }

    fn steps() -> Vec<StepConfig> {
        vec![StepConfig::new("Review", "u1"), StepConfig::new("Sign-off", "u2")]
    }

    #[tokio::test]
    async fn configure_requires_task_node() {
        let (service, _, _) = service().await;
        let error = service.configure("n1", steps()).await.expect_err("ordinary node");
        assert!(matches!(error, WorkflowError::BadRequest(message) if message.contains("TASK")));
    }

    #[tokio::test]
    async fn configure_rejects_blank_steps() {
        let (service, _, _) = service().await;
        assert!(matches!(
            service.configure("t1", Vec::new()).await,
            Err(WorkflowError::BadRequest(_))
        ));
        assert!(matches!(
            service.configure("t1", vec![StepConfig::new("Review", " ")]).await,
            Err(WorkflowError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let (service, _, _) = service().await;
        assert!(matches!(service.get_status("ghost").await, Err(WorkflowError::NotFound(_))));
        assert!(matches!(
            service.submit("ghost", "u3").await,
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn submit_requires_a_deliverable() {
        let (service, _, captured) = service().await;
        service.configure("t1", steps()).await.expect("configure");

        let error = service.submit("t1", "u3").await.expect_err("no deliverables");
        assert!(matches!(error, WorkflowError::BadRequest(message) if message.contains("deliverables")));
        assert!(captured.0.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn submit_without_pipeline_is_rejected() {
        let (service, _, _) = service().await;
        service.add_deliverable("t1", deliverable("d1")).await.expect("deliverable");
        assert!(matches!(service.submit("t1", "u3").await, Err(WorkflowError::BadRequest(_))));
    }

    #[tokio::test]
    async fn reconfigure_while_pending_is_rejected() {
        let (service, _, _) = service().await;
        service.configure("t1", steps()).await.expect("configure");
        service.add_deliverable("t1", deliverable("d1")).await.expect("deliverable");
        service.submit("t1", "u3").await.expect("submit");

        assert!(matches!(service.configure("t1", steps()).await, Err(WorkflowError::BadRequest(_))));
    }

    #[tokio::test]
    async fn wrong_approver_is_forbidden_and_nothing_is_written() {
        let (service, store, _) = service().await;
        service.configure("t1", steps()).await.expect("configure");
        service.add_deliverable("t1", deliverable("d1")).await.expect("deliverable");
        service.submit("t1", "u3").await.expect("submit");
        let version = store.find_node("t1").await.expect("load").expect("node").approval_version;

        let error = service.approve("t1", "u2").await.expect_err("u2 is not the current assignee");
        assert!(matches!(error, WorkflowError::Forbidden(_)));
        let node = store.find_node("t1").await.expect("load").expect("node");
        assert_eq!(node.approval_version, version);
        assert_eq!(node.approval.expect("pipeline").steps[0].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn advancing_approval_names_the_approver_as_requester() {
        let (service, _, captured) = service().await;
        service.configure("t1", steps()).await.expect("configure");
        service.add_deliverable("t1", deliverable("d1")).await.expect("deliverable");
        service.submit("t1", "u3").await.expect("submit");

        let (pipeline, outcome) = service.approve("t1", "u1").await.expect("approve");
        assert!(matches!(outcome, ApproveOutcome::Advanced { approved_step: 0, .. }));
        assert_eq!(pipeline.current_step_index, 1);

        let events = captured.0.lock().expect("lock");
        let DomainEvent::ApprovalRequested(requested) = &events[1] else {
            panic!("expected approval request, got {:?}", events[1]);
        };
        assert_eq!(requested.approver_id, "u2");
        assert_eq!(requested.requester_id, "u1");
        assert_eq!(requested.step_index, 1);
    }

    #[tokio::test]
    async fn reject_requires_a_reason() {
        let (service, _, _) = service().await;
        assert!(matches!(
            service.reject("t1", "u1", "   ").await,
            Err(WorkflowError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn rejected_pipeline_can_be_resubmitted() {
        let (service, _, captured) = service().await;
        service.configure("t1", steps()).await.expect("configure");
        service.add_deliverable("t1", deliverable("d1")).await.expect("deliverable");
        service.submit("t1", "u3").await.expect("submit");
        service.reject("t1", "u1", " missing spec ").await.expect("reject");

        let pipeline = service.submit("t1", "u3").await.expect("resubmit");
        assert_eq!(pipeline.status, ApprovalStatus::Pending);
        assert_eq!(pipeline.steps[0].status, StepStatus::Pending);
        assert_eq!(pipeline.steps[0].reason, None);

        let events = captured.0.lock().expect("lock");
        let DomainEvent::ApprovalResolved(resolved) = &events[1] else {
            panic!("expected resolution, got {:?}", events[1]);
        };
        assert_eq!(resolved.status, Resolution::Rejected);
        assert_eq!(resolved.reason.as_deref(), Some("missing spec"));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let (service, store, _) = service().await;
        service.configure("t1", steps()).await.expect("configure");
        let stale = store.find_node("t1").await.expect("load").expect("node");

        service.configure("t1", steps()).await.expect("concurrent writer");
        let pipeline = ApprovalPipeline::configured(steps()).expect("pipeline");
        let error = service.commit(&stale, &pipeline).await.expect_err("stale write");
        assert!(matches!(error, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn deliverables_are_added_and_removed() {
        let (service, _, _) = service().await;
        service.add_deliverable("t1", deliverable("d1")).await.expect("d1");
        let listed = service.add_deliverable("t1", deliverable("d2")).await.expect("d2");
        assert_eq!(listed.len(), 2);

        assert!(matches!(
            service.add_deliverable("t1", deliverable("d1")).await,
            Err(WorkflowError::BadRequest(_))
        ));
        assert!(matches!(
            service.add_deliverable("n1", deliverable("d9")).await,
            Err(WorkflowError::BadRequest(_))
        ));

        let remaining = service.remove_deliverable("t1", "d1").await.expect("remove");
        assert_eq!(remaining.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["d2"]);
        assert!(matches!(
            service.remove_deliverable("t1", "d1").await,
            Err(WorkflowError::NotFound(_))
        ));
    }
}
