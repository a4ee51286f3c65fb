//! Approval pipeline value type and its legal transitions.
//!
//! The functions here are pure: they validate and mutate an in-memory
//! [`ApprovalPipeline`] and report what happened. Loading, persisting and
//! publishing events is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalStatus {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStep {
    pub index: usize,
    pub name: String,
    pub assignee_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Submitted,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub actor_id: String,
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Step definition supplied when configuring a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub name: String,
    pub assignee_id: String,
}

impl StepConfig {
    pub fn new(name: impl Into<String>, assignee_id: impl Into<String>) -> Self {
        Self { name: name.into(), assignee_id: assignee_id.into() }
    }
}

/// Stored as a single JSON value on the node row and mirrored into live documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPipeline {
    pub status: ApprovalStatus,
    pub current_step_index: usize,
    pub steps: Vec<ApprovalStep>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("approval workflow is not configured for this node")]
    NotConfigured,
    #[error("at least one approval step is required")]
    NoSteps,
    #[error("node is already pending approval")]
    AlreadyPending,
    #[error("node is already approved")]
    AlreadyApproved,
    #[error("node is not pending approval")]
    NotPending,
    #[error("rejection reason is required")]
    EmptyReason,
    #[error("actor {actor_id} is not the assignee of step {step_index}")]
    NotAssignee { actor_id: String, step_index: usize },
    #[error("current step index {0} is outside the pipeline")]
    StepOutOfRange(usize),
}

/// The step that became `pending` as a result of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepActivation {
    pub step_index: usize,
    pub assignee_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApproveOutcome {
    /// The approved step was not the last one; the next step is now pending.
    Advanced { approved_step: usize, next: StepActivation },
    /// The last step was approved and the pipeline is resolved.
    Resolved { approved_step: usize },
}

impl ApprovalPipeline {
    /// Fresh pipeline: status `NONE`, every step `waiting`, empty history.
    pub fn configured(steps: Vec<StepConfig>) -> Result<Self, TransitionError> {
        if steps.is_empty() {
            return Err(TransitionError::NoSteps);
        }

        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| ApprovalStep {
                index,
                name: step.name,
                assignee_id: step.assignee_id,
                status: StepStatus::Waiting,
                completed_at: None,
                reason: None,
            })
            .collect();

        Ok(Self { status: ApprovalStatus::None, current_step_index: 0, steps, history: Vec::new() })
    }

    pub fn current_step(&self) -> Option<&ApprovalStep> {
        self.steps.get(self.current_step_index)
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    /// Actor of the most recent `submitted` history entry.
    pub fn submitter(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.action == HistoryAction::Submitted)
            .map(|entry| entry.actor_id.as_str())
    }

    /// A pipeline may only be replaced while nothing is in flight.
    pub fn ensure_reconfigurable(&self) -> Result<(), TransitionError> {
        if self.status == ApprovalStatus::Pending {
            return Err(TransitionError::AlreadyPending);
        }
        Ok(())
    }

    pub fn submit(
        &mut self,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StepActivation, TransitionError> {
        if self.steps.is_empty() {
            return Err(TransitionError::NotConfigured);
        }
        match self.status {
            ApprovalStatus::Pending => return Err(TransitionError::AlreadyPending),
            ApprovalStatus::Approved => return Err(TransitionError::AlreadyApproved),
            ApprovalStatus::None | ApprovalStatus::Rejected => {}
        }

        let step_index = self.current_step_index;
        let step = self
            .steps
            .get_mut(step_index)
            .ok_or(TransitionError::StepOutOfRange(step_index))?;
        step.status = StepStatus::Pending;
        step.completed_at = None;
        step.reason = None;
        let assignee_id = step.assignee_id.clone();

        self.status = ApprovalStatus::Pending;
        self.history.push(HistoryEntry {
            timestamp: now,
            action: HistoryAction::Submitted,
            actor_id: actor_id.to_owned(),
            step_index,
            reason: None,
        });

        Ok(StepActivation { step_index, assignee_id })
    }

    pub fn approve(
        &mut self,
        approver_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApproveOutcome, TransitionError> {
        let step_index = self.authorize_pending(approver_id)?;

        let step = &mut self.steps[step_index];
        step.status = StepStatus::Approved;
        step.completed_at = Some(now);
        self.history.push(HistoryEntry {
            timestamp: now,
            action: HistoryAction::Approved,
            actor_id: approver_id.to_owned(),
            step_index,
            reason: None,
        });

        let next_index = step_index + 1;
        match self.steps.get_mut(next_index) {
            Some(next) => {
                next.status = StepStatus::Pending;
                let assignee_id = next.assignee_id.clone();
                self.current_step_index = next_index;
                Ok(ApproveOutcome::Advanced {
                    approved_step: step_index,
                    next: StepActivation { step_index: next_index, assignee_id },
                })
            }
            None => {
                self.status = ApprovalStatus::Approved;
                Ok(ApproveOutcome::Resolved { approved_step: step_index })
            }
        }
    }

    /// Returns the index of the rejected step. `reason` is stored trimmed.
    pub fn reject(
        &mut self,
        approver_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, TransitionError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(TransitionError::EmptyReason);
        }
        let step_index = self.authorize_pending(approver_id)?;

        let step = &mut self.steps[step_index];
        step.status = StepStatus::Rejected;
        step.completed_at = Some(now);
        step.reason = Some(reason.to_owned());

        self.status = ApprovalStatus::Rejected;
        self.history.push(HistoryEntry {
            timestamp: now,
            action: HistoryAction::Rejected,
            actor_id: approver_id.to_owned(),
            step_index,
            reason: Some(reason.to_owned()),
        });

        Ok(step_index)
    }

    fn authorize_pending(&self, actor_id: &str) -> Result<usize, TransitionError> {
        if self.status != ApprovalStatus::Pending {
            return Err(TransitionError::NotPending);
        }
        let step_index = self.current_step_index;
        let step = self.steps.get(step_index).ok_or(TransitionError::StepOutOfRange(step_index))?;
        if step.assignee_id != actor_id {
            return Err(TransitionError::NotAssignee { actor_id: actor_id.to_owned(), step_index });
        }
        Ok(step_index)
    }
}
