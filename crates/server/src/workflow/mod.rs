//! Approval workflow and the side effects hanging off its events.
//!
//! [`ApprovalService`] runs the commands and publishes domain events. The
//! other handlers subscribe to those events on the [`crate::events::EventBus`]:
//! the live-sync bridge, the unlock propagator and the notifier. A failing
//! handler never undoes a committed transition.

pub mod approval;
pub mod live_sync;
pub mod notify;
pub mod unlock;

use cdm_common::approval::TransitionError;
use thiserror::Error;

use crate::store::StoreError;

pub use approval::ApprovalService;
pub use live_sync::LiveSyncBridge;
pub use notify::{Notification, NotificationHandler, NotificationKind, Notifier, TracingNotifier};
pub use unlock::UnlockPropagator;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    /// The pipeline changed between read and write. Re-fetch and retry.
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransitionError> for WorkflowError {
    fn from(error: TransitionError) -> Self {
        match error {
            TransitionError::NotAssignee { .. } => {
                Self::Forbidden("You are not authorized to approve this step".into())
            }
            other => Self::BadRequest(other.to_string()),
        }
    }
}
