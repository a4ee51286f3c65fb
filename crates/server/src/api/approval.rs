// Approval endpoints.
//
// Routes:
//   GET    /v1/approval/{node_id}                              current pipeline
//   POST   /v1/approval/{node_id}/configure                    replace steps
//   POST   /v1/approval/{node_id}/submit                       submit for approval
//   POST   /v1/approval/{node_id}/approve                      approve current step
//   POST   /v1/approval/{node_id}/reject                       reject with reason
//   POST   /v1/approval/{node_id}/deliverables                 attach a deliverable
//   DELETE /v1/approval/{node_id}/deliverables/{deliverable_id} detach a deliverable

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cdm_common::approval::{ApprovalPipeline, ApproveOutcome, StepConfig};
use cdm_common::types::Deliverable;

use super::Actor;
use crate::workflow::{ApprovalService, WorkflowError};

// ── Request / Response types ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDeliverableRequest {
    pub id: Option<String>,
    pub file_id: String,
    pub file_name: String,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl AddDeliverableRequest {
    fn into_deliverable(self) -> Deliverable {
        Deliverable {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            file_id: self.file_id,
            file_name: self.file_name,
            uploaded_at: self.uploaded_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusEnvelope {
    approval: Option<ApprovalPipeline>,
}

#[derive(Debug, Serialize)]
struct TransitionEnvelope {
    success: bool,
    approval: ApprovalPipeline,
    message: &'static str,
}

impl TransitionEnvelope {
    fn new(approval: ApprovalPipeline, message: &'static str) -> Json<Self> {
        Json(Self { success: true, approval, message })
    }
}

#[derive(Debug, Serialize)]
struct DeliverablesEnvelope {
    deliverables: Vec<Deliverable>,
}

// ── Router ─────────────────────────────────────────────────────────

pub fn router(service: ApprovalService) -> Router {
    Router::new()
        .route("/v1/approval/{node_id}", get(get_status))
        .route("/v1/approval/{node_id}/configure", post(configure))
        .route("/v1/approval/{node_id}/submit", post(submit))
        .route("/v1/approval/{node_id}/approve", post(approve))
        .route("/v1/approval/{node_id}/reject", post(reject))
        .route("/v1/approval/{node_id}/deliverables", post(add_deliverable))
        .route(
            "/v1/approval/{node_id}/deliverables/{deliverable_id}",
            delete(remove_deliverable),
        )
        .with_state(service)
}

// ── Handlers ───────────────────────────────────────────────────────

async fn get_status(
    State(service): State<ApprovalService>,
    Path(node_id): Path<String>,
) -> Result<Json<StatusEnvelope>, WorkflowError> {
    let approval = service.get_status(&node_id).await?;
    Ok(Json(StatusEnvelope { approval }))
}

async fn configure(
    State(service): State<ApprovalService>,
    Actor(_actor): Actor,
    Path(node_id): Path<String>,
    Json(payload): Json<ConfigureRequest>,
) -> Result<Json<TransitionEnvelope>, WorkflowError> {
    let approval = service.configure(&node_id, payload.steps).await?;
    Ok(TransitionEnvelope::new(approval, "Approval workflow configured"))
}

async fn submit(
    State(service): State<ApprovalService>,
    Actor(actor): Actor,
    Path(node_id): Path<String>,
) -> Result<Json<TransitionEnvelope>, WorkflowError> {
    let approval = service.submit(&node_id, &actor).await?;
    Ok(TransitionEnvelope::new(approval, "Submitted for approval"))
}

async fn approve(
    State(service): State<ApprovalService>,
    Actor(actor): Actor,
    Path(node_id): Path<String>,
) -> Result<Json<TransitionEnvelope>, WorkflowError> {
    let (approval, outcome) = service.approve(&node_id, &actor).await?;
    let message = match outcome {
        ApproveOutcome::Advanced { .. } => "Step approved",
        ApproveOutcome::Resolved { .. } => "Fully approved",
    };
    Ok(TransitionEnvelope::new(approval, message))
}

async fn reject(
    State(service): State<ApprovalService>,
    Actor(actor): Actor,
    Path(node_id): Path<String>,
    Json(payload): Json<RejectRequest>,
) -> Result<Json<TransitionEnvelope>, WorkflowError> {
    let approval = service.reject(&node_id, &actor, &payload.reason).await?;
    Ok(TransitionEnvelope::new(approval, "Rejected"))
}

async fn add_deliverable(
    State(service): State<ApprovalService>,
    Actor(_actor): Actor,
    Path(node_id): Path<String>,
    Json(payload): Json<AddDeliverableRequest>,
) -> Result<(StatusCode, Json<DeliverablesEnvelope>), WorkflowError> {
    let deliverables = service.add_deliverable(&node_id, payload.into_deliverable()).await?;
    Ok((StatusCode::CREATED, Json(DeliverablesEnvelope { deliverables })))
}

async fn remove_deliverable(
    State(service): State<ApprovalService>,
    Actor(_actor): Actor,
    Path((node_id, deliverable_id)): Path<(String, String)>,
) -> Result<Json<DeliverablesEnvelope>, WorkflowError> {
    let deliverables = service.remove_deliverable(&node_id, &deliverable_id).await?;
    Ok(Json(DeliverablesEnvelope { deliverables }))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use cdm_common::types::{Graph, Node, TaskProps};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::events::EventBus;
    use crate::store::GraphStore;

    async fn test_router() -> Router {
        let store = GraphStore::in_memory();
        store.insert_graph(Graph::new("g1", "Plant")).await.expect("graph");
        store
            .insert_node(Node::new("t1", "g1", "Pump sizing").as_task(TaskProps::default()))
            .await
            .expect("task");
        store.insert_node(Node::new("n1", "g1", "Note")).await.expect("node");
        router(ApprovalService::new(store, EventBus::new()))
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).expect("body")))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    fn two_steps() -> Value {
        json!({ "steps": [
            { "name": "Review", "assigneeId": "u1" },
            { "name": "Sign-off", "assigneeId": "u2" }
        ] })
    }

    #[tokio::test]
    async fn status_of_unconfigured_task_is_null() {
        let app = test_router().await;
        let (status, body) = send(&app, request("GET", "/v1/approval/t1", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approval"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_node_is_404_with_error_envelope() {
        let app = test_router().await;
        let (status, body) = send(&app, request("GET", "/v1/approval/ghost", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn commands_require_user_header() {
        let app = test_router().await;
        let (status, body) =
            send(&app, request("POST", "/v1/approval/t1/submit", None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn configure_on_ordinary_node_is_400() {
        let app = test_router().await;
        let (status, body) = send(
            &app,
            request("POST", "/v1/approval/n1/configure", Some("u9"), Some(two_steps())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "Approval can only be configured for TASK nodes");
    }

    #[tokio::test]
    async fn full_two_step_approval_over_http() {
        let app = test_router().await;

        let (status, body) = send(
            &app,
            request("POST", "/v1/approval/t1/configure", Some("u9"), Some(two_steps())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Approval workflow configured");
        assert_eq!(body["approval"]["status"], "NONE");

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/v1/approval/t1/deliverables",
                Some("u3"),
                Some(json!({ "id": "d1", "fileId": "f1", "fileName": "calc.pdf" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["deliverables"][0]["fileName"], "calc.pdf");

        let (_, body) = send(&app, request("POST", "/v1/approval/t1/submit", Some("u3"), None)).await;
        assert_eq!(body["approval"]["status"], "PENDING");
        assert_eq!(body["message"], "Submitted for approval");

        let (status, body) =
            send(&app, request("POST", "/v1/approval/t1/approve", Some("u2"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let (_, body) = send(&app, request("POST", "/v1/approval/t1/approve", Some("u1"), None)).await;
        assert_eq!(body["message"], "Step approved");
        assert_eq!(body["approval"]["currentStepIndex"], 1);

        let (_, body) = send(&app, request("POST", "/v1/approval/t1/approve", Some("u2"), None)).await;
        assert_eq!(body["message"], "Fully approved");
        assert_eq!(body["approval"]["status"], "APPROVED");
    }

    #[tokio::test]
    async fn reject_without_reason_is_400() {
        let app = test_router().await;
        let (status, _) = send(
            &app,
            request("POST", "/v1/approval/t1/reject", Some("u1"), Some(json!({ "reason": "" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deliverable_can_be_removed() {
        let app = test_router().await;
        send(
            &app,
            request(
                "POST",
                "/v1/approval/t1/deliverables",
                Some("u3"),
                Some(json!({ "id": "d1", "fileId": "f1", "fileName": "calc.pdf" })),
            ),
        )
        .await;

        let (status, body) =
            send(&app, request("DELETE", "/v1/approval/t1/deliverables/d1", Some("u3"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deliverables"], json!([]));

        let (status, _) =
            send(&app, request("DELETE", "/v1/approval/t1/deliverables/d1", Some("u3"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
