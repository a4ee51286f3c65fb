// Wiring: event subscriptions, the combined router and its middleware.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use cdm_common::events::Topic;

use crate::config::ServerConfig;
use crate::cors::cors_layer;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::events::EventBus;
use crate::store::GraphStore;
use crate::sync::{FlushPolicy, SessionRegistry};
use crate::workflow::{
    ApprovalService, LiveSyncBridge, NotificationHandler, Notifier, TracingNotifier,
    UnlockPropagator,
};
use crate::ws::CollabState;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Everything the router needs, built once at start-up.
#[derive(Clone)]
pub struct AppState {
    pub store: GraphStore,
    pub events: EventBus,
    pub approvals: ApprovalService,
    pub collab: CollabState,
}

impl AppState {
    pub fn new(store: GraphStore, config: &ServerConfig) -> Self {
        Self::with_notifier(store, config, Arc::new(TracingNotifier))
    }

    /// Subscribes the workflow handlers in the order they must observe an event:
    /// live documents first, then dependent tasks, then people.
    pub fn with_notifier(store: GraphStore, config: &ServerConfig, notifier: Arc<dyn Notifier>) -> Self {
        let events = EventBus::new();
        let registry = SessionRegistry::new();

        let live_sync = LiveSyncBridge::new(Arc::new(registry.clone()), store.clone());
        let unlock = Arc::new(UnlockPropagator::new(store.clone(), live_sync.clone()));
        let live_sync = Arc::new(live_sync);
        let notifications = Arc::new(NotificationHandler::new(store.clone(), notifier));

        events.subscribe(Topic::ApprovalRequested, live_sync.clone());
        events.subscribe(Topic::ApprovalRequested, notifications.clone());
        events.subscribe(Topic::ApprovalResolved, live_sync);
        events.subscribe(Topic::ApprovalResolved, unlock);
        events.subscribe(Topic::ApprovalResolved, notifications);

        let collab = CollabState::new(
            store.clone(),
            events.clone(),
            registry,
            FlushPolicy::new(config.flush_debounce, config.flush_max_debounce),
            config.doc_grace_period,
        );
        let approvals = ApprovalService::new(store.clone(), events.clone());

        Self { store, events, approvals, collab }
    }
}

pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(crate::api::router(state.approvals))
            .merge(state.collab.router()),
    )
    .layer(cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
