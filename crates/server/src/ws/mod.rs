//! y-sync websocket endpoint for graph documents.
//!
//! Clients connect to `/collab/graph:{graph_id}`. Every connection of a graph
//! shares one [`LiveDocument`]; merged updates are fanned out to the other
//! connections and schedule a debounced flush.

mod rooms;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{
            rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket,
            WebSocketUpgrade,
        },
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use yrs::encoding::read::Cursor;
use yrs::sync::{DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact, Update};

use cdm_common::types::graph_id_from_document_name;

use crate::error::{ErrorCode, ServerError};
use crate::sync::LiveDocument;

pub use rooms::{CollabState, Session};

impl CollabState {
    pub fn router(self) -> Router {
        Router::new().route("/collab/{document_name}", get(collab_route)).with_state(self)
    }
}

async fn collab_route(
    Path(document_name): Path<String>,
    State(state): State<CollabState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(graph_id) = graph_id_from_document_name(&document_name).map(str::to_owned) else {
        return ServerError::new(
            ErrorCode::ValidationFailed,
            format!("unsupported document name '{document_name}'"),
        )
        .into_response();
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, graph_id)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: CollabState, graph_id: String) {
    let client_id = state.next_client_id();
    let session = state.join(&graph_id).await;
    debug!(graph_id = %graph_id, client_id, "collab client connected");

    let greeting = sync_step1(&session.live).await;
    if socket.send(WsMessage::Binary(greeting.into())).await.is_ok() {
        serve_connection(&mut socket, &state, &session, client_id).await;
    }

    state.leave(&graph_id);
    debug!(graph_id = %graph_id, client_id, "collab client disconnected");
}

async fn serve_connection(
    socket: &mut WebSocket,
    state: &CollabState,
    session: &Session,
    client_id: u64,
) {
    let mut updates_rx = session.live.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };

                match message {
                    WsMessage::Binary(payload) => {
                        match process_incoming_binary(client_id, payload.as_ref(), session, socket).await {
                            Ok(merged) => {
                                if merged {
                                    session.schedule_flush();
                                    state.publish_changes(&session.live).await;
                                }
                            }
                            Err(error) => {
                                warn!(graph_id = session.live.graph_id(), ?error, "failed to process y-sync frame");
                                break;
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) | WsMessage::Text(_) => {}
                }
            }
            outbound = updates_rx.recv() => {
                match outbound {
                    Ok((origin, frame)) if origin != client_id => {
                        if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(graph_id = session.live.graph_id(), client_id, skipped, "collab client lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn sync_step1(live: &LiveDocument) -> Vec<u8> {
    let awareness = live.awareness().await;
    let state_vector = awareness.doc().transact().state_vector();
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Applies one binary frame. Returns whether any document update was merged.
async fn process_incoming_binary(
    client_id: u64,
    payload: &[u8],
    session: &Session,
    socket: &mut WebSocket,
) -> Result<bool> {
    let protocol = DefaultProtocol;
    let mut responses = Vec::new();
    let mut broadcasts = Vec::new();
    let mut merged = false;

    {
        let awareness = session.live.awareness().await;
        let mut decoder = DecoderV1::new(Cursor::new(payload));
        let mut reader = MessageReader::new(&mut decoder);

        while let Some(next_message) = reader.next() {
            let message = next_message.context("failed to decode y-sync message")?;
            match message {
                Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                    if let Some(response) = protocol
                        .handle_sync_step1(&awareness, state_vector)
                        .context("failed to process sync step 1")?
                    {
                        responses.push(response.encode_v1());
                    }
                }
                Message::Sync(SyncMessage::SyncStep2(update)) => {
                    let decoded = Update::decode_v1(&update)
                        .context("failed to decode sync step 2 update")?;
                    protocol
                        .handle_sync_step2(&awareness, decoded)
                        .context("failed to process sync step 2")?;
                    // Other connections see handshake content as a regular update.
                    broadcasts.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                    merged = true;
                }
                Message::Sync(SyncMessage::Update(update)) => {
                    let decoded = Update::decode_v1(&update)
                        .context("failed to decode incremental update")?;
                    protocol
                        .handle_update(&awareness, decoded)
                        .context("failed to process incremental update")?;
                    broadcasts.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                    merged = true;
                }
                other => {
                    if matches!(other, Message::Awareness(_)) {
                        broadcasts.push(other.encode_v1());
                    }
                    if let Some(response) = protocol
                        .handle_message(&awareness, other)
                        .context("failed to process y-sync message")?
                    {
                        responses.push(response.encode_v1());
                    }
                }
            }
        }
    }

    for response in responses {
        socket
            .send(WsMessage::Binary(response.into()))
            .await
            .context("failed to send y-sync response")?;
    }

    for frame in broadcasts {
        session.live.broadcast(client_id, frame);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    use super::*;
    use crate::events::EventBus;
    use crate::store::GraphStore;
    use crate::sync::{FlushPolicy, SessionRegistry};

    fn test_router() -> Router {
        CollabState::new(
            GraphStore::in_memory(),
            EventBus::new(),
            SessionRegistry::new(),
            FlushPolicy::default(),
            Duration::from_secs(30),
        )
        .router()
    }

    #[tokio::test]
    async fn foreign_document_name_is_rejected() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/collab/doc:g1")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn plain_get_without_upgrade_is_refused() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/collab/graph:g1")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert!(response.status().is_client_error());
    }
}
