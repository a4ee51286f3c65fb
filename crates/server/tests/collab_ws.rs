use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cdm_common::events::{ChangeType, DomainEvent, NodeChanged, Topic};
use cdm_common::types::{Graph, Node};
use cdm_server::app::{build_router, AppState};
use cdm_server::config::ServerConfig;
use cdm_server::events::{EventHandler, HandlerFuture};
use cdm_server::store::GraphStore;
use cdm_server::sync::GraphDocument;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use yrs::sync::{Awareness, DefaultProtocol, Message, Protocol, SyncMessage};
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Default)]
struct ChangeLog(Mutex<Vec<NodeChanged>>);

impl EventHandler for ChangeLog {
    fn name(&self) -> &'static str {
        "change-log"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let DomainEvent::NodeChanged(change) = event {
                self.0.lock().expect("lock").push(change.clone());
            }
            Ok(())
        })
    }
}

struct Client {
    socket: ClientSocket,
    awareness: Awareness,
    document: GraphDocument,
}

impl Client {
    async fn connect(addr: SocketAddr, client_id: u64) -> Self {
        let (socket, _) = connect_async(format!("ws://{addr}/collab/graph:g1"))
            .await
            .expect("client should connect");
        let document = GraphDocument::with_client_id(client_id);
        let awareness = Awareness::new(document.doc().clone());
        let mut client = Self { socket, awareness, document };
        client.handshake().await;
        client
    }

    /// The server greets with its own step 1 and answers ours with step 2.
    async fn handshake(&mut self) {
        let step1 =
            Message::Sync(SyncMessage::SyncStep1(self.awareness.doc().transact().state_vector()))
                .encode_v1();
        self.socket.send(WsMessage::Binary(step1.into())).await.expect("send sync step 1");

        for _ in 0..2 {
            self.apply_next_frame().await;
        }
    }

    async fn apply_next_frame(&mut self) {
        let protocol = DefaultProtocol;
        let incoming = recv_binary(&mut self.socket).await;
        let responses =
            protocol.handle(&self.awareness, &incoming).expect("client should decode y-sync frame");
        for response in responses {
            self.socket
                .send(WsMessage::Binary(response.encode_v1().into()))
                .await
                .expect("client should answer");
        }
    }

    fn node(&self, node_id: &str) -> Option<Value> {
        self.document.node(node_id)
    }
}

async fn recv_binary(socket: &mut ClientSocket) -> Vec<u8> {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket frame");
        let message =
            next.expect("websocket should remain open").expect("websocket read should succeed");

        match message {
            WsMessage::Binary(payload) => return payload.to_vec(),
            WsMessage::Ping(payload) => {
                socket.send(WsMessage::Pong(payload)).await.expect("websocket should reply to ping");
            }
            WsMessage::Close(_) => panic!("websocket closed unexpectedly"),
            WsMessage::Text(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

async fn serve_seeded_graph() -> (SocketAddr, AppState, tokio::task::JoinHandle<()>) {
    let store = GraphStore::in_memory();
    store.insert_graph(Graph::new("g1", "Plant")).await.expect("graph");
    store.insert_node(Node::new("root", "g1", "Root")).await.expect("root");
    store.insert_node(Node::new("child", "g1", "Child").with_parent("root")).await.expect("child");

    let state = AppState::new(store, &ServerConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let app = build_router(state.clone(), None);
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    (addr, state, server)
}

#[tokio::test]
async fn first_client_receives_the_hydrated_graph() {
    let (addr, state, server) = serve_seeded_graph().await;

    let client = Client::connect(addr, 11).await;

    let root = client.node("root").expect("root entry");
    assert_eq!(root["label"], "Root");
    let child = client.node("child").expect("child entry");
    assert_eq!(child["parentId"], "root");
    assert!(client.document.edges().iter().any(|(id, _)| id == "edge-root-child"));
    assert_eq!(state.collab.connections("g1"), 1);

    server.abort();
}

#[tokio::test]
async fn edits_fan_out_and_publish_node_changes() {
    let (addr, state, server) = serve_seeded_graph().await;
    let changes = Arc::new(ChangeLog::default());
    state.events.subscribe(Topic::NodeChanged, changes.clone());

    let mut alice = Client::connect(addr, 21).await;
    let mut bob = Client::connect(addr, 22).await;
    assert_eq!(state.collab.connections("g1"), 2);

    let mut renamed = bob.node("root").expect("root entry");
    renamed["label"] = Value::String("Plant root".into());
    let delta = bob.document.write(|writer| writer.set_node("root", &renamed));
    let frame = Message::Sync(SyncMessage::Update(delta)).encode_v1();
    bob.socket.send(WsMessage::Binary(frame.into())).await.expect("bob sends update");

    let deadline = Instant::now() + Duration::from_secs(2);
    while alice.node("root").and_then(|root| root["label"].as_str().map(str::to_owned))
        != Some("Plant root".to_owned())
    {
        assert!(Instant::now() < deadline, "alice never saw bob's edit");
        alice.apply_next_frame().await;
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let published = changes.0.lock().expect("lock").clone();
        if let Some(change) = published.iter().find(|change| change.node_id == "root") {
            assert_eq!(change.graph_id, "g1");
            assert_eq!(change.node_name, "Plant root");
            assert_eq!(change.change_type, ChangeType::Update);
            break;
        }
        assert!(Instant::now() < deadline, "no node change was published");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let server_view = state
        .collab
        .join("g1")
        .await
        .live
        .read(|document| document.encode_state())
        .await;
    let mirror = GraphDocument::from_state(&server_view).expect("server state decodes");
    assert_eq!(mirror.node("root").expect("root")["label"], "Plant root");
    state.collab.leave("g1");

    let _ = bob.socket.close(None).await;
    let _ = alice.socket.close(None).await;
    server.abort();
}
