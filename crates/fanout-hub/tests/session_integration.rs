//! Black-box tests driving real loopback WebSocket connections through
//! `axum::serve`, mirroring the teacher's `mock_ws_server.rs` pattern.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fanout_bus::{Bus, InMemoryBus};
use fanout_hub::{run_session, Hub, HubOptions, NoopCallbacks};
use fanout_protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as ClientMessage;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct TestState {
    hub: Hub,
    options: HubOptions,
}

#[derive(Deserialize, Default)]
struct WsQuery {
    #[serde(default)]
    recipient_id: u64,
}

async fn ws_handler(
    State(state): State<TestState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| async move {
        run_session(socket, query.recipient_id, state.hub, Arc::new(NoopCallbacks), state.options).await;
    })
}

async fn spawn_server(hub: Hub, options: HubOptions) -> String {
    let state = TestState { hub, options };
    let router = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn connect(url: &str, recipient_id: u64) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("{url}?recipient_id={recipient_id}");
    let (stream, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

#[tokio::test]
async fn directed_envelope_reaches_only_its_recipient() {
    let hub = Hub::new();
    let url = spawn_server(hub.clone(), HubOptions::default()).await;

    let mut alice = connect(&url, 1).await;
    let mut bob = connect(&url, 2).await;
    wait_for_presence(&hub, 1).await;
    wait_for_presence(&hub, 2).await;

    let envelope = Envelope::directed(1, "greet", None).unwrap();
    hub.deliver_local(&envelope).await;

    let received = tokio::time::timeout(Duration::from_secs(2), alice.next())
        .await
        .expect("alice should receive a frame")
        .unwrap()
        .unwrap();
    assert!(matches!(received, ClientMessage::Text(_)));

    let nothing = tokio::time::timeout(Duration::from_millis(200), bob.next()).await;
    assert!(nothing.is_err(), "bob should not receive the directed envelope");
}

#[tokio::test]
async fn broadcast_envelope_reaches_every_connected_session() {
    let hub = Hub::new();
    let url = spawn_server(hub.clone(), HubOptions::default()).await;

    let mut alice = connect(&url, 1).await;
    let mut bob = connect(&url, 2).await;
    wait_for_presence(&hub, 1).await;
    wait_for_presence(&hub, 2).await;

    let envelope = Envelope::broadcast("announce", None).unwrap();
    let delivered = hub.deliver_local(&envelope).await;
    assert_eq!(delivered, 2);

    for client in [&mut alice, &mut bob] {
        let received = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("should receive the broadcast")
            .unwrap()
            .unwrap();
        assert!(matches!(received, ClientMessage::Text(_)));
    }
}

#[tokio::test]
async fn silent_peer_is_disconnected_after_the_read_timeout() {
    let hub = Hub::new();
    let options = HubOptions {
        read_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..HubOptions::default()
    };
    let url = spawn_server(hub.clone(), options).await;

    let _client = connect(&url, 7).await;
    wait_for_presence(&hub, 7).await;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!hub.is_online(7).await, "hub should have unregistered the silent peer");
}

#[tokio::test]
async fn two_hub_instances_sharing_a_bus_deliver_across_nodes_over_real_sockets() {
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());

    let hub_a = Hub::new();
    let hub_b = Hub::new();
    let cancel_a = CancellationToken::new();
    let cancel_b = CancellationToken::new();
    hub_a.enable_cluster(bus.clone(), "fanout:test", cancel_a.clone()).await.unwrap();
    hub_b.enable_cluster(bus, "fanout:test", cancel_b.clone()).await.unwrap();

    let url_b = spawn_server(hub_b.clone(), HubOptions::default()).await;
    let mut client_on_b = connect(&url_b, 99).await;
    wait_for_presence(&hub_b, 99).await;

    let envelope = Envelope::directed(99, "cross-node", None).unwrap();
    hub_a.publish(&envelope).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), client_on_b.next())
        .await
        .expect("client connected to hub_b should receive the cross-node envelope")
        .unwrap()
        .unwrap();
    assert!(matches!(received, ClientMessage::Text(_)));

    cancel_a.cancel();
    cancel_b.cancel();
}

async fn wait_for_presence(hub: &Hub, recipient_id: u64) {
    for _ in 0..50 {
        if hub.is_online(recipient_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("recipient {recipient_id} never became present");
}
