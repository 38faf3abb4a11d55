//! Sign-in bridge integration tests.
//!
//! Runs the full server on an ephemeral port and talks to `/signin` with
//! a real WebSocket client.

#[path = "common.rs"]
mod common;

use common::wait_until;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tek_s3::cm::ConfirmationKind;
use tek_s3::cm::sim::SimConnector;
use tek_s3::http;
use tek_s3::state::{Status, Ts3State};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(connector: SimConnector) -> (Arc<Ts3State>, SocketAddr) {
    let state = Ts3State::new(Arc::new(connector), None);
    state.set_status(Status::Running);
    {
        let mut catalog = state.lock_catalog();
        tek_s3::manifest::update_manifest(&state, &mut catalog);
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (client, _response) = connect_async(format!("ws://{addr}/signin")).await.unwrap();
    client
}

async fn send_json(client: &mut WsClient, value: serde_json::Value) {
    client
        .send(WsMessage::text(value.to_string()))
        .await
        .unwrap();
}

/// Reads frames until a text frame arrives; `None` means the connection
/// closed first.
async fn next_json(client: &mut WsClient) -> Option<serde_json::Value> {
    while let Some(message) = client.next().await {
        match message {
            Ok(WsMessage::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {},
            Ok(WsMessage::Binary(_)) => {},
            Ok(WsMessage::Close(_)) | Err(_) => return None,
        }
    }
    None
}

#[tokio::test]
async fn credentials_signin_with_guard_code_registers_account() {
    let connector = SimConnector::new();
    connector.add_credentials(
        "gordon",
        "crowbar",
        7001,
        vec![ConfirmationKind::Device, ConfirmationKind::GuardCode],
        Some("R2D2"),
        true,
    );
    let (state, addr) = spawn_server(connector).await;

    let mut client = connect(addr).await;
    send_json(
        &mut client,
        serde_json::json!({
            "type": "credentials",
            "account_name": "gordon",
            "password": "crowbar",
        }),
    )
    .await;

    let confirmations = next_json(&mut client).await.unwrap();
    assert_eq!(
        confirmations["confirmations"],
        serde_json::json!(["device", "guard_code"])
    );

    send_json(
        &mut client,
        serde_json::json!({ "type": "guard_code", "code": "R2D2" }),
    )
    .await;
    let completed = next_json(&mut client).await.unwrap();
    assert_eq!(completed["renewable"], serde_json::json!(true));
    assert!(completed.get("expires").is_none());

    // Server closes the socket and registers the account
    assert!(next_json(&mut client).await.is_none());
    wait_until(|| state.lock_catalog().accounts.contains_key(&7001)).await;
    assert!(
        state.lock_catalog().accounts[&7001]
            .token_info
            .renewable
    );
}

#[tokio::test]
async fn wrong_password_reports_error_and_registers_nothing() {
    let connector = SimConnector::new();
    connector.add_credentials("gordon", "crowbar", 7001, vec![], None, false);
    let (state, addr) = spawn_server(connector).await;

    let mut client = connect(addr).await;
    send_json(
        &mut client,
        serde_json::json!({
            "type": "credentials",
            "account_name": "gordon",
            "password": "wrong",
        }),
    )
    .await;

    let error = next_json(&mut client).await.unwrap();
    // InvalidPassword surfaces as a Steam CM error with its EResult
    assert_eq!(error["error"]["type"], serde_json::json!(2));
    assert_eq!(error["error"]["auxiliary"], serde_json::json!(5));
    assert!(next_json(&mut client).await.is_none());

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(state.lock_catalog().accounts.is_empty());
}

#[tokio::test]
async fn qr_signin_emits_url() {
    let (_state, addr) = spawn_server(SimConnector::new()).await;

    let mut client = connect(addr).await;
    send_json(&mut client, serde_json::json!({ "type": "qr" })).await;
    let url = next_json(&mut client).await.unwrap();
    assert!(
        url["url"]
            .as_str()
            .is_some_and(|u| u.starts_with("https://"))
    );
    client.close(None).await.unwrap();
}

#[tokio::test]
async fn oversized_message_closes_without_response() {
    let (state, addr) = spawn_server(SimConnector::new()).await;

    let mut client = connect(addr).await;
    // 200 KB of text; the server's receive limit is 32 KB
    let huge = "x".repeat(200 * 1024);
    client.send(WsMessage::text(huge)).await.unwrap();
    assert!(next_json(&mut client).await.is_none());
    assert!(state.lock_catalog().accounts.is_empty());
}

#[tokio::test]
async fn binary_frames_close_the_connection() {
    let (_state, addr) = spawn_server(SimConnector::new()).await;

    let mut client = connect(addr).await;
    client
        .send(WsMessage::Binary(vec![1, 2, 3].into()))
        .await
        .unwrap();
    assert!(next_json(&mut client).await.is_none());
}

#[tokio::test]
async fn malformed_and_out_of_place_messages_close_the_connection() {
    let (_state, addr) = spawn_server(SimConnector::new()).await;

    let mut client = connect(addr).await;
    client.send(WsMessage::text("{not json")).await.unwrap();
    assert!(next_json(&mut client).await.is_none());

    let mut client = connect(addr).await;
    send_json(&mut client, serde_json::json!({ "type": "dance" })).await;
    assert!(next_json(&mut client).await.is_none());

    // A confirmation before any init is out of turn
    let mut client = connect(addr).await;
    send_json(
        &mut client,
        serde_json::json!({ "type": "guard_code", "code": "1234" }),
    )
    .await;
    assert!(next_json(&mut client).await.is_none());
}

#[tokio::test]
async fn websocket_is_only_served_on_signin_path() {
    let (_state, addr) = spawn_server(SimConnector::new()).await;
    assert!(connect_async(format!("ws://{addr}/other")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/manifest")).await.is_err());
}
