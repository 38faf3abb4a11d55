//! WebSocket sign-in bridge.
//!
//! Relays an interactive Steam authentication exchange between a browser
//! client and an auth-only CM session. Messages are text JSON; binary
//! frames, oversized frames and out-of-turn messages close the
//! connection. On success the captured token is handed to the session
//! manager, which adds or upgrades the account.
//!
//! ## Protocol
//!
//! Client: `{"type":"credentials","account_name":..,"password":..}` or
//! `{"type":"qr"}`, then `{"type":"guard_code"|"email","code":..}` when a
//! confirmation is requested.
//!
//! Server: `{"url":..}` (QR), `{"confirmations":[..]}`,
//! `{"renewable":..,"expires"?:..}` on success or `{"error":{..}}`.

use crate::cm::{self, AuthEvent, CmAuthSession, CmError, ConfirmationKind, TokenInfo};
use crate::constants::{CM_CONNECT_TIMEOUT, SIGNIN_RX_LIMIT};
use crate::session;
use crate::state::Ts3State;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which client messages are currently expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingInit,
    AwaitingCmResponse,
    AwaitingConfirmation,
    Done,
}

struct SigninCtx {
    phase: Phase,
    auth: Option<Box<dyn CmAuthSession>>,
    events: Option<mpsc::Receiver<AuthEvent>>,
    /// Captured on successful completion.
    token: Option<String>,
}

pub async fn ws_handler(State(state): State<Arc<Ts3State>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(SIGNIN_RX_LIMIT)
        .max_frame_size(SIGNIN_RX_LIMIT)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// Device name reported to Steam for tokens issued through the bridge.
fn device_name() -> String {
    format!(
        "tek-s3 {} @ {}",
        env!("CARGO_PKG_VERSION"),
        gethostname::gethostname().to_string_lossy()
    )
}

async fn handle_socket(state: Arc<Ts3State>, mut socket: WebSocket) {
    let mut ctx = SigninCtx {
        phase: Phase::AwaitingInit,
        auth: None,
        events: None,
        token: None,
    };
    drive(&state, &mut socket, &mut ctx).await;
    if let Some(auth) = ctx.auth.take() {
        auth.disconnect().await;
    }
    drop(socket);

    if ctx.phase == Phase::Done {
        if let Some(token) = ctx.token.take() {
            session::register_signin_token(&state, token);
        }
    }
}

/// Runs the bridge until either side is done. Returning closes the WS.
async fn drive(state: &Arc<Ts3State>, socket: &mut WebSocket, ctx: &mut SigninCtx) {
    loop {
        if state.shutdown.is_cancelled() {
            return;
        }
        let step = match ctx.events.as_mut() {
            Some(events) => {
                tokio::select! {
                    message = socket.recv() => Step::Client(message),
                    event = events.recv() => Step::Upstream(event),
                    () = state.shutdown.cancelled() => return,
                }
            },
            None => Step::Client(socket.recv().await),
        };
        match step {
            Step::Client(message) => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    // Pings are answered by the transport
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    // Binary frames, oversized frames (surfacing as
                    // protocol errors) and closes all end the session
                    _ => return,
                };
                if process_client_message(state, socket, ctx, text.as_str())
                    .await
                    .is_err()
                {
                    return;
                }
            },
            Step::Upstream(event) => {
                let done = process_auth_event(socket, ctx, event).await;
                if done {
                    return;
                }
            },
        }
    }
}

enum Step {
    Client(Option<Result<Message, axum::Error>>),
    Upstream(Option<AuthEvent>),
}

struct CloseWs;

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), CloseWs> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| CloseWs)
}

fn error_json(e: &CmError) -> serde_json::Value {
    let mut error = serde_json::json!({
        "type": e.type_code(),
        "primary": e.primary_code(),
    });
    if let Some(auxiliary) = e.auxiliary_code() {
        error["auxiliary"] = auxiliary.into();
    }
    serde_json::json!({ "error": error })
}

async fn process_client_message(
    state: &Arc<Ts3State>,
    socket: &mut WebSocket,
    ctx: &mut SigninCtx,
    text: &str,
) -> Result<(), CloseWs> {
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(text) else {
        return Err(CloseWs);
    };
    let Some(kind) = doc.get("type").and_then(serde_json::Value::as_str) else {
        return Err(CloseWs);
    };
    match ctx.phase {
        Phase::AwaitingInit => {
            enum Init<'a> {
                Credentials { account_name: &'a str, password: &'a str },
                Qr,
            }
            let init = match kind {
                "credentials" => {
                    let Some(account_name) = doc.get("account_name").and_then(|v| v.as_str())
                    else {
                        return Err(CloseWs);
                    };
                    let Some(password) = doc.get("password").and_then(|v| v.as_str()) else {
                        return Err(CloseWs);
                    };
                    Init::Credentials {
                        account_name,
                        password,
                    }
                },
                "qr" => Init::Qr,
                _ => return Err(CloseWs),
            };

            let (auth, events) =
                match cm::with_timeout(CM_CONNECT_TIMEOUT, state.connector.connect_auth()).await {
                    Ok(connected) => connected,
                    Err(e) => {
                        let _ = send_json(socket, &error_json(&e)).await;
                        return Err(CloseWs);
                    },
                };
            let begun = match init {
                Init::Credentials {
                    account_name,
                    password,
                } => {
                    auth.begin_credentials(&device_name(), account_name, password)
                        .await
                },
                Init::Qr => auth.begin_qr(&device_name()).await,
            };
            if let Err(e) = begun {
                let _ = send_json(socket, &error_json(&e)).await;
                return Err(CloseWs);
            }
            ctx.auth = Some(auth);
            ctx.events = Some(events);
            ctx.phase = Phase::AwaitingCmResponse;
            Ok(())
        },
        Phase::AwaitingConfirmation => {
            let confirmation = match kind {
                "guard_code" => ConfirmationKind::GuardCode,
                "email" => ConfirmationKind::Email,
                _ => return Err(CloseWs),
            };
            let Some(code) = doc.get("code").and_then(serde_json::Value::as_str) else {
                return Err(CloseWs);
            };
            let Some(auth) = ctx.auth.as_deref() else {
                return Err(CloseWs);
            };
            if auth.submit_code(confirmation, code).await.is_err() {
                return Err(CloseWs);
            }
            ctx.phase = Phase::AwaitingCmResponse;
            Ok(())
        },
        // No incoming messages are accepted in these phases
        Phase::AwaitingCmResponse | Phase::Done => Err(CloseWs),
    }
}

/// Handles one upstream auth event; returns true when the WS should
/// close.
async fn process_auth_event(
    socket: &mut WebSocket,
    ctx: &mut SigninCtx,
    event: Option<AuthEvent>,
) -> bool {
    match event {
        Some(AuthEvent::NewUrl(url)) => {
            send_json(socket, &serde_json::json!({ "url": url }))
                .await
                .is_err()
        },
        Some(AuthEvent::AwaitingConfirmation(kinds)) => {
            ctx.phase = Phase::AwaitingConfirmation;
            let kinds: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
            send_json(socket, &serde_json::json!({ "confirmations": kinds }))
                .await
                .is_err()
        },
        Some(AuthEvent::Completed(Ok(token))) => {
            ctx.phase = Phase::Done;
            let message = match TokenInfo::parse(&token) {
                Some(info) if info.renewable => serde_json::json!({ "renewable": true }),
                Some(info) => {
                    serde_json::json!({ "renewable": false, "expires": info.expires })
                },
                None => serde_json::json!({ "renewable": false }),
            };
            ctx.token = Some(token);
            let _ = send_json(socket, &message).await;
            true
        },
        Some(AuthEvent::Completed(Err(e))) => {
            ctx.phase = Phase::Done;
            let _ = send_json(socket, &error_json(&e)).await;
            true
        },
        // Upstream went away without completing the exchange
        None => {
            ctx.events = None;
            let _ = send_json(
                socket,
                &error_json(&CmError::Transport("CM session disconnected".into())),
            )
            .await;
            true
        },
    }
}
