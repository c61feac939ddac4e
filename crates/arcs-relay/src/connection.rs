//! Per-connection protocol state machine.
//!
//! Every live WebSocket is owned by exactly one `handle_socket` call. The
//! socket is split into a reader loop and a writer task fed by a bounded
//! channel, so writes are serialized and concurrent reads/writes on the
//! same socket never happen. A connection is the device-leg or a
//! controller-leg of at most one session; all other components refer to it
//! by id and reach it through the connection table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};
use uuid::Uuid;

use arcs_core::{Operation, SessionError};
use arcs_proto::message::{pong, AuthResponse, JoinResponse, SessionCreated};
use arcs_proto::{validate_message, ErrorCode, ErrorMessage, MessageKind};

use crate::command::CommandOutcome;
use crate::server::RelayState;

/// How long an unauthenticated peer gets to read its error before the
/// socket closes under it.
const AUTH_GRACE: Duration = Duration::from_millis(250);

/// Which leg of a session this connection is.
enum Leg {
    Unauthenticated,
    Device {
        session_id: String,
        device_id: String,
    },
    Controller {
        session_id: String,
        drain: tokio::task::JoinHandle<()>,
    },
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Drive one WebSocket from upgrade to teardown.
///
/// `bearer` is the token from the upgrade's `Authorization` header, if
/// any; controllers may supply their session token that way instead of in
/// the `join_session` body.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, bearer: Option<String>) {
    let conn_id = Uuid::new_v4().to_string();
    let (ws_tx, mut ws_rx) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(state.config.send_queue_depth);
    state.connections.insert(conn_id.clone(), out_tx.clone());
    state.metrics.active_connections.inc();
    debug!(conn = %conn_id, "connection open");

    // Writer task: sole owner of the sink half. Stops after relaying a
    // close frame or when every sender is gone.
    let writer = tokio::spawn(async move {
        let mut ws_tx = ws_tx;
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut leg = Leg::Unauthenticated;
    let mut last_rx = Instant::now();
    let mut ping_tick = tokio::time::interval(state.config.heartbeat_interval());
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping_tick.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if last_rx.elapsed() >= state.config.heartbeat_timeout() {
                    debug!(conn = %conn_id, "no traffic within heartbeat timeout, closing");
                    break;
                }
                let _ = out_tx.try_send(Message::Ping(Vec::new()));
            }
            incoming = ws_rx.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, "websocket read error: {e}");
                        break;
                    }
                    None => break,
                };
                last_rx = Instant::now();
                let flow = match msg {
                    Message::Text(text) => {
                        handle_text(&state, &conn_id, &out_tx, &mut leg, &bearer, &text).await
                    }
                    Message::Binary(data) => {
                        handle_binary(&state, &out_tx, &mut leg, data).await
                    }
                    // The websocket layer answers pings; both directions
                    // just count as liveness.
                    Message::Ping(_) | Message::Pong(_) => Flow::Continue,
                    Message::Close(_) => Flow::Close,
                };
                if flow == Flow::Close {
                    break;
                }
            }
        }
    }

    cleanup(&state, &conn_id, leg).await;

    let _ = out_tx.try_send(Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    })));
    drop(out_tx);
    match tokio::time::timeout(Duration::from_secs(5), writer).await {
        Ok(Err(e)) if e.is_panic() => error!(conn = %conn_id, "writer task panicked: {e}"),
        Err(_) => debug!(conn = %conn_id, "writer task slow to drain, dropping"),
        _ => {}
    }
    debug!(conn = %conn_id, "connection closed");
}

async fn handle_text(
    state: &Arc<RelayState>,
    conn_id: &str,
    out_tx: &mpsc::Sender<Message>,
    leg: &mut Leg,
    bearer: &Option<String>,
    text: &str,
) -> Flow {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(conn = %conn_id, "malformed JSON: {e}");
            return match leg {
                Leg::Unauthenticated => reject_unauthorized(out_tx).await,
                _ => {
                    send_error(out_tx, ErrorCode::InvalidCommand, "malformed JSON").await;
                    Flow::Continue
                }
            };
        }
    };

    // Pings are answered locally on any leg and never forwarded.
    if value.get("type").and_then(Value::as_str) == Some("ping") {
        send_json(out_tx, &pong()).await;
        touch_session(state, leg);
        return Flow::Continue;
    }

    match leg {
        Leg::Unauthenticated => {
            handle_unauthenticated(state, conn_id, out_tx, leg, bearer, value).await
        }
        Leg::Device { session_id, .. } => {
            let session_id = session_id.clone();
            handle_device_text(state, &session_id, out_tx, text, &value).await
        }
        Leg::Controller { session_id, .. } => {
            let session_id = session_id.clone();
            handle_controller_text(state, &session_id, out_tx, text).await
        }
    }
}

async fn handle_unauthenticated(
    state: &Arc<RelayState>,
    conn_id: &str,
    out_tx: &mpsc::Sender<Message>,
    leg: &mut Leg,
    bearer: &Option<String>,
    mut value: Value,
) -> Flow {
    // A controller may carry its token in the upgrade's Authorization
    // header instead of the join body.
    if value.get("type").and_then(Value::as_str) == Some("join_session")
        && value.get("jwt_token").is_none()
    {
        if let (Some(obj), Some(token)) = (value.as_object_mut(), bearer.as_deref()) {
            obj.insert("jwt_token".to_string(), Value::String(token.to_string()));
        }
    }

    let kind = match validate_message(&value) {
        Ok(kind) => kind,
        Err(e) => {
            warn!(conn = %conn_id, "pre-auth message rejected: {e}");
            return reject_unauthorized(out_tx).await;
        }
    };

    match kind {
        MessageKind::AuthRequest | MessageKind::DeviceHello => {
            handle_auth(state, conn_id, out_tx, leg, kind, value).await
        }
        MessageKind::JoinSession => handle_join(state, conn_id, out_tx, leg, value).await,
        _ => {
            warn!(conn = %conn_id, kind = %kind, "message before authentication");
            reject_unauthorized(out_tx).await
        }
    }
}

/// Device authentication: `auth_request` checks the registry;
/// `device_hello` is the permissive variant and bypasses it, so
/// unregistered devices can still be reached by a controller holding the
/// session code and token.
async fn handle_auth(
    state: &Arc<RelayState>,
    conn_id: &str,
    out_tx: &mpsc::Sender<Message>,
    leg: &mut Leg,
    kind: MessageKind,
    value: Value,
) -> Flow {
    let device_id = value["device_id"].as_str().unwrap_or_default().to_string();

    if !state.limiter.allow(&device_id, Operation::Auth) {
        state.metrics.rate_limit_hits.inc();
        state.audit.rate_limit_exceeded(&device_id, "auth").await;
        send_error(out_tx, ErrorCode::RateLimit, "too many authentication attempts").await;
        return Flow::Continue;
    }

    let method = if kind == MessageKind::DeviceHello {
        "hello"
    } else {
        "secret"
    };

    if kind == MessageKind::AuthRequest {
        let secret = value["secret"].as_str().unwrap_or_default();
        match state.registry.authenticate(&device_id, secret).await {
            Ok(true) => {}
            Ok(false) => {
                state.metrics.auth_failure.inc();
                state.audit.auth_failure(&device_id, "bad credentials").await;
                send_error(out_tx, ErrorCode::AuthFailed, "authentication failed").await;
                return Flow::Close;
            }
            Err(e) => {
                error!(conn = %conn_id, "registry failure: {e}");
                send_error(out_tx, ErrorCode::Internal, "internal error").await;
                return Flow::Close;
            }
        }
    }

    let outcome = match state.sessions.create_or_adopt(&device_id, conn_id.to_string()) {
        Ok(outcome) => outcome,
        Err(SessionError::MaxSessions(max)) => {
            warn!(conn = %conn_id, "session capacity reached ({max})");
            send_error(out_tx, ErrorCode::DeviceBusy, "server at session capacity").await;
            return Flow::Close;
        }
    };

    // A repeat hello adopts the live session; the stale device-leg is cut.
    if let Some(old_conn) = outcome.replaced_device_conn.as_deref() {
        if old_conn != conn_id {
            debug!(conn = %conn_id, old = %old_conn, "device-leg replaced");
            close_peer(state, old_conn, close_code::AWAY, "replaced by a newer device-leg").await;
        }
    }

    if let Some(info) = value.get("device_info") {
        state.sessions.set_device_info(&outcome.session_id, info.clone());
    }
    state.streams.register_device(&outcome.session_id, &device_id);

    let issued = match state.tokens.issue(
        &device_id,
        &outcome.session_id,
        vec!["view".to_string(), "control".to_string()],
    ) {
        Ok(issued) => issued,
        Err(e) => {
            error!(conn = %conn_id, "token mint failed: {e}");
            send_error(out_tx, ErrorCode::Internal, "internal error").await;
            return Flow::Close;
        }
    };

    let server_time = chrono::Utc::now().timestamp_millis();
    match kind {
        MessageKind::AuthRequest => {
            send_json(
                out_tx,
                &AuthResponse::new(
                    outcome.session_id.clone(),
                    issued.token,
                    issued.expires_at,
                    server_time,
                ),
            )
            .await;
        }
        _ => {
            send_json(
                out_tx,
                &SessionCreated::new(
                    outcome.session_id.clone(),
                    issued.token,
                    issued.expires_at,
                    server_time,
                ),
            )
            .await;
        }
    }

    state.metrics.auth_success.inc();
    state.audit.auth_success(&device_id, method).await;
    if !outcome.adopted {
        state.metrics.active_sessions.set(state.sessions.count() as f64);
        state.audit.session_start(&outcome.session_id, &device_id).await;
    }

    *leg = Leg::Device {
        session_id: outcome.session_id,
        device_id,
    };
    Flow::Continue
}

async fn handle_join(
    state: &Arc<RelayState>,
    conn_id: &str,
    out_tx: &mpsc::Sender<Message>,
    leg: &mut Leg,
    value: Value,
) -> Flow {
    let session_id = value["session_id"].as_str().unwrap_or_default().to_string();
    let token = value["jwt_token"].as_str().unwrap_or_default();

    let claims = match state.tokens.validate(token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(conn = %conn_id, "join rejected: {e}");
            state.audit.permission_denied(conn_id, "join_session").await;
            send_error(out_tx, ErrorCode::InvalidToken, "token rejected").await;
            return Flow::Close;
        }
    };
    if claims.sid != session_id {
        warn!(conn = %conn_id, "token is for a different session");
        state.audit.permission_denied(conn_id, "join_session").await;
        send_error(out_tx, ErrorCode::InvalidToken, "token rejected").await;
        return Flow::Close;
    }

    let Some(session) = state.sessions.get(&session_id) else {
        warn!(conn = %conn_id, session = %session_id, "join for unknown session");
        send_error(out_tx, ErrorCode::SessionNotFound, "no such session").await;
        return Flow::Close;
    };

    if !state.sessions.join(&session_id, conn_id.to_string()) {
        send_error(out_tx, ErrorCode::SessionNotFound, "no such session").await;
        return Flow::Close;
    }
    let Some(queue) = state.streams.register_controller(&session_id, conn_id) else {
        error!(conn = %conn_id, session = %session_id, "session has no stream endpoint");
        send_error(out_tx, ErrorCode::Internal, "internal error").await;
        return Flow::Close;
    };

    // Independent drain per controller-leg: frames flow from this
    // controller's FIFO onto its writer channel without touching the
    // device-leg or sibling controllers.
    let drain = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            loop {
                let frame = queue.pop().await;
                if out_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
                    break;
                }
            }
        }
    });

    let video_config = serde_json::json!({
        "codec": "h264",
        "max_packet_size": state.config.max_packet_size,
        "queue_depth": state.config.max_frame_queue,
    });
    send_json(
        out_tx,
        &JoinResponse::new(
            session_id.clone(),
            session.device_info.clone().unwrap_or(Value::Null),
            video_config,
        ),
    )
    .await;

    if let Some(device_conn) = session.device_conn.as_deref() {
        send_peer_event(
            state,
            device_conn,
            MessageKind::ControllerConnected,
            &session_id,
            conn_id,
        )
        .await;
    }

    *leg = Leg::Controller { session_id, drain };
    Flow::Continue
}

/// Device-leg JSON: acks, status, and keepalives flow to the session's
/// controllers.
async fn handle_device_text(
    state: &Arc<RelayState>,
    session_id: &str,
    out_tx: &mpsc::Sender<Message>,
    text: &str,
    value: &Value,
) -> Flow {
    let kind = match validate_message(value) {
        Ok(kind) => kind,
        Err(e) => {
            warn!(session = %session_id, "device message rejected: {e}");
            send_error(out_tx, ErrorCode::InvalidCommand, e.to_string()).await;
            return Flow::Continue;
        }
    };

    match kind {
        MessageKind::CommandResult | MessageKind::Status | MessageKind::Pong | MessageKind::Error => {
            state.sessions.touch(session_id);
            if kind == MessageKind::Error
                && value["details"]["kind"].as_str() == Some("encryption")
            {
                let detail = value["message"].as_str().unwrap_or("unspecified");
                state.audit.encryption_error(session_id, detail).await;
            }
            let relayed = state.commands.route_to_controller(session_id, text.as_bytes());
            let relayed = String::from_utf8_lossy(&relayed).into_owned();
            if let Some(session) = state.sessions.get(session_id) {
                for controller in &session.controllers {
                    send_to(state, controller, Message::Text(relayed.clone())).await;
                }
            }
            Flow::Continue
        }
        other => {
            warn!(session = %session_id, kind = %other, "unexpected message from device-leg");
            send_error(out_tx, ErrorCode::InvalidCommand, "unexpected message from device-leg")
                .await;
            Flow::Continue
        }
    }
}

/// Controller-leg JSON: control commands run the command router and land
/// on the device-leg.
async fn handle_controller_text(
    state: &Arc<RelayState>,
    session_id: &str,
    out_tx: &mpsc::Sender<Message>,
    text: &str,
) -> Flow {
    state.sessions.touch(session_id);

    match state.commands.route_to_device(session_id, text.as_bytes()).await {
        CommandOutcome::Forward(bytes) => {
            state.metrics.commands_forwarded.inc();
            let Some(session) = state.sessions.get(session_id) else {
                send_error(out_tx, ErrorCode::SessionNotFound, "session closed").await;
                return Flow::Close;
            };
            match session.device_conn.as_deref() {
                Some(device_conn) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    send_to(state, device_conn, Message::Text(text)).await;
                }
                None => {
                    send_error(out_tx, ErrorCode::DeviceBusy, "device not connected").await;
                }
            }
            Flow::Continue
        }
        CommandOutcome::Reject(bytes) => {
            state.metrics.commands_rejected.inc();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let _ = out_tx.send(Message::Text(text)).await;
            Flow::Continue
        }
    }
}

/// Binary traffic is the video plane; only the device-leg produces it.
/// The relay does not look inside the payload.
async fn handle_binary(
    state: &Arc<RelayState>,
    out_tx: &mpsc::Sender<Message>,
    leg: &mut Leg,
    data: Vec<u8>,
) -> Flow {
    match leg {
        Leg::Device { session_id, .. } => {
            state.sessions.touch(session_id);
            let size = data.len();
            match state.streams.route_frame(session_id, Bytes::from(data)) {
                Some(report) => {
                    state.metrics.frames_routed.inc();
                    state.metrics.bytes_relayed.inc_by(size as f64);
                    if report.dropped > 0 {
                        state.metrics.frames_dropped.inc_by(report.dropped as f64);
                    }
                }
                None => {
                    warn!(session = %session_id, "frame for a session with no endpoint");
                }
            }
            Flow::Continue
        }
        Leg::Controller { .. } => {
            debug!("ignoring binary message from controller-leg");
            Flow::Continue
        }
        Leg::Unauthenticated => reject_unauthorized(out_tx).await,
    }
}

/// Tear down whatever the connection had attached.
async fn cleanup(state: &Arc<RelayState>, conn_id: &str, leg: Leg) {
    state.connections.remove(conn_id);
    state.metrics.active_connections.dec();

    match leg {
        Leg::Unauthenticated => {}
        Leg::Device {
            session_id,
            device_id,
        } => {
            debug!(conn = %conn_id, device = %device_id, "device-leg disconnected");
            // After adoption the session belongs to a newer device-leg;
            // only the current owner tears it down.
            let owns = state
                .sessions
                .get(&session_id)
                .map(|s| s.device_conn.as_deref() == Some(conn_id))
                .unwrap_or(false);
            if !owns {
                return;
            }
            let Some(session) = state.sessions.close(&session_id) else {
                return;
            };
            for controller in &session.controllers {
                send_peer_event(
                    state,
                    controller,
                    MessageKind::DeviceDisconnected,
                    &session_id,
                    conn_id,
                )
                .await;
                close_peer(state, controller, close_code::AWAY, "session closed").await;
            }
            state.streams.unregister_device(&session_id);
            state.limiter.reset(&session_id);
            state.metrics.active_sessions.set(state.sessions.count() as f64);
            state
                .audit
                .session_end(&session_id, "device_disconnected", session.age().as_secs())
                .await;
        }
        Leg::Controller { session_id, drain } => {
            drain.abort();
            state.sessions.remove_controller(&session_id, conn_id);
            state.streams.unregister_controller(&session_id, conn_id);
            // The session survives with zero controllers; the device may
            // keep streaming into nothing.
            if let Some(session) = state.sessions.get(&session_id) {
                if let Some(device_conn) = session.device_conn.as_deref() {
                    send_peer_event(
                        state,
                        device_conn,
                        MessageKind::ControllerDisconnected,
                        &session_id,
                        conn_id,
                    )
                    .await;
                }
            }
        }
    }
}

fn touch_session(state: &Arc<RelayState>, leg: &Leg) {
    match leg {
        Leg::Device { session_id, .. } | Leg::Controller { session_id, .. } => {
            state.sessions.touch(session_id);
        }
        Leg::Unauthenticated => {}
    }
}

async fn reject_unauthorized(out_tx: &mpsc::Sender<Message>) -> Flow {
    send_error(out_tx, ErrorCode::Unauthorized, "authenticate first").await;
    tokio::time::sleep(AUTH_GRACE).await;
    Flow::Close
}

async fn send_json<T: Serialize>(out_tx: &mpsc::Sender<Message>, value: &T) {
    if let Ok(text) = serde_json::to_string(value) {
        let _ = out_tx.send(Message::Text(text)).await;
    }
}

async fn send_error(out_tx: &mpsc::Sender<Message>, code: ErrorCode, message: impl Into<String>) {
    send_json(out_tx, &ErrorMessage::new(code, message)).await;
}

/// Send to another connection through the table. The sender is cloned out
/// before awaiting so no map guard is held across the send.
async fn send_to(state: &Arc<RelayState>, conn_id: &str, msg: Message) {
    let tx = state
        .connections
        .get(conn_id)
        .map(|entry| entry.value().clone());
    if let Some(tx) = tx {
        let _ = tx.send(msg).await;
    }
}

async fn send_peer_event(
    state: &Arc<RelayState>,
    conn_id: &str,
    kind: MessageKind,
    session_id: &str,
    peer_id: &str,
) {
    let event = arcs_proto::message::peer_event(kind, session_id, peer_id);
    if let Ok(text) = serde_json::to_string(&event) {
        send_to(state, conn_id, Message::Text(text)).await;
    }
}

/// Close another connection with the given code.
pub(crate) async fn close_peer(state: &Arc<RelayState>, conn_id: &str, code: u16, reason: &str) {
    send_to(
        state,
        conn_id,
        Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })),
    )
    .await;
}
