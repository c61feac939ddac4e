//! Relay server: component wiring, HTTP surface, and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::ws::{close_code, CloseFrame, Message, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use arcs_core::{
    AuditLog, ConnId, DeviceRegistry, FileSink, Operation, RateLimitConfig, RateLimiter,
    SessionManager, TokenService,
};

use crate::command::CommandRouter;
use crate::config::RelayConfig;
use crate::connection::{self, close_peer};
use crate::metrics::RelayMetrics;
use crate::stream::StreamRouter;

/// Everything a connection handler can reach. Constructed once at startup
/// and shared behind one `Arc`.
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: DeviceRegistry,
    pub tokens: TokenService,
    pub limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLog>,
    pub sessions: SessionManager,
    pub streams: StreamRouter,
    pub commands: CommandRouter,
    pub connections: DashMap<ConnId, mpsc::Sender<Message>>,
    pub metrics: RelayMetrics,
}

pub struct RelayServer {
    state: Arc<RelayState>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Build the server. Fails fast on a missing signing secret, an
    /// unopenable registry, or an unwritable audit log.
    pub async fn new(config: RelayConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let registry = DeviceRegistry::open(&config.registry_path)
            .with_context(|| format!("opening device registry {:?}", config.registry_path))?;

        let tokens = TokenService::new(&config.token_secret, config.token_expiry_hours)
            .context("creating token service")?;

        let file_sink = FileSink::new(&config.audit_log_path);
        file_sink
            .probe()
            .await
            .with_context(|| format!("audit log {:?} is not writable", config.audit_log_path))?;
        let mut audit = AuditLog::new();
        audit.add_sink(Arc::new(file_sink));
        let audit = Arc::new(audit);

        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let commands = CommandRouter::new(limiter.clone(), audit.clone());
        let metrics = RelayMetrics::new()?;

        let state = Arc::new(RelayState {
            sessions: SessionManager::new(config.max_sessions),
            streams: StreamRouter::new(config.max_frame_queue),
            registry,
            tokens,
            limiter,
            audit,
            commands,
            connections: DashMap::new(),
            metrics,
            config,
        });
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self { state, shutdown_tx })
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Build the HTTP router. Exposed so tests can serve it on an
    /// ephemeral port.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(get_health))
            .route("/metrics", get(get_metrics))
            .route("/api/devices/register", post(post_register))
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }

    /// Run until SIGINT/SIGTERM or an explicit `shutdown()`.
    pub async fn run(&self) -> anyhow::Result<()> {
        tokio::spawn(sweeper_task(
            self.state.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.state.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.state.config.listen_addr))?;
        info!("arcs-relay listening on {}", listener.local_addr()?);
        if self.state.config.tls_cert_path.is_some() {
            // TLS normally terminates at a proxy in front of the relay.
            warn!("TLS paths configured; terminate TLS at a proxy, the relay serves plain HTTP");
        }

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(
            self.shutdown_tx.subscribe(),
            self.state.clone(),
        ))
        .await?;

        info!("arcs-relay stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// GET /health
async fn get_health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

/// GET /metrics
async fn get_metrics(State(state): State<Arc<RelayState>>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    device_id: String,
    device_secret: String,
    #[serde(default)]
    device_model: String,
}

/// POST /api/devices/register
async fn post_register(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.device_id.is_empty() || req.device_secret.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "device_id and device_secret are required"})),
        )
            .into_response();
    }

    match state
        .registry
        .register(&req.device_id, &req.device_secret, &req.device_model)
        .await
    {
        Ok(true) => {
            // A provisioning token; the session-scoped token arrives with
            // the first auth_request.
            match state
                .tokens
                .issue(&req.device_id, "", vec!["register".to_string()])
            {
                Ok(issued) => Json(json!({
                    "success": true,
                    "deviceId": req.device_id,
                    "token": issued.token,
                }))
                .into_response(),
                Err(e) => {
                    tracing::error!("token mint failed during registration: {e}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"success": false, "error": "internal error"})),
                    )
                        .into_response()
                }
            }
        }
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"success": false, "error": "device already registered"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("registry failure: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": "internal error"})),
            )
                .into_response()
        }
    }
}

/// GET /ws — the relay's WebSocket endpoint, subprotocol `arcs-v1`.
///
/// A `Bearer` token on the upgrade is accepted as the controller's session
/// token for a later `join_session`.
async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Per-IP upgrade guard, ahead of any protocol work.
    if !state
        .limiter
        .allow(&format!("ip:{}", addr.ip()), Operation::Connect)
    {
        state.metrics.rate_limit_hits.inc();
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    ws.protocols(["arcs-v1"])
        .on_upgrade(move |socket| connection::handle_socket(socket, state, bearer))
}

/// One sweep pass: expire idle sessions, close their legs with 1001, and
/// release their resources. Returns the number of sessions removed.
pub async fn sweep_idle_sessions(state: &Arc<RelayState>) -> usize {
    let swept = state.sessions.sweep(state.config.idle_session_timeout());
    let count = swept.len();
    for session in swept {
        info!(session = %session.id, "expiring idle session");
        for controller in &session.controllers {
            close_peer(state, controller, close_code::AWAY, "session idle timeout").await;
        }
        if let Some(device_conn) = session.device_conn.as_deref() {
            close_peer(state, device_conn, close_code::AWAY, "session idle timeout").await;
        }
        state.streams.unregister_device(&session.id);
        state.limiter.reset(&session.id);
        state
            .audit
            .session_end(&session.id, "idle_timeout", session.age().as_secs())
            .await;
    }
    state.metrics.active_sessions.set(state.sessions.count() as f64);
    count
}

/// Periodically expire idle sessions.
async fn sweeper_task(state: Arc<RelayState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep_idle_sessions(&state).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Resolves when the server should stop; closes live sockets with 1001 so
/// the graceful drain can finish.
async fn shutdown_signal(mut shutdown: watch::Receiver<bool>, state: Arc<RelayState>) {
    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).ok()
    };

    tokio::select! {
        _ = async {
            #[cfg(unix)]
            {
                if let Some(ref mut sigterm) = sigterm {
                    sigterm.recv().await;
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM, starting graceful shutdown");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, starting graceful shutdown");
        }
        _ = shutdown.changed() => {
            if *shutdown.borrow() {
                info!("shutdown requested");
            }
        }
    }

    let peers: Vec<_> = state
        .connections
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    info!("closing {} live connections", peers.len());
    for tx in peers {
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            })))
            .await;
    }
}
