//! Collab Sync Server - real-time collaborative document synchronization
//!
//! A synchronization service using:
//! - Automerge CRDTs for conflict-free document replicas
//! - Sled embedded database for durable snapshots
//! - Axum with WebSocket for bidirectional client connections
//! - Binary protocol for efficient sync message transfer

use anyhow::Context;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{borrow::Cow, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod config;
mod metrics;
mod storage;
mod sync;

use config::{ServerConfig, StorageBackend};
use storage::{DocumentStore, MemoryStore, SledStore};
use sync::{
    admission::RateLimitAdmission,
    protocol::{ServerMessage, SyncProtocol, MAX_MESSAGE_SIZE, PROTOCOL_VERSION},
    server::ServerStats,
    SyncError, SyncServer, CLOSE_GOING_AWAY,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// CRDT synchronization server
    sync_server: Arc<SyncServer>,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol_version: u8,
    #[serde(flatten)]
    stats: ServerStats,
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.sync_server.is_closing() {
        "draining"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: PROTOCOL_VERSION,
        stats: state.sync_server.stats(),
    })
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler. The key arrives URL-decoded.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(raw_key): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("WebSocket upgrade request from {} for {:?}", addr, raw_key);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, raw_key, addr, state))
}

/// Drive one connection: attach, pump frames both ways, detach.
async fn handle_websocket(socket: WebSocket, raw_key: String, addr: SocketAddr, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    // Subscribe before attaching so a shutdown racing the attach is not missed.
    let mut shutdown = state.sync_server.shutdown_receiver();

    let session = match state.sync_server.connect(addr.ip(), &raw_key, tx.clone()).await {
        Ok(session) => session,
        Err(e) => {
            close_with_error(&mut ws_sender, &e).await;
            return;
        }
    };

    info!(
        "New WebSocket connection: conn={}, key={}, addr={}",
        session.connection_id(),
        session.key(),
        addr
    );

    let failure = loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if let Err(e) = send_server_message(&mut ws_sender, &msg).await {
                    debug!("Send to {} failed: {}", session.connection_id(), e);
                    break None;
                }
            }
            incoming = ws_receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("Transport error on {}: {}", session.connection_id(), e);
                        break None;
                    }
                    None => break None,
                };

                let decoded = match msg {
                    Message::Binary(data) => SyncProtocol::decode_client(&data),
                    // JSON for compatibility/debugging
                    Message::Text(text) => SyncProtocol::decode_client_json(&text),
                    Message::Close(_) => {
                        info!("WebSocket closed by client: {}", session.connection_id());
                        break None;
                    }
                    // Pong is handled automatically
                    _ => continue,
                };

                let handled = decoded
                    .map_err(SyncError::from)
                    .and_then(|msg| state.sync_server.handle_message(&session, msg, &tx));
                match handled {
                    Ok(true) => {}
                    Ok(false) => break None,
                    Err(e) => break Some(e),
                }
            }
            _ = shutdown.recv() => {
                let goodbye = ServerMessage::Goodbye {
                    reason: Some("server shutting down".to_string()),
                };
                let _ = send_server_message(&mut ws_sender, &goodbye).await;
                close(&mut ws_sender, CLOSE_GOING_AWAY, "server shutting down").await;
                break None;
            }
        }
    };

    if let Some(e) = failure {
        warn!("Closing {} on {}: {}", session.connection_id(), session.key(), e);
        close_with_error(&mut ws_sender, &e).await;
    }

    state.sync_server.disconnect(&session);
    info!("Connection {} disconnected from {}", session.connection_id(), session.key());
}

/// Send a server message over WebSocket
async fn send_server_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = SyncProtocol::encode_server(msg)?;
    sender.send(Message::Binary(bytes.to_vec())).await?;
    Ok(())
}

/// Report `err` in an `Error` frame, then close with its status code.
async fn close_with_error(sender: &mut SplitSink<WebSocket, Message>, err: &SyncError) {
    let message = SyncProtocol::error_response(err.error_code(), err.to_string());
    let _ = send_server_message(sender, &message).await;
    close(sender, err.close_code(), &err.to_string()).await;
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

/// Close reasons are limited to 123 bytes by the WebSocket framing.
fn truncate_reason(reason: &str) -> &str {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason;
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/*key", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Resolves on Ctrl-C or SIGTERM, after telling live connections to leave.
async fn shutdown_signal(sync_server: Arc<SyncServer>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    sync_server.begin_shutdown();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let store: Arc<dyn DocumentStore> = match config.storage_backend {
        StorageBackend::Sled => {
            info!("Initializing storage at: {}", config.storage.path);
            let store = SledStore::open(config.storage.clone()).context("Failed to open storage")?;
            info!("Storage initialized with {} documents", store.document_count());
            Arc::new(store)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; documents will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let admission = Arc::new(RateLimitAdmission::new(config.admission));
    let sync_server = Arc::new(SyncServer::new(store, admission, config.sync.clone()));

    // Start background tasks
    let background = sync_server.start_background_tasks();

    let app = build_router(Arc::new(AppState {
        sync_server: sync_server.clone(),
    }));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Collab sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/<sessionId>:<filePath>", addr);
    info!("   Health check: http://{}/health", addr);
    info!(
        "   Debounce {:?}, inactivity {:?}, sweep every {:?}",
        config.sync.persist_debounce,
        config.sync.sweeper.inactivity_timeout,
        config.sync.sweeper.interval
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(sync_server.clone()))
        .await
        .context("Server error")?;

    let report = sync_server.shutdown().await;
    background.wait().await;

    if report.timed_out || report.failed > 0 {
        warn!("Exiting with {} documents not written", report.failed);
    }
    info!("Shutdown complete");
    Ok(())
}
