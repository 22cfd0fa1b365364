//! WebSocket chat server
//!
//! Axum server exposing the bidirectional streaming protocol at /ws/chat
//! and a health probe at /api/v1/health. Each connection owns an outbound
//! event channel; inbound frames are validated, then dispatched to the
//! router, the confirmation table, or the cancel token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{valid_session_id, ClientMessage, ProgressEvent, MAX_MESSAGE_LEN};
use crate::router::AgentRouter;
use crate::session::SESSION_MAX_AGE_SECS;

/// How often idle sessions are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct AppState {
    router: Arc<AgentRouter>,
}

/// The chat server.
pub struct ChatServer {
    router: Arc<AgentRouter>,
    addr: SocketAddr,
}

impl ChatServer {
    pub fn new(router: Arc<AgentRouter>, addr: SocketAddr) -> Self {
        Self { router, addr }
    }

    pub async fn run(self) -> Result<()> {
        let state = AppState {
            router: self.router.clone(),
        };

        // Background sweep of idle sessions
        let sessions = self.router.sessions().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                sessions.cleanup(SESSION_MAX_AGE_SECS);
            }
        });

        let app = Router::new()
            .route("/api/v1/health", get(health))
            .route("/ws/chat", get(ws_upgrade))
            .layer(tower_http::cors::CorsLayer::permissive())
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("binding {}", self.addr))?;
        info!(addr = %self.addr, "chat server listening");

        axum::serve(listener, app)
            .await
            .context("serving chat endpoint")?;
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.router.sessions().active_count(),
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut inbound) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ProgressEvent>(64);

    // Serialize outbound events onto the socket
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "unserializable event dropped");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(state.router.clone(), out_tx);

    while let Some(frame) = inbound.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "websocket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if !connection.handle_text(text.as_str()).await {
                    break;
                }
            }
            Message::Close(_) => break,
            // Binary and control frames are ignored
            _ => {}
        }
    }

    connection.cancel_active();
    writer.abort();
    debug!("websocket connection closed");
}

/// Per-connection dispatch state.
struct Connection {
    router: Arc<AgentRouter>,
    out_tx: mpsc::Sender<ProgressEvent>,
    /// Cancel token of the message currently streaming, if any
    active_cancel: Option<CancellationToken>,
}

impl Connection {
    fn new(router: Arc<AgentRouter>, out_tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            router,
            out_tx,
            active_cancel: None,
        }
    }

    fn cancel_active(&mut self) {
        if let Some(token) = self.active_cancel.take() {
            token.cancel();
        }
    }

    /// Dispatch one inbound text frame. Returns false to close.
    async fn handle_text(&mut self, raw: &str) -> bool {
        let parsed: ClientMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                let _ = self
                    .out_tx
                    .send(ProgressEvent::error(
                        "invalid_message",
                        format!("unparseable frame: {}", e),
                    ))
                    .await;
                return true;
            }
        };

        match parsed {
            ClientMessage::Message { content, session_id } => {
                self.handle_message(content, session_id).await
            }
            ClientMessage::ConfirmResponse {
                request_id,
                approved,
                confirm_text,
            } => {
                // Unknown or already-resolved ids are a no-op
                self.router
                    .confirmations()
                    .resolve(&request_id, approved, confirm_text.as_deref());
                true
            }
            ClientMessage::Cancel => {
                self.cancel_active();
                true
            }
            ClientMessage::Ping => {
                let _ = self.out_tx.send(ProgressEvent::Pong).await;
                true
            }
        }
    }

    async fn handle_message(&mut self, content: String, session_id: Option<String>) -> bool {
        if let Some(id) = &session_id {
            if !valid_session_id(id) {
                let _ = self
                    .out_tx
                    .send(ProgressEvent::error(
                        "invalid_session_id",
                        "session ids must match [A-Za-z0-9_-]{1,64}",
                    ))
                    .await;
                return true;
            }
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            let _ = self
                .out_tx
                .send(ProgressEvent::error(
                    "message_too_long",
                    format!("message exceeds {} characters", MAX_MESSAGE_LEN),
                ))
                .await;
            return true;
        }

        let cancel = CancellationToken::new();
        self.active_cancel = Some(cancel.clone());

        let mut stream = self.router.route(content, session_id, cancel);
        let out_tx = self.out_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        true
    }
}
