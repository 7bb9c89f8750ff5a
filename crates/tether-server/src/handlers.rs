//! Connection handlers for the Tether server.
//!
//! This module handles the WebSocket lifecycle: authentication, the
//! single writer task that owns the socket sink, and the receive loop
//! that dispatches inbound frames to the gateway.

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tether_core::{reason, DeliveryOutcome, Gateway, SessionCommand, SessionHandle, SessionMeta};
use tether_protocol::{frames, Frame, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use tether_store::{MemoryStore, RedisStore, Store};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Channel catalog updates are fanned out on.
const PRODUCT_CHANNEL: &str = "product_updates";

/// Shared server state.
pub struct AppState {
    /// The realtime gateway.
    pub gateway: Arc<Gateway>,
    /// Token verification.
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store is unreachable or the server fails to
/// start.
pub async fn run_server(config: Config) -> Result<()> {
    let store: Arc<dyn Store> = if config.store.in_memory {
        warn!("Using in-memory store; cross-process delivery is disabled");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.store.redis_url).await?)
    };

    let gateway = Gateway::new(store, config.gateway_config());
    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(crate::auth::JwtVerifier::new(config.auth.jwt_secret.as_bytes()));
    let state = Arc::new(AppState {
        gateway: gateway.clone(),
        verifier,
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/ws/:token", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Tether server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws/:token", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway))
        .await?;

    Ok(())
}

async fn shutdown_signal(gateway: Arc<Gateway>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
    gateway.shutdown().await;
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, token))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, token: String) {
    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Rejected connection with bad token");
            metrics::record_error("auth");
            reject(socket, "authentication failed").await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut commands) = SessionHandle::channel(SessionMeta::new(&identity));
    let session_id = handle.meta().session_id;

    debug!(identity = %identity, session = %session_id, "WebSocket connected");

    // Exactly one task owns the sink: probes, drained backlog, and
    // relayed messages all funnel through the session's command channel
    // and can never interleave on the socket.
    let writer = tokio::spawn(async move {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                SessionCommand::Send(value) => {
                    let text = value.to_string();
                    metrics::record_message(text.len(), "outbound");
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                SessionCommand::Close { reason } => {
                    // Every server-initiated close (supersede, ping
                    // timeout, stale sweep, shutdown) carries its reason
                    // through this command.
                    metrics::record_disconnect_reason(&reason);
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let drained = state.gateway.attach_session(handle.clone()).await;
    metrics::record_drained(drained);

    let mut graceful = false;
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                metrics::record_message(text.len(), "inbound");
                handle.meta().touch();

                match frames::parse(&text) {
                    Ok(frame) => {
                        if let Err(e) = handle_frame(frame, &identity, &state, &handle).await {
                            error!(identity = %identity, error = %e, "Frame handling error");
                            metrics::record_error("frame");
                        }
                    }
                    Err(e) => {
                        // Unknown or malformed frames are logged and
                        // ignored; the connection stays up.
                        warn!(identity = %identity, error = %e, "Ignoring malformed frame");
                        metrics::record_error("malformed");
                    }
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Transport-level liveness; the stack answers pings for us.
                handle.meta().touch();
            }
            Ok(Message::Binary(_)) => {
                warn!(identity = %identity, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => {
                debug!(identity = %identity, "Received close frame");
                graceful = true;
                break;
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    // Only tear down if we are still the registered session; a superseding
    // connection owns the identity's entry now.
    let still_current = state
        .gateway
        .registry()
        .lookup(&identity)
        .is_some_and(|current| current.meta().session_id == session_id);

    if still_current {
        state
            .gateway
            .detach_session(&identity, reason::CLIENT_DISCONNECT)
            .await;
        metrics::record_disconnect_reason(reason::CLIENT_DISCONNECT);
        if !graceful {
            let wait = state.gateway.record_connect_failure(&identity).await;
            debug!(identity = %identity, wait_secs = wait.as_secs_f64(), "Recorded ungraceful drop");
        }
    }

    drop(handle);
    let _ = writer.await;
    debug!(identity = %identity, session = %session_id, "WebSocket disconnected");
}

/// Send one error frame and a policy-violation close to an unauthorized
/// socket.
async fn reject(mut socket: WebSocket, message: &str) {
    if let Ok(text) = frames::render(&Frame::error(message)) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: Cow::Owned(message.to_string()),
        })))
        .await;
}

/// Dispatch one inbound frame.
async fn handle_frame(
    frame: Frame,
    identity: &str,
    state: &Arc<AppState>,
    handle: &SessionHandle,
) -> Result<()> {
    match frame {
        Frame::ChatMessage { mut data } => {
            // The server stamps the sender; clients cannot spoof it.
            data.sender_id = Some(identity.to_string());
            let recipient = data.recipient_id.clone();
            let payload = Frame::ChatMessage { data }.to_value()?;

            let outcome = state.gateway.deliver(&recipient, payload).await;
            record_outcome(outcome);
            debug!(from = %identity, to = %recipient, ?outcome, "Relayed chat message");
        }

        Frame::Offer { mut data } => {
            data.buyer_id = Some(identity.to_string());
            let seller = data.seller_id.clone();
            let payload = Frame::Offer { data }.to_value()?;

            let outcome = state.gateway.deliver(&seller, payload).await;
            record_outcome(outcome);
            debug!(from = %identity, to = %seller, ?outcome, "Relayed offer");
        }

        Frame::ProductUpdate { data } => {
            let payload = Frame::ProductUpdate { data }.to_value()?;
            state
                .gateway
                .broadcast_to_channel(PRODUCT_CHANNEL, &payload)
                .await;
        }

        Frame::HeartbeatResponse { .. } => {
            handle.meta().record_ack();
        }

        // Server-emitted types echoed back by a confused client.
        other => {
            debug!(identity = %identity, frame = ?other, "Ignoring unexpected frame type");
        }
    }

    Ok(())
}

fn record_outcome(outcome: DeliveryOutcome) {
    let label = match outcome {
        DeliveryOutcome::Direct => "direct",
        DeliveryOutcome::Queued => "queued",
        DeliveryOutcome::Failed => "failed",
    };
    metrics::record_delivery(label);
}
