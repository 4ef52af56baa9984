//! One client from upgrade to disconnect.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::{CLOSE_GOING_AWAY, CLOSE_HEARTBEAT_TIMEOUT, Session};
use super::handler::handle_message;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::protocol::{ServerMessage, ServiceType};
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_SESSION_DURATION_SECONDS};
use crate::server::AppState;

/// Normal closure, sent when the server ends a session the client already left.
const CLOSE_NORMAL: u16 = 1000;

/// Run a session for an upgraded socket.
///
/// 1. Registers the session, closing any earlier one for the same user
/// 2. Sends `connected`
/// 3. Handles client frames until the socket or the session ends
/// 4. Drains outbound frames and pings from a writer task
/// 5. Unregisters and releases subscriptions on the way out
#[instrument(skip_all, fields(user_id = %user_id, service_type = %service_type))]
pub async fn run_session(ws: WebSocket, user_id: String, service_type: ServiceType, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.config.send_queue_capacity.max(1));
    let session = Arc::new(Session::new(
        user_id.clone(),
        service_type,
        send_tx,
        state.shutdown.child_token(),
    ));

    if let Some(previous) = state.registry.register(session.clone()) {
        info!(previous = %previous.session.id, "superseded earlier session");
        state
            .bridge
            .release_session(&previous.session, previous.notifications, &previous.emptied_rooms)
            .await;
    }
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(session_id = %session.id, "session connected");
    let _ = session.send(&ServerMessage::connected(&user_id, service_type, session.id.as_str()));

    let writer_session = session.clone();
    let ping_every = state.config.heartbeat_interval();
    let writer = tokio::spawn(async move {
        let cancel = writer_session.cancel_token().clone();
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(String::clone(&frame).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = cancel.cancelled() => {
                    while let Ok(frame) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(String::clone(&frame).into())).await.is_err() {
                            break;
                        }
                    }
                    let close = writer_session.close_reason();
                    debug!(code = close.code, reason = %close.reason, "sending close frame");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close.code,
                            reason: close.reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let heartbeat_session = session.clone();
    let heartbeat = tokio::spawn({
        let interval = state.config.heartbeat_interval();
        let timeout = state.config.heartbeat_timeout();
        let cancel = session.cancel_token().clone();
        async move {
            if run_heartbeat(heartbeat_session.clone(), interval, timeout, cancel).await == HeartbeatResult::TimedOut {
                warn!(?timeout, "client silent, disconnecting");
                heartbeat_session.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
            }
        }
    });

    let cancel = session.cancel_token().clone();
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let Some(Ok(msg)) = frame else { break };
        session.mark_alive();

        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "ignored non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Some(reply) = handle_message(&text, &session, &state).await {
            if !session.send(&reply) {
                debug!("reply dropped, send queue full or closed");
            }
        }
    }

    // The first close reason wins, so supersede and heartbeat codes survive.
    if cancel.is_cancelled() {
        session.close(CLOSE_GOING_AWAY, "server shutting down");
    } else {
        session.close(CLOSE_NORMAL, "session ended");
    }
    if let Some(released) = state.registry.unregister(&session) {
        state
            .bridge
            .release_session(&session, released.notifications, &released.emptied_rooms)
            .await;
    }
    if tokio::time::timeout(std::time::Duration::from_secs(1), writer).await.is_err() {
        debug!("writer did not finish in time");
    }
    heartbeat.abort();

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_SESSION_DURATION_SECONDS).record(session.age().as_secs_f64());
    info!(
        session_id = %session.id,
        dropped = session.drop_count(),
        "session disconnected"
    );
}
