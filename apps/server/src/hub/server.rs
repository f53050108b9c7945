//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::time;

use parlor_common::id::{prefix, prefixed_ulid};

use crate::auth::{origin_allowed, Identity};
use crate::error::CLOSE_SERVER_ERROR;
use crate::AppState;

use super::registry::{ConnectionHandle, OUTBOUND_QUEUE_FRAMES};
use super::session::Session;

/// Time allowed for the authenticator callback during upgrade.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// Gate the upgrade at the HTTP layer: disallowed origins get 403, failed or
/// slow authentication gets 401. No chat-protocol frames are exchanged on
/// either path.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&headers, &state.hub.config.origin_allow_list) {
        tracing::debug!("upgrade rejected: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    let identity = match time::timeout(AUTH_TIMEOUT, state.auth.authenticate(&headers)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(_)) => {
            tracing::debug!("upgrade rejected: authentication failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(_timeout) => {
            tracing::debug!("upgrade rejected: authenticator timed out");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
}

async fn handle_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let conn_id = prefixed_ulid(prefix::CONNECTION);
    let (handle, mut frames_rx, mut control_rx) = ConnectionHandle::channel(
        conn_id,
        identity.user_id.clone(),
        OUTBOUND_QUEUE_FRAMES,
    );

    let mut session = match Session::establish(&state.hub, identity, handle).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(error = %err, "connection setup failed");
            let _ = send_close(&mut ws_tx, CLOSE_SERVER_ERROR, "internal error").await;
            return;
        }
    };

    tracing::info!(
        conn_id = %session.conn_id,
        user_id = %session.user_id,
        "session established"
    );

    let close_reason = loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_frame(&state.hub, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Err(e)) => {
                        tracing::debug!(?e, conn_id = %session.conn_id, "ws read error");
                        break None;
                    }
                    _ => continue,
                }
            }

            // Outbound frame from the hub (fan-out, echoes, errors).
            frame = frames_rx.recv() => {
                match frame {
                    Some(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break None;
                        }
                    }
                    None => break None,
                }
            }

            // Server-initiated teardown: supersession, backpressure, fatal.
            reason = control_rx.recv() => break reason,
        }
    };

    if let Some(reason) = close_reason {
        // Flush already-queued frames (the superseded `error` frame in
        // particular) before the close frame.
        while let Ok(json) = frames_rx.try_recv() {
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = send_close(&mut ws_tx, reason.code(), reason.message()).await;
    }

    session.close_cleanup(&state.hub);

    tracing::info!(
        conn_id = %session.conn_id,
        user_id = %session.user_id,
        reason = ?close_reason,
        "session ended"
    );
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
