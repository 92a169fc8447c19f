// =============================================================================
// WebSocket Handler — Event Bus sink
// =============================================================================
//
// Clients connect to `/ws` and simply receive every event broadcast on the
// Event Bus, JSON-encoded, as it happens — there is no snapshot-on-connect
// and no polling; the bus itself already owns the fan-out, this handler just
// drains one subscription into one socket. Ping/Pong and Close frames from
// the client are handled so a dead peer is detected and the subscription
// torn down promptly; any other inbound frame is ignored (clients have
// nothing to say to this socket).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade handler. When `auth.enabled`, the optional `?token=` query param
/// doubles as bearer auth for browser clients that cannot set headers.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let presented = query.token.unwrap_or_default();
    if !validate_token(&state, &presented) {
        warn!("websocket connection rejected: invalid or missing token");
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    }

    info!("websocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.bus.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else {
                    // Event Bus itself was dropped; nothing more to forward.
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if let Err(e) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %e, "websocket send failed, disconnecting");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to serialise event for websocket");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error, disconnecting");
                        break;
                    }
                    None => {
                        info!("websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!("websocket connection closed");
}
