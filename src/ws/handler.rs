use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};

use crate::state::AppState;
use crate::ws::session;

/// GET /ws
/// WebSocket upgrade endpoint. Authentication happens in-band: the peer's
/// first frame must be a `connect` frame carrying a bearer credential, and
/// a failed handshake drops the connection without any response frame.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session::run_session(socket, state))
}
