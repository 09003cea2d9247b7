use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;
use crate::web::events;

/// Frames queued per viewer before sends start failing
pub const OUTBOUND_BUFFER: usize = 100;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_connection(socket, addr.ip(), state))
}

/// Drive one viewer connection until the socket closes
pub async fn client_connection(socket: WebSocket, ip: IpAddr, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = state.registry.register(ip, outbound).await;
    if let Err(e) = events::on_connect(&state, &session).await {
        warn!("Failed to greet viewer {}: {}", session.id(), e);
    }

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                tokio::spawn(events::handle_frame(state.clone(), session.clone(), text.as_str().to_owned()));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection error for viewer {}: {}", session.id(), e);
                break;
            }
        }
    }

    if let Err(e) = events::on_disconnect(&state, &session).await {
        warn!("Failed to announce departure of {}: {}", session.id(), e);
    }
    writer.abort();
}
