pub mod events;
pub mod handlers;
pub mod ws;

use crate::state::AppState;
use axum::{routing::get, Router};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/hls/{file}", get(handlers::serve_hls))
        .route("/health", get(handlers::health))
        .with_state(state)
}
