mod chat;
mod feed;

use axum::{routing::{delete, get, post, put}, Router};
use tower_http::cors::CorsLayer;

use crate::{res, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(res::console))
        .route("/help", get(res::help))

        .route("/chat", post(chat::send))
        .route("/toggle", post(chat::toggle))
        .route("/toggle/{player}", delete(chat::untoggle))
        .route("/levels", get(chat::levels))
        .route("/levels/{level}", put(chat::set_level))
        .route("/players/{player}/posts", get(chat::history))
        .route("/stats", get(chat::stats))
        .route("/feed", get(feed::feed_ws))

        .with_state(state)
        .layer(CorsLayer::permissive())
}
