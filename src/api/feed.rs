use std::sync::Arc;

use axum::{debug_handler, extract::{Query, State, WebSocketUpgrade, ws::Message}, response::IntoResponse};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::api::chat;
use crate::coordinator::Coordinator;
use crate::presentation::FeedPresenter;

#[derive(Deserialize)]
pub struct FeedQuery {
    player: Option<Uuid>,
}

/// Streams rendered posts. A connection that names a player may also chat as
/// that player; its toggle is forgotten when it disconnects.
#[debug_handler(state = crate::AppState)]
pub async fn feed_ws(
    State(coordinator): State<Arc<Coordinator>>,
    State(presenter): State<Arc<FeedPresenter>>,
    Query(FeedQuery { player }): Query<FeedQuery>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |stream| {
        let mut rx = presenter.subscribe();
        let (mut sender, mut receiver) = stream.split();

        let mut broadcast_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(html) => {
                        if sender.send(Message::text(html)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "feed subscriber lagging, skipped posts");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        loop {
            tokio::select! {
                _ = &mut broadcast_task => break,
                msg = receiver.next() => {
                    let Some(Ok(msg)) = msg else {
                        break;
                    };
                    let Some(player_id) = player else {
                        continue;
                    };
                    let Ok(query) = serde_json::from_slice(&msg.into_data()) else {
                        continue;
                    };
                    if let Err(err) = chat::send_chat(&coordinator, &presenter, player_id, query).await {
                        tracing::warn!(%player_id, "could not send chat from feed: {:#}", err.0);
                    }
                }
            }
        }

        broadcast_task.abort();
        if let Some(player_id) = player {
            presenter.toggles().forget(player_id);
        }
    })
}
