use std::sync::Arc;

use axum::{debug_handler, extract::{Path, Query, State}, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::model::{is_valid_level, ChatPost, Level, CONSOLE_ID, DEFAULT_LEVEL};
use crate::presentation::FeedPresenter;
use crate::{AppResult, BadRequest};

const DEFAULT_HISTORY_DAYS: u32 = 7;

#[derive(Deserialize)]
pub struct SendChatQuery {
    player: Option<Uuid>,
    level: Option<u8>,
    message: String,
}

#[derive(Deserialize)]
pub struct ToggleQuery {
    player: Uuid,
    level: Option<u8>,
}

#[derive(Deserialize)]
pub struct LevelQuery {
    name: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    days: Option<u32>,
}

#[derive(Serialize)]
pub struct Stats {
    server_id: Uuid,
    server_name: String,
    sent: u64,
    received: u64,
    toggled: usize,
    storage: Vec<String>,
    messaging: Vec<String>,
}

pub(crate) fn check_level(level: u8) -> Result<u8, BadRequest> {
    if is_valid_level(level) {
        Ok(level)
    } else {
        Err(BadRequest(format!("level {level} is out of range")))
    }
}

/// Level a player's chat goes to when they don't name one.
pub(crate) fn effective_level(presenter: &FeedPresenter, player_id: Uuid, level: Option<u8>) -> u8 {
    level.or_else(|| presenter.toggles().get(player_id)).unwrap_or(DEFAULT_LEVEL)
}

pub(crate) async fn send_chat(
    coordinator: &Coordinator,
    presenter: &FeedPresenter,
    player_id: Uuid,
    SendChatQuery { level, message, .. }: SendChatQuery,
) -> AppResult<ChatPost> {
    if message.trim().is_empty() {
        return Err(BadRequest("message cannot be empty".to_owned()).into());
    }
    let level = check_level(effective_level(presenter, player_id, level))?;
    Ok(coordinator.send_chat(player_id, level, &message).await?)
}

#[debug_handler(state = crate::AppState)]
pub async fn send(
    State(coordinator): State<Arc<Coordinator>>,
    State(presenter): State<Arc<FeedPresenter>>,
    Json(query): Json<SendChatQuery>,
) -> AppResult<(StatusCode, Json<ChatPost>)> {
    let player_id = query.player.unwrap_or(CONSOLE_ID);
    let post = send_chat(&coordinator, &presenter, player_id, query).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

#[debug_handler(state = crate::AppState)]
pub async fn toggle(
    State(coordinator): State<Arc<Coordinator>>,
    Json(ToggleQuery { player, level }): Json<ToggleQuery>,
) -> AppResult<StatusCode> {
    let level = level.map(check_level).transpose()?;
    coordinator.toggle_chat(player, level).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn untoggle(
    State(coordinator): State<Arc<Coordinator>>,
    Path(player): Path<Uuid>,
) -> AppResult<StatusCode> {
    coordinator.toggle_chat(player, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn levels(State(coordinator): State<Arc<Coordinator>>) -> AppResult<Json<Vec<Level>>> {
    Ok(Json(coordinator.get_levels().await?))
}

#[debug_handler(state = crate::AppState)]
pub async fn set_level(
    State(coordinator): State<Arc<Coordinator>>,
    Path(level): Path<u8>,
    Json(LevelQuery { name }): Json<LevelQuery>,
) -> AppResult<StatusCode> {
    let level = check_level(level)?;
    if name.trim().is_empty() {
        return Err(BadRequest("level name cannot be empty".to_owned()).into());
    }
    coordinator.set_level(level, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn history(
    State(coordinator): State<Arc<Coordinator>>,
    Path(player): Path<Uuid>,
    Query(HistoryQuery { days }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<ChatPost>>> {
    let days = days.unwrap_or(DEFAULT_HISTORY_DAYS);
    Ok(Json(coordinator.get_by_player(player, days).await?))
}

#[debug_handler(state = crate::AppState)]
pub async fn stats(
    State(coordinator): State<Arc<Coordinator>>,
    State(presenter): State<Arc<FeedPresenter>>,
) -> Json<Stats> {
    let identity = coordinator.identity();
    Json(Stats {
        server_id: identity.id,
        server_name: identity.name.clone(),
        sent: coordinator.sent(),
        received: coordinator.received(),
        toggled: presenter.toggles().len(),
        storage: coordinator.storages().iter().map(|storage| storage.name().to_owned()).collect(),
        messaging: coordinator.messaging().iter().map(|messaging| messaging.name().to_owned()).collect(),
    })
}
