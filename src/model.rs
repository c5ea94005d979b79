use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Highest valid level id. Levels are stored as signed bytes by the SQL backends.
pub const MAX_LEVEL: u8 = 127;

/// Level every backend seeds on first connect.
pub const DEFAULT_LEVEL: u8 = 1;
pub const DEFAULT_LEVEL_NAME: &str = "ALL";

/// Player id used for posts made from a server console.
pub const CONSOLE_ID: Uuid = Uuid::nil();

pub fn is_valid_level(level: u8) -> bool {
    level <= MAX_LEVEL
}

/// A finalized chat post as handed to the presentation layer.
///
/// Identity across servers is `key()`, never equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPost {
    pub id: i64,
    pub server_id: Uuid,
    pub server_name: String,
    pub player_id: Uuid,
    pub level: u8,
    pub level_name: String,
    pub message: String,
    /// Milliseconds since the unix epoch, assigned by the originating backend.
    pub date: i64,
}

impl ChatPost {
    pub fn key(&self) -> PostKey {
        PostKey { id: self.id, server_id: self.server_id }
    }
}

/// Dedup key for posts. Ids are only unique per backend sequence, so the
/// origin server is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostKey {
    pub id: i64,
    pub server_id: Uuid,
}

/// What an originating `Storage::post` hands back.
#[derive(Debug, Clone)]
pub struct PostResult {
    pub id: i64,
    pub long_server_id: i64,
    pub server_id: Uuid,
    pub server_name: String,
    pub long_player_id: i64,
    pub player_id: Uuid,
    pub level: u8,
    pub level_name: String,
    pub message: String,
    pub date: i64,
}

impl PostResult {
    pub fn to_chat_post(&self) -> ChatPost {
        ChatPost {
            id: self.id,
            server_id: self.server_id,
            server_name: self.server_name.clone(),
            player_id: self.player_id,
            level: self.level,
            level_name: self.level_name.clone(),
            message: self.message.clone(),
            date: self.date,
        }
    }

    pub fn to_raw(&self) -> RawPost {
        RawPost {
            id: self.id,
            long_server_id: self.long_server_id,
            server_id: self.server_id,
            server_name: self.server_name.clone(),
            long_player_id: self.long_player_id,
            player_id: self.player_id,
            level: self.level,
            level_name: self.level_name.clone(),
            message: self.message.clone(),
            date: self.date,
        }
    }
}

/// A post whose identity was assigned by another backend.
///
/// The surrogates are the originating backend's; receivers resolve their own
/// from the global ids.
#[derive(Debug, Clone)]
pub struct RawPost {
    pub id: i64,
    pub long_server_id: i64,
    pub server_id: Uuid,
    pub server_name: String,
    pub long_player_id: i64,
    pub player_id: Uuid,
    pub level: u8,
    /// Seeds the level on receivers that have not heard of it yet.
    pub level_name: String,
    pub message: String,
    pub date: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub level: u8,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub long_server_id: i64,
    pub server_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerRecord {
    pub long_player_id: i64,
    pub player_id: Uuid,
}

/// This process's identity, shared by all of its backends.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub id: Uuid,
    pub name: String,
}

pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
