pub mod kv;
pub mod sql;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::StorageKind;
use crate::error::StorageError;
use crate::model::{ChatPost, Level, PostResult, RawPost, ServerIdentity, ServerRecord, is_valid_level};

pub use kv::RedisStorage;
pub use sql::{SqlFlavor, SqlStorage};

const LEVEL_REFRESH: Duration = Duration::from_secs(5 * 60);

/// A durable store of posts, levels, servers and players.
///
/// `post` is the originating write and assigns identity. Every `*_raw` write
/// carries identity assigned elsewhere and is idempotent.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    /// Hooks this backend up to whoever wants to hear about minted players.
    fn attach(&self, handler: Weak<dyn StorageHandler>);

    /// This server's own row in this backend.
    async fn server(&self) -> ServerRecord;

    async fn post(&self, player_id: Uuid, level: u8, message: &str) -> Result<PostResult, StorageError>;

    async fn post_raw(&self, post: &RawPost) -> Result<(), StorageError>;

    async fn set_level_raw(&self, level: u8, name: &str) -> Result<(), StorageError>;

    async fn set_server_raw(&self, long_server_id: i64, server_id: Uuid, name: &str) -> Result<(), StorageError>;

    async fn set_player_raw(&self, long_player_id: i64, player_id: Uuid) -> Result<(), StorageError>;

    async fn set_level(&self, level: u8, name: &str) -> Result<(), StorageError> {
        if !is_valid_level(level) {
            return Err(StorageError::invalid(format!("level {level} is out of range")));
        }
        if name.trim().is_empty() {
            return Err(StorageError::invalid("level name cannot be empty"));
        }
        self.set_level_raw(level, name).await
    }

    /// Renames this server in this backend.
    async fn set_server_name(&self, name: &str) -> Result<(), StorageError>;

    /// Posts written here by other servers since the last call, ordered by id.
    async fn get_queue(&self) -> Result<Vec<ChatPost>, StorageError>;

    async fn get_levels(&self) -> Result<Vec<Level>, StorageError>;

    /// A player's posts from the last `days` days, oldest first.
    async fn get_by_player(&self, player_id: Uuid, days: u32) -> Result<Vec<ChatPost>, StorageError>;

    /// Resolves the player's surrogate, minting one on first sight.
    async fn get_long_player_id(&self, player_id: Uuid) -> Result<i64, StorageError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Receives surrogate creation events from a storage backend.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    async fn on_player_created(&self, player_id: Uuid, long_player_id: i64, origin: &str);
}

/// Late-bound link from a backend back to its handler.
#[derive(Default)]
pub(crate) struct CreationHook(OnceLock<Weak<dyn StorageHandler>>);

impl CreationHook {
    pub(crate) fn set(&self, handler: Weak<dyn StorageHandler>) {
        if self.0.set(handler).is_err() {
            tracing::warn!("storage handler already attached, ignoring");
        }
    }

    pub(crate) async fn player_created(&self, player_id: Uuid, long_player_id: i64, origin: &str) {
        let Some(handler) = self.0.get().and_then(Weak::upgrade) else {
            tracing::debug!(storage = %origin, %player_id, "no handler attached for new player");
            return;
        };
        handler.on_player_created(player_id, long_player_id, origin).await;
    }
}

/// Connection pool limits shared by every storage engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolSettings {
    pub min_idle: u32,
    pub max_pool_size: u32,
    pub max_lifetime_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_pool_size: 4,
            max_lifetime_ms: 30 * 60 * 1000,
            timeout_ms: 5000,
        }
    }
}

impl PoolSettings {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Levels change rarely and are read on every post.
pub(crate) struct LevelCache {
    entry: RwLock<Option<(Instant, Vec<Level>)>>,
}

impl LevelCache {
    pub(crate) fn new() -> Self {
        Self { entry: RwLock::new(None) }
    }

    pub(crate) async fn fresh(&self) -> Option<Vec<Level>> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|(fetched, _)| fetched.elapsed() < LEVEL_REFRESH)
            .map(|(_, levels)| levels.clone())
    }

    pub(crate) async fn store(&self, levels: Vec<Level>) {
        *self.entry.write().await = Some((Instant::now(), levels));
    }

    /// Applies a write without resetting the refresh clock.
    pub(crate) async fn upsert(&self, level: u8, name: &str) {
        let mut entry = self.entry.write().await;
        let Some((_, levels)) = entry.as_mut() else {
            return;
        };
        match levels.iter_mut().find(|l| l.level == level) {
            Some(existing) => existing.name = name.to_owned(),
            None => {
                levels.push(Level { level, name: name.to_owned() });
                levels.sort_by_key(|l| l.level);
            }
        }
    }
}

/// Builds one configured storage engine and seeds this server's row in it.
pub async fn connect(
    name: &str,
    kind: &StorageKind,
    settings: &PoolSettings,
    identity: &ServerIdentity,
) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match kind {
        StorageKind::Mysql { url, prefix } => {
            Arc::new(SqlStorage::connect(name, SqlFlavor::MySql, url, prefix, settings, identity).await?)
        }
        StorageKind::Sqlite { file, prefix } => {
            let url = format!("sqlite://{}?mode=rwc", file.display());
            Arc::new(SqlStorage::connect(name, SqlFlavor::Sqlite, &url, prefix, settings, identity).await?)
        }
        StorageKind::Redis { url, prefix } => {
            Arc::new(RedisStorage::connect(name, url, prefix, settings, identity).await?)
        }
    };
    tracing::info!(storage = %name, "storage engine ready");
    Ok(storage)
}
