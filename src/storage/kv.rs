use std::fmt::Display;
use std::sync::{LazyLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{AsyncCommands, Script};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{
    ChatPost, DEFAULT_LEVEL, DEFAULT_LEVEL_NAME, Level, MAX_LEVEL, PostResult, RawPost, ServerIdentity, ServerRecord,
    is_valid_level, now_millis,
};
use crate::storage::{CreationHook, LevelCache, PoolSettings, Storage, StorageHandler};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

// KEYS: post, id index, player history. ARGV: post body, history entry, id.
static STORE_POST: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('SETNX', KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[3])
        redis.call('RPUSH', KEYS[3], ARGV[2])
        return 1
        ",
    )
});

#[derive(Serialize, Deserialize)]
struct LevelValue {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct ServerByLong {
    id: Uuid,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct ServerByUuid {
    #[serde(rename = "longID")]
    long_id: i64,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct PlayerByLong {
    id: Uuid,
}

#[derive(Serialize, Deserialize)]
struct PlayerByUuid {
    #[serde(rename = "longID")]
    long_id: i64,
}

#[derive(Clone, Serialize, Deserialize)]
struct PostValue {
    /// Only present in the per-player lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(rename = "serverID")]
    server: i64,
    #[serde(rename = "playerID")]
    player: i64,
    level: u8,
    message: String,
    date: i64,
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::corrupt(key, e))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::corrupt(key, e))
}

/// Key-value storage on a single multiplexed Redis connection.
///
/// Servers and players are indexed both ways (`servers:{longID}` and
/// `servers:{uuid}`), so a mapping is claimed with one `MSETNX`.
pub struct RedisStorage {
    name: String,
    prefix: String,
    conn: ConnectionManager,
    server: RwLock<ServerRecord>,
    watermark: Mutex<i64>,
    players: DashMap<Uuid, i64>,
    levels: LevelCache,
    hook: CreationHook,
    closed: AtomicBool,
}

impl RedisStorage {
    pub async fn connect(
        name: &str,
        url: &str,
        prefix: &str,
        settings: &PoolSettings,
        identity: &ServerIdentity,
    ) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(settings.timeout())
            .set_response_timeout(settings.timeout());
        let mut conn = ConnectionManager::new_with_config(client, config).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::debug!(
            storage = %name,
            min_idle = settings.min_idle,
            max_pool_size = settings.max_pool_size,
            "redis multiplexes one connection, pool sizing does not apply"
        );

        let mut storage = Self {
            name: name.to_owned(),
            prefix: prefix.to_owned(),
            conn,
            server: RwLock::new(ServerRecord {
                long_server_id: 0,
                server_id: identity.id,
                name: identity.name.clone(),
            }),
            watermark: Mutex::new(0),
            players: DashMap::new(),
            levels: LevelCache::new(),
            hook: CreationHook::default(),
            closed: AtomicBool::new(false),
        };

        storage.seed().await?;
        let long_server_id = storage.resolve_server(None, identity.id, &identity.name).await?;
        storage.server.get_mut().long_server_id = long_server_id;
        let watermark = storage.max_post_id().await?;
        *storage.watermark.get_mut() = watermark;

        tracing::debug!(storage = %name, long_server_id, watermark, "redis storage connected");
        Ok(storage)
    }

    fn key(&self, suffix: impl Display) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    async fn seed(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let default_level = encode("levels", &LevelValue { name: DEFAULT_LEVEL_NAME.to_owned() })?;
        let _: () = redis::pipe()
            .cmd("SETNX").arg(self.key("levels:idx")).arg(i64::from(DEFAULT_LEVEL))
            .cmd("SETNX").arg(self.key(format_args!("levels:{DEFAULT_LEVEL}"))).arg(default_level)
            .cmd("SETNX").arg(self.key("servers:idx")).arg(0)
            .cmd("SETNX").arg(self.key("players:idx")).arg(0)
            .cmd("SETNX").arg(self.key("posted_chat:idx")).arg(0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|raw| decode(key, &raw)).transpose()
    }

    async fn next_id(&self, counter: &str) -> Result<i64, StorageError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(self.key(counter), 1).await?)
    }

    /// Binds both directions of a mapping, or neither.
    async fn claim(&self, by_long: &str, long_value: &str, by_uuid: &str, uuid_value: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("MSETNX")
            .arg(by_long)
            .arg(long_value)
            .arg(by_uuid)
            .arg(uuid_value)
            .query_async(&mut conn)
            .await?)
    }

    async fn resolve_server(&self, mut carried: Option<i64>, server_id: Uuid, name: &str) -> Result<i64, StorageError> {
        let uuid_key = self.key(format_args!("servers:{server_id}"));
        loop {
            if let Some(existing) = self.get_json::<ServerByUuid>(&uuid_key).await? {
                if existing.name != name {
                    self.write_server(existing.long_id, server_id, name).await?;
                }
                return Ok(existing.long_id);
            }

            let candidate = match carried.take() {
                Some(id) => id,
                None => self.next_id("servers:idx").await?,
            };
            let long_key = self.key(format_args!("servers:{candidate}"));
            let long_value = encode(&long_key, &ServerByLong { id: server_id, name: name.to_owned() })?;
            let uuid_value = encode(&uuid_key, &ServerByUuid { long_id: candidate, name: name.to_owned() })?;
            if self.claim(&long_key, &long_value, &uuid_key, &uuid_value).await? {
                return Ok(candidate);
            }
        }
    }

    async fn write_server(&self, long_server_id: i64, server_id: Uuid, name: &str) -> Result<(), StorageError> {
        let long_key = self.key(format_args!("servers:{long_server_id}"));
        let uuid_key = self.key(format_args!("servers:{server_id}"));
        let long_value = encode(&long_key, &ServerByLong { id: server_id, name: name.to_owned() })?;
        let uuid_value = encode(&uuid_key, &ServerByUuid { long_id: long_server_id, name: name.to_owned() })?;

        let mut conn = self.conn.clone();
        let _: () = conn.mset(&[(long_key, long_value), (uuid_key, uuid_value)]).await?;
        Ok(())
    }

    /// The flag reports a freshly minted surrogate, as opposed to a found or
    /// adopted one.
    async fn resolve_player(&self, mut carried: Option<i64>, player_id: Uuid) -> Result<(i64, bool), StorageError> {
        let adopting = carried.is_some();
        let uuid_key = self.key(format_args!("players:{player_id}"));
        loop {
            if let Some(existing) = self.get_json::<PlayerByUuid>(&uuid_key).await? {
                return Ok((existing.long_id, false));
            }

            let candidate = match carried.take() {
                Some(id) => id,
                None => self.next_id("players:idx").await?,
            };
            let long_key = self.key(format_args!("players:{candidate}"));
            let long_value = encode(&long_key, &PlayerByLong { id: player_id })?;
            let uuid_value = encode(&uuid_key, &PlayerByUuid { long_id: candidate })?;
            if self.claim(&long_key, &long_value, &uuid_key, &uuid_value).await? {
                return Ok((candidate, !adopting));
            }
        }
    }

    async fn time_millis(&self) -> Result<i64, StorageError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }

    /// Highest post id in the index, local or raw.
    async fn max_post_id(&self) -> Result<i64, StorageError> {
        let mut conn = self.conn.clone();
        let top: Vec<i64> = conn.zrevrange(self.key("posted_chat:ids"), 0, 0).await?;
        Ok(top.first().copied().unwrap_or(0))
    }

    /// Writes a post along with its id index and player history entries, or
    /// nothing at all if `id` is already taken.
    async fn store_post(&self, id: i64, value: &PostValue) -> Result<bool, StorageError> {
        let key = self.key(format_args!("posted_chat:{id}"));
        let list_key = self.key(format_args!("posted_chat:player:{}", value.player));
        let body = encode(&key, &PostValue { id: None, ..value.clone() })?;
        let entry = encode(&list_key, &PostValue { id: Some(id), ..value.clone() })?;

        let mut conn = self.conn.clone();
        Ok(STORE_POST
            .key(&key)
            .key(self.key("posted_chat:ids"))
            .key(&list_key)
            .arg(body)
            .arg(entry)
            .arg(id)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn level_name(&self, level: u8) -> Result<Option<String>, StorageError> {
        Ok(self.get_levels().await?.into_iter().find(|l| l.level == level).map(|l| l.name))
    }

    async fn to_post(&self, id: i64, value: PostValue, levels: &[Level]) -> Result<ChatPost, StorageError> {
        let server_key = self.key(format_args!("servers:{}", value.server));
        let Some(server) = self.get_json::<ServerByLong>(&server_key).await? else {
            return Err(StorageError::corrupt(server_key, "unknown server"));
        };
        let player_key = self.key(format_args!("players:{}", value.player));
        let Some(player) = self.get_json::<PlayerByLong>(&player_key).await? else {
            return Err(StorageError::corrupt(player_key, "unknown player"));
        };
        let level_name = levels
            .iter()
            .find(|l| l.level == value.level)
            .map(|l| l.name.clone())
            .unwrap_or_default();

        Ok(ChatPost {
            id,
            server_id: server.id,
            server_name: server.name,
            player_id: player.id,
            level: value.level,
            level_name,
            message: value.message,
            date: value.date,
        })
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, handler: Weak<dyn StorageHandler>) {
        self.hook.set(handler);
    }

    async fn server(&self) -> ServerRecord {
        self.server.read().await.clone()
    }

    async fn post(&self, player_id: Uuid, level: u8, message: &str) -> Result<PostResult, StorageError> {
        self.ensure_open()?;
        let Some(level_name) = self.level_name(level).await? else {
            return Err(StorageError::invalid(format!("level {level} does not exist")));
        };
        let long_player_id = self.get_long_player_id(player_id).await?;
        let server = self.server().await;

        let mut value = PostValue {
            id: None,
            server: server.long_server_id,
            player: long_player_id,
            level,
            message: message.to_owned(),
            date: 0,
        };
        let id = loop {
            let id = self.next_id("posted_chat:idx").await?;
            value.date = self.time_millis().await?;
            if self.store_post(id, &value).await? {
                break id;
            }
        };

        Ok(PostResult {
            id,
            long_server_id: server.long_server_id,
            server_id: server.server_id,
            server_name: server.name,
            long_player_id,
            player_id,
            level,
            level_name,
            message: value.message,
            date: value.date,
        })
    }

    async fn post_raw(&self, post: &RawPost) -> Result<(), StorageError> {
        self.ensure_open()?;
        if !is_valid_level(post.level) {
            return Err(StorageError::invalid(format!("level {} is out of range", post.level)));
        }
        let server = self.resolve_server(Some(post.long_server_id), post.server_id, &post.server_name).await?;
        let (player, _) = self.resolve_player(Some(post.long_player_id), post.player_id).await?;
        self.players.insert(post.player_id, player);

        let mut conn = self.conn.clone();
        let level_key = self.key(format_args!("levels:{}", post.level));
        let level_name = if post.level_name.is_empty() { post.level.to_string() } else { post.level_name.clone() };
        if conn.set_nx(&level_key, encode(&level_key, &LevelValue { name: level_name.clone() })?).await? {
            self.levels.upsert(post.level, &level_name).await;
        }

        let value = PostValue {
            id: None,
            server,
            player,
            level: post.level,
            message: post.message.clone(),
            date: post.date,
        };
        if !self.store_post(post.id, &value).await? {
            tracing::trace!(storage = %self.name, id = post.id, "raw post already stored");
        }
        Ok(())
    }

    async fn set_level_raw(&self, level: u8, name: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        if !is_valid_level(level) {
            return Err(StorageError::invalid(format!("level {level} is out of range")));
        }
        let key = self.key(format_args!("levels:{level}"));
        let mut conn = self.conn.clone();
        let _: () = conn.set(&key, encode(&key, &LevelValue { name: name.to_owned() })?).await?;
        self.levels.upsert(level, name).await;
        Ok(())
    }

    async fn set_server_raw(&self, long_server_id: i64, server_id: Uuid, name: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let local = self.resolve_server(Some(long_server_id), server_id, name).await?;
        if local != long_server_id {
            tracing::debug!(storage = %self.name, %server_id, carried = long_server_id, local, "server surrogate taken, minted locally");
        }
        Ok(())
    }

    async fn set_player_raw(&self, long_player_id: i64, player_id: Uuid) -> Result<(), StorageError> {
        self.ensure_open()?;
        let (local, _) = self.resolve_player(Some(long_player_id), player_id).await?;
        self.players.insert(player_id, local);
        Ok(())
    }

    async fn set_server_name(&self, name: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut server = self.server.write().await;
        self.write_server(server.long_server_id, server.server_id, name).await?;
        server.name = name.to_owned();
        Ok(())
    }

    async fn get_queue(&self) -> Result<Vec<ChatPost>, StorageError> {
        self.ensure_open()?;
        let mut watermark = self.watermark.lock().await;
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = conn
            .zrangebyscore(self.key("posted_chat:ids"), format!("({}", *watermark), "+inf")
            .await?;
        let Some(&max) = ids.last() else {
            return Ok(Vec::new());
        };

        let own = self.server.read().await.long_server_id;
        let levels = self.get_levels().await?;
        let keys: Vec<String> = ids.iter().map(|id| self.key(format_args!("posted_chat:{id}"))).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut posts = Vec::new();
        for ((id, key), raw) in ids.into_iter().zip(&keys).zip(values) {
            let Some(raw) = raw else {
                continue;
            };
            let post = match decode::<PostValue>(key, &raw) {
                Ok(value) if value.server == own => continue,
                Ok(value) => self.to_post(id, value, &levels).await,
                Err(err) => Err(err),
            };
            match post {
                Ok(post) => posts.push(post),
                Err(err) => tracing::warn!(storage = %self.name, id, "skipping queued post: {err}"),
            }
        }
        *watermark = max;
        Ok(posts)
    }

    async fn get_levels(&self) -> Result<Vec<Level>, StorageError> {
        self.ensure_open()?;
        if let Some(levels) = self.levels.fresh().await {
            return Ok(levels);
        }

        let keys: Vec<String> = (0..=MAX_LEVEL).map(|level| self.key(format_args!("levels:{level}"))).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut levels = Vec::new();
        for ((level, key), raw) in (0..=MAX_LEVEL).zip(&keys).zip(values) {
            let Some(raw) = raw else {
                continue;
            };
            match decode::<LevelValue>(key, &raw) {
                Ok(value) => levels.push(Level { level, name: value.name }),
                Err(err) => tracing::warn!(storage = %self.name, "ignoring level: {err}"),
            }
        }
        self.levels.store(levels.clone()).await;
        Ok(levels)
    }

    async fn get_by_player(&self, player_id: Uuid, days: u32) -> Result<Vec<ChatPost>, StorageError> {
        self.ensure_open()?;
        let uuid_key = self.key(format_args!("players:{player_id}"));
        let Some(player) = self.get_json::<PlayerByUuid>(&uuid_key).await? else {
            return Ok(Vec::new());
        };

        let since = now_millis() - i64::from(days) * DAY_MILLIS;
        let levels = self.get_levels().await?;
        let list_key = self.key(format_args!("posted_chat:player:{}", player.long_id));
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(&list_key, 0, -1).await?;

        let mut posts = Vec::new();
        for raw in entries {
            let value = match decode::<PostValue>(&list_key, &raw) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(storage = %self.name, "skipping history entry: {err}");
                    continue;
                }
            };
            if value.date < since {
                continue;
            }
            let Some(id) = value.id else {
                tracing::warn!(storage = %self.name, key = %list_key, "history entry without id");
                continue;
            };
            posts.push(self.to_post(id, value, &levels).await?);
        }
        Ok(posts)
    }

    async fn get_long_player_id(&self, player_id: Uuid) -> Result<i64, StorageError> {
        self.ensure_open()?;
        if let Some(id) = self.players.get(&player_id) {
            return Ok(*id);
        }

        let (id, minted) = self.resolve_player(None, player_id).await?;
        self.players.insert(player_id, id);
        if minted {
            self.hook.player_created(player_id, id, &self.name).await;
        }
        Ok(id)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(storage = %self.name, "redis storage closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
