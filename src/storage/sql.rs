use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::{Any, AnyPool, Transaction};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{
    ChatPost, DEFAULT_LEVEL, DEFAULT_LEVEL_NAME, Level, PostResult, RawPost, ServerIdentity, ServerRecord, is_valid_level,
    now_millis,
};
use crate::storage::{CreationHook, LevelCache, PoolSettings, Storage, StorageHandler};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Which SQL dialect a `SqlStorage` speaks. Both share one table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFlavor {
    Sqlite,
    MySql,
}

impl SqlFlavor {
    /// Milliseconds since the epoch, evaluated by the database.
    fn now_millis(self) -> &'static str {
        match self {
            SqlFlavor::Sqlite => "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)",
            SqlFlavor::MySql => "CAST(UNIX_TIMESTAMP(NOW(3)) * 1000 AS SIGNED)",
        }
    }

    fn insert_ignore(self) -> &'static str {
        match self {
            SqlFlavor::Sqlite => "INSERT OR IGNORE",
            SqlFlavor::MySql => "INSERT IGNORE",
        }
    }

    fn schema(self, p: &str) -> Vec<String> {
        match self {
            SqlFlavor::Sqlite => vec![
                format!("CREATE TABLE IF NOT EXISTS {p}levels (id INTEGER NOT NULL PRIMARY KEY, name TEXT NOT NULL)"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}servers (id INTEGER PRIMARY KEY AUTOINCREMENT, uuid TEXT NOT NULL UNIQUE, name TEXT NOT NULL)"
                ),
                format!("CREATE TABLE IF NOT EXISTS {p}players (id INTEGER PRIMARY KEY AUTOINCREMENT, uuid TEXT NOT NULL UNIQUE)"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}posted_chat (\
                     id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     server_id INTEGER NOT NULL REFERENCES {p}servers(id), \
                     player_id INTEGER NOT NULL REFERENCES {p}players(id), \
                     level INTEGER NOT NULL REFERENCES {p}levels(id), \
                     message TEXT NOT NULL, \
                     date INTEGER NOT NULL)"
                ),
                format!("CREATE INDEX IF NOT EXISTS {p}posted_chat_player ON {p}posted_chat (player_id, date)"),
            ],
            SqlFlavor::MySql => vec![
                format!("CREATE TABLE IF NOT EXISTS {p}levels (id BIGINT NOT NULL PRIMARY KEY, name VARCHAR(255) NOT NULL)"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}servers (id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, uuid CHAR(36) NOT NULL UNIQUE, name VARCHAR(255) NOT NULL)"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}players (id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, uuid CHAR(36) NOT NULL UNIQUE)"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}posted_chat (\
                     id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, \
                     server_id BIGINT NOT NULL, \
                     player_id BIGINT NOT NULL, \
                     level BIGINT NOT NULL, \
                     message TEXT NOT NULL, \
                     date BIGINT NOT NULL, \
                     INDEX {p}posted_chat_player (player_id, date), \
                     FOREIGN KEY (server_id) REFERENCES {p}servers(id), \
                     FOREIGN KEY (player_id) REFERENCES {p}players(id), \
                     FOREIGN KEY (level) REFERENCES {p}levels(id))"
                ),
            ],
        }
    }

    /// Clause that makes an insert report the new row id, where supported.
    fn returning_id(self) -> &'static str {
        match self {
            SqlFlavor::Sqlite => " RETURNING id",
            SqlFlavor::MySql => "",
        }
    }

    fn upsert_level(self, p: &str) -> String {
        match self {
            SqlFlavor::Sqlite => {
                format!("INSERT INTO {p}levels (id, name) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name")
            }
            SqlFlavor::MySql => {
                format!("INSERT INTO {p}levels (id, name) VALUES (?, ?) ON DUPLICATE KEY UPDATE name = VALUES(name)")
            }
        }
    }
}

struct Queries {
    flavor: SqlFlavor,
    schema: Vec<String>,
    upsert_level: String,
    seed_level: String,
    select_levels: String,
    server_by_uuid: String,
    insert_server_with_id: String,
    insert_server: String,
    rename_server: String,
    player_by_uuid: String,
    insert_player_with_id: String,
    insert_player: String,
    insert_post: String,
    insert_post_raw: String,
    last_insert_id: &'static str,
    post_date: String,
    max_post: String,
    queue: String,
    by_player: String,
}

impl Queries {
    fn new(flavor: SqlFlavor, p: &str) -> Self {
        let ignore = flavor.insert_ignore();
        let post_columns = format!(
            "SELECT c.id, s.uuid, s.name, pl.uuid, c.level, COALESCE(l.name, ''), c.message, c.date \
             FROM {p}posted_chat c \
             JOIN {p}servers s ON s.id = c.server_id \
             JOIN {p}players pl ON pl.id = c.player_id \
             LEFT JOIN {p}levels l ON l.id = c.level"
        );

        Self {
            flavor,
            schema: flavor.schema(p),
            upsert_level: flavor.upsert_level(p),
            seed_level: format!("{ignore} INTO {p}levels (id, name) VALUES (?, ?)"),
            select_levels: format!("SELECT id, name FROM {p}levels ORDER BY id"),
            server_by_uuid: format!("SELECT id FROM {p}servers WHERE uuid = ?"),
            insert_server_with_id: format!("{ignore} INTO {p}servers (id, uuid, name) VALUES (?, ?, ?)"),
            insert_server: format!("{ignore} INTO {p}servers (uuid, name) VALUES (?, ?)"),
            rename_server: format!("UPDATE {p}servers SET name = ? WHERE id = ?"),
            player_by_uuid: format!("SELECT id FROM {p}players WHERE uuid = ?"),
            insert_player_with_id: format!("{ignore} INTO {p}players (id, uuid) VALUES (?, ?)"),
            insert_player: format!("{ignore} INTO {p}players (uuid) VALUES (?)"),
            insert_post: format!(
                "INSERT INTO {p}posted_chat (server_id, player_id, level, message, date) VALUES (?, ?, ?, ?, {}){}",
                flavor.now_millis(),
                flavor.returning_id()
            ),
            insert_post_raw: format!(
                "{ignore} INTO {p}posted_chat (id, server_id, player_id, level, message, date) VALUES (?, ?, ?, ?, ?, ?)"
            ),
            last_insert_id: "SELECT CAST(LAST_INSERT_ID() AS SIGNED)",
            post_date: format!("SELECT date FROM {p}posted_chat WHERE id = ?"),
            max_post: format!("SELECT COALESCE(MAX(id), 0) FROM {p}posted_chat"),
            queue: format!("{post_columns} WHERE c.server_id <> ? AND c.id > ? ORDER BY c.id"),
            by_player: format!("{post_columns} WHERE pl.uuid = ? AND c.date >= ? ORDER BY c.id"),
        }
    }
}

type PostRow = (i64, String, String, String, i64, String, String, i64);

/// Relational storage over one pooled MySQL or SQLite database.
pub struct SqlStorage {
    name: String,
    pool: AnyPool,
    q: Queries,
    server: RwLock<ServerRecord>,
    watermark: Mutex<i64>,
    players: DashMap<Uuid, i64>,
    levels: LevelCache,
    hook: CreationHook,
    closed: AtomicBool,
}

impl SqlStorage {
    pub async fn connect(
        name: &str,
        flavor: SqlFlavor,
        url: &str,
        prefix: &str,
        settings: &PoolSettings,
        identity: &ServerIdentity,
    ) -> Result<Self, StorageError> {
        install_default_drivers();

        let pool = AnyPoolOptions::new()
            .min_connections(settings.min_idle)
            .max_connections(settings.max_pool_size.max(1))
            .max_lifetime(settings.max_lifetime())
            .acquire_timeout(settings.timeout())
            .connect(url)
            .await?;
        warm(&pool, settings.min_idle).await?;

        let q = Queries::new(flavor, prefix);
        for statement in &q.schema {
            sqlx::query(statement).execute(&pool).await?;
        }
        sqlx::query(&q.seed_level)
            .bind(DEFAULT_LEVEL as i64)
            .bind(DEFAULT_LEVEL_NAME)
            .execute(&pool)
            .await?;

        let mut tx = pool.begin().await?;
        let long_server_id = resolve_server(&q, &mut tx, None, identity.id, &identity.name).await?;
        tx.commit().await?;

        let (watermark,): (i64,) = sqlx::query_as(&q.max_post).fetch_one(&pool).await?;
        tracing::debug!(storage = %name, long_server_id, watermark, "sql storage connected");

        Ok(Self {
            name: name.to_owned(),
            pool,
            q,
            server: RwLock::new(ServerRecord {
                long_server_id,
                server_id: identity.id,
                name: identity.name.clone(),
            }),
            watermark: Mutex::new(watermark),
            players: DashMap::new(),
            levels: LevelCache::new(),
            hook: CreationHook::default(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    async fn level_name(&self, level: u8) -> Result<Option<String>, StorageError> {
        Ok(self.get_levels().await?.into_iter().find(|l| l.level == level).map(|l| l.name))
    }

    fn to_post(&self, row: PostRow) -> Result<ChatPost, StorageError> {
        let (id, server_id, server_name, player_id, level, level_name, message, date) = row;
        let key = format!("{}:posted_chat:{id}", self.name);
        Ok(ChatPost {
            id,
            server_id: Uuid::parse_str(&server_id).map_err(|e| StorageError::corrupt(&key, e))?,
            server_name,
            player_id: Uuid::parse_str(&player_id).map_err(|e| StorageError::corrupt(&key, e))?,
            level: u8::try_from(level)
                .ok()
                .filter(|l| is_valid_level(*l))
                .ok_or_else(|| StorageError::corrupt(&key, format!("level {level} out of range")))?,
            level_name,
            message,
            date,
        })
    }
}

async fn warm(pool: &AnyPool, min: u32) -> Result<(), sqlx::Error> {
    let mut held = Vec::with_capacity(min as usize);
    for _ in 0..min {
        held.push(pool.acquire().await?);
    }
    Ok(())
}

/// Finds the local surrogate for `server_id`, adopting `carried` when it is
/// free and minting a fresh one otherwise. Existing mappings only get renamed.
async fn resolve_server(
    q: &Queries,
    tx: &mut Transaction<'_, Any>,
    carried: Option<i64>,
    server_id: Uuid,
    name: &str,
) -> Result<i64, StorageError> {
    let uuid = server_id.to_string();

    let existing: Option<(i64,)> = sqlx::query_as(&q.server_by_uuid).bind(&uuid).fetch_optional(&mut **tx).await?;
    if let Some((id,)) = existing {
        sqlx::query(&q.rename_server).bind(name).bind(id).execute(&mut **tx).await?;
        return Ok(id);
    }

    if let Some(carried) = carried {
        let done = sqlx::query(&q.insert_server_with_id)
            .bind(carried)
            .bind(&uuid)
            .bind(name)
            .execute(&mut **tx)
            .await?;
        if done.rows_affected() == 1 {
            return Ok(carried);
        }
    }

    sqlx::query(&q.insert_server).bind(&uuid).bind(name).execute(&mut **tx).await?;
    let (id,): (i64,) = sqlx::query_as(&q.server_by_uuid).bind(&uuid).fetch_one(&mut **tx).await?;
    Ok(id)
}

/// Same adoption rules as `resolve_server`. The flag reports a fresh mint.
async fn resolve_player(
    q: &Queries,
    tx: &mut Transaction<'_, Any>,
    carried: Option<i64>,
    player_id: Uuid,
) -> Result<(i64, bool), StorageError> {
    let uuid = player_id.to_string();

    let existing: Option<(i64,)> = sqlx::query_as(&q.player_by_uuid).bind(&uuid).fetch_optional(&mut **tx).await?;
    if let Some((id,)) = existing {
        return Ok((id, false));
    }

    if let Some(carried) = carried {
        let done = sqlx::query(&q.insert_player_with_id).bind(carried).bind(&uuid).execute(&mut **tx).await?;
        if done.rows_affected() == 1 {
            return Ok((carried, false));
        }
    }

    let done = sqlx::query(&q.insert_player).bind(&uuid).execute(&mut **tx).await?;
    let (id,): (i64,) = sqlx::query_as(&q.player_by_uuid).bind(&uuid).fetch_one(&mut **tx).await?;
    Ok((id, carried.is_none() && done.rows_affected() == 1))
}

#[async_trait]
impl Storage for SqlStorage {
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

        let mut tx = self.pool.begin().await?;
        let (id,): (i64,) = match self.q.flavor {
            SqlFlavor::Sqlite => {
                sqlx::query_as(&self.q.insert_post)
                    .bind(server.long_server_id)
                    .bind(long_player_id)
                    .bind(level as i64)
                    .bind(message)
                    .fetch_one(&mut *tx)
                    .await?
            }
            SqlFlavor::MySql => {
                sqlx::query(&self.q.insert_post)
                    .bind(server.long_server_id)
                    .bind(long_player_id)
                    .bind(level as i64)
                    .bind(message)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query_as(self.q.last_insert_id).fetch_one(&mut *tx).await?
            }
        };
        let (date,): (i64,) = sqlx::query_as(&self.q.post_date).bind(id).fetch_one(&mut *tx).await?;
        tx.commit().await?;

        Ok(PostResult {
            id,
            long_server_id: server.long_server_id,
            server_id: server.server_id,
            server_name: server.name,
            long_player_id,
            player_id,
            level,
            level_name,
            message: message.to_owned(),
            date,
        })
    }

    async fn post_raw(&self, post: &RawPost) -> Result<(), StorageError> {
        self.ensure_open()?;
        if !is_valid_level(post.level) {
            return Err(StorageError::invalid(format!("level {} is out of range", post.level)));
        }
        let level_name = if post.level_name.is_empty() { post.level.to_string() } else { post.level_name.clone() };

        let mut tx = self.pool.begin().await?;
        let server = resolve_server(&self.q, &mut tx, Some(post.long_server_id), post.server_id, &post.server_name).await?;
        let (player, _) = resolve_player(&self.q, &mut tx, Some(post.long_player_id), post.player_id).await?;
        let seeded = sqlx::query(&self.q.seed_level)
            .bind(post.level as i64)
            .bind(&level_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.q.insert_post_raw)
            .bind(post.id)
            .bind(server)
            .bind(player)
            .bind(post.level as i64)
            .bind(&post.message)
            .bind(post.date)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.players.insert(post.player_id, player);
        if seeded.rows_affected() == 1 {
            self.levels.upsert(post.level, &level_name).await;
        }
        Ok(())
    }

    async fn set_level_raw(&self, level: u8, name: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        if !is_valid_level(level) {
            return Err(StorageError::invalid(format!("level {level} is out of range")));
        }
        sqlx::query(&self.q.upsert_level).bind(level as i64).bind(name).execute(&self.pool).await?;
        self.levels.upsert(level, name).await;
        Ok(())
    }

    async fn set_server_raw(&self, long_server_id: i64, server_id: Uuid, name: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        let local = resolve_server(&self.q, &mut tx, Some(long_server_id), server_id, name).await?;
        tx.commit().await?;
        if local != long_server_id {
            tracing::debug!(storage = %self.name, %server_id, carried = long_server_id, local, "server surrogate taken, minted locally");
        }
        Ok(())
    }

    async fn set_player_raw(&self, long_player_id: i64, player_id: Uuid) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        let (local, _) = resolve_player(&self.q, &mut tx, Some(long_player_id), player_id).await?;
        tx.commit().await?;
        self.players.insert(player_id, local);
        Ok(())
    }

    async fn set_server_name(&self, name: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut server = self.server.write().await;
        sqlx::query(&self.q.rename_server)
            .bind(name)
            .bind(server.long_server_id)
            .execute(&self.pool)
            .await?;
        server.name = name.to_owned();
        Ok(())
    }

    /// Returns foreign posts above the watermark in id order and advances it.
    ///
    /// Auto-increment ids are handed out at insert time, not at commit, so a
    /// row whose transaction commits after a higher id has already been polled
    /// falls behind the watermark and is never returned here. Such posts still
    /// reach peers through messaging.
    async fn get_queue(&self) -> Result<Vec<ChatPost>, StorageError> {
        self.ensure_open()?;
        let mut watermark = self.watermark.lock().await;
        let own = self.server.read().await.long_server_id;

        let rows: Vec<PostRow> = sqlx::query_as(&self.q.queue)
            .bind(own)
            .bind(*watermark)
            .fetch_all(&self.pool)
            .await?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0;
            *watermark = (*watermark).max(id);
            match self.to_post(row) {
                Ok(post) => posts.push(post),
                Err(err) => tracing::warn!(storage = %self.name, id, "skipping queued post: {err}"),
            }
        }
        Ok(posts)
    }

    async fn get_levels(&self) -> Result<Vec<Level>, StorageError> {
        self.ensure_open()?;
        if let Some(levels) = self.levels.fresh().await {
            return Ok(levels);
        }

        let rows: Vec<(i64, String)> = sqlx::query_as(&self.q.select_levels).fetch_all(&self.pool).await?;
        let levels: Vec<Level> = rows
            .into_iter()
            .filter_map(|(id, name)| match u8::try_from(id).ok().filter(|l| is_valid_level(*l)) {
                Some(level) => Some(Level { level, name }),
                None => {
                    tracing::warn!(storage = %self.name, id, "ignoring out of range level");
                    None
                }
            })
            .collect();
        self.levels.store(levels.clone()).await;
        Ok(levels)
    }

    async fn get_by_player(&self, player_id: Uuid, days: u32) -> Result<Vec<ChatPost>, StorageError> {
        self.ensure_open()?;
        let since = now_millis() - i64::from(days) * DAY_MILLIS;
        let rows: Vec<PostRow> = sqlx::query_as(&self.q.by_player)
            .bind(player_id.to_string())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| self.to_post(row)).collect()
    }

    async fn get_long_player_id(&self, player_id: Uuid) -> Result<i64, StorageError> {
        self.ensure_open()?;
        if let Some(id) = self.players.get(&player_id) {
            return Ok(*id);
        }

        let mut tx = self.pool.begin().await?;
        let (id, minted) = resolve_player(&self.q, &mut tx, None, player_id).await?;
        tx.commit().await?;
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
        self.pool.close().await;
        tracing::debug!(storage = %self.name, "sql storage closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
