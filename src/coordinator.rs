use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::IdentityCache;
use crate::error::{MessagingError, ReplicationError, StorageError};
use crate::messaging::{Envelope, Messaging, Payload, ReceiptHandler};
use crate::model::{ChatPost, Level, PlayerRecord, PostKey, ServerIdentity, is_valid_level};
use crate::presentation::PresentationHandler;
use crate::storage::{Storage, StorageHandler};

/// Fans local events out to every backend, applies and relays remote ones,
/// and drives the catch-up poll for peers that only share storage.
pub struct Coordinator {
    identity: ServerIdentity,
    storages: Vec<Arc<dyn Storage>>,
    messaging: Vec<Arc<dyn Messaging>>,
    presenter: Arc<dyn PresentationHandler>,
    seen: IdentityCache,
    sent: AtomicU64,
    received: AtomicU64,
    closed: AtomicBool,
}

impl Coordinator {
    /// Wires the coordinator into every backend's callbacks.
    pub fn new(
        identity: ServerIdentity,
        storages: Vec<Arc<dyn Storage>>,
        messaging: Vec<Arc<dyn Messaging>>,
        presenter: Arc<dyn PresentationHandler>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            identity,
            storages,
            messaging,
            presenter,
            seen: IdentityCache::new(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let storage_handler = Arc::downgrade(&coordinator) as Weak<dyn StorageHandler>;
        for storage in &coordinator.storages {
            storage.attach(storage_handler.clone());
        }
        let receipt_handler = Arc::downgrade(&coordinator) as Weak<dyn ReceiptHandler>;
        for messaging in &coordinator.messaging {
            messaging.attach(receipt_handler.clone());
        }
        coordinator
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn storages(&self) -> &[Arc<dyn Storage>] {
        &self.storages
    }

    pub fn messaging(&self) -> &[Arc<dyn Messaging>] {
        &self.messaging
    }

    /// Posts originated here.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Posts and toggles accepted from peers.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes a new post to the first storage that takes it, replicates it,
    /// and presents it locally.
    pub async fn send_chat(&self, player_id: Uuid, level: u8, message: &str) -> Result<ChatPost, ReplicationError> {
        if !is_valid_level(level) {
            return Err(ReplicationError::invalid(format!("level {level} is out of range")));
        }
        if message.trim().is_empty() {
            return Err(ReplicationError::invalid("message cannot be empty"));
        }

        let mut any_recoverable = false;
        let mut last_error = None;
        let mut written = None;
        for storage in &self.storages {
            match storage.post(player_id, level, message).await {
                Ok(result) => {
                    written = Some((storage.name(), result));
                    break;
                }
                Err(err @ StorageError::Invalid(_)) => return Err(ReplicationError::invalid(err.to_string())),
                Err(err) => {
                    tracing::error!(storage = %storage.name(), recoverable = err.is_recoverable(), "could not post: {err}");
                    any_recoverable |= err.is_recoverable();
                    last_error = Some(err);
                }
            }
        }
        let Some((primary, result)) = written else {
            return Err(primary_failure("post", any_recoverable, last_error));
        };

        let post = result.to_chat_post();
        self.seen.posts.insert(post.key());
        let replicated = self.originate(Payload::Post(result), Some(primary)).await;

        self.presenter.handle(&post);
        self.sent.fetch_add(1, Ordering::Relaxed);
        replicated.map(|()| post)
    }

    /// Redirects a player's plain chat to `level`, or stops redirecting it.
    pub async fn toggle_chat(&self, player_id: Uuid, level: Option<u8>) -> Result<(), ReplicationError> {
        if let Some(level) = level.filter(|level| !is_valid_level(*level)) {
            return Err(ReplicationError::invalid(format!("level {level} is out of range")));
        }
        self.presenter.toggle(player_id, level);
        self.originate(Payload::Toggle { player_id, level }, None).await
    }

    /// Creates or renames a level everywhere.
    pub async fn set_level(&self, level: u8, name: &str) -> Result<(), ReplicationError> {
        let mut any_recoverable = false;
        let mut last_error = None;
        let mut primary = None;
        for storage in &self.storages {
            match storage.set_level(level, name).await {
                Ok(()) => {
                    primary = Some(storage.name());
                    break;
                }
                Err(err @ StorageError::Invalid(_)) => return Err(ReplicationError::invalid(err.to_string())),
                Err(err) => {
                    tracing::error!(storage = %storage.name(), recoverable = err.is_recoverable(), "could not set level: {err}");
                    any_recoverable |= err.is_recoverable();
                    last_error = Some(err);
                }
            }
        }
        let Some(primary) = primary else {
            return Err(primary_failure("level", any_recoverable, last_error));
        };

        let level = Level { level, name: name.to_owned() };
        self.originate(Payload::Level(level), Some(primary)).await
    }

    /// Records our name in every storage, then tells every other backend and
    /// every peer which surrogate each storage uses for this server.
    ///
    /// Every storage is announced even if an earlier one fails; the last
    /// failure is returned.
    pub async fn announce_servers(&self) -> Result<(), ReplicationError> {
        let mut failure = None;
        for storage in &self.storages {
            if let Err(err) = storage.set_server_name(&self.identity.name).await {
                tracing::error!(storage = %storage.name(), recoverable = err.is_recoverable(), "could not record server name: {err}");
            }
            let server = storage.server().await;
            let message_id = Uuid::now_v7();
            self.seen.messages.insert(message_id);

            for other in self.storages.iter().filter(|other| other.name() != storage.name()) {
                if let Err(err) = other.set_server_raw(server.long_server_id, server.server_id, &server.name).await {
                    tracing::error!(storage = %other.name(), recoverable = err.is_recoverable(), "could not replicate server: {err}");
                }
            }

            let mut outcome = Outcome::default();
            for messaging in &self.messaging {
                outcome.record(messaging.name(), messaging.send_server(message_id, &server).await);
            }
            if let Err(err) = outcome.finish("server") {
                tracing::warn!(storage = %storage.name(), "server surrogate not announced: {err}");
                failure = Some(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    pub async fn get_levels(&self) -> Result<Vec<Level>, ReplicationError> {
        let mut any_recoverable = false;
        let mut last_error = None;
        for storage in &self.storages {
            match storage.get_levels().await {
                Ok(levels) => return Ok(levels),
                Err(err) => {
                    any_recoverable |= err.is_recoverable();
                    last_error = Some(err);
                }
            }
        }
        Err(primary_failure("levels", any_recoverable, last_error))
    }

    pub async fn get_by_player(&self, player_id: Uuid, days: u32) -> Result<Vec<ChatPost>, ReplicationError> {
        let mut any_recoverable = false;
        let mut last_error = None;
        for storage in &self.storages {
            match storage.get_by_player(player_id, days).await {
                Ok(posts) => return Ok(posts),
                Err(err) => {
                    any_recoverable |= err.is_recoverable();
                    last_error = Some(err);
                }
            }
        }
        Err(primary_failure("history", any_recoverable, last_error))
    }

    /// Local origin path: mark, copy to every storage but `primary`, publish
    /// everywhere.
    async fn originate(&self, payload: Payload, primary: Option<&str>) -> Result<(), ReplicationError> {
        let message_id = Uuid::now_v7();
        self.seen.messages.insert(message_id);
        tracing::debug!(%message_id, kind = payload.kind().suffix(), "propagating to storage & messaging");

        for storage in self.storages.iter().filter(|storage| Some(storage.name()) != primary) {
            self.apply(storage.as_ref(), &payload).await;
        }
        self.broadcast(message_id, &payload, None).await
    }

    async fn apply(&self, storage: &dyn Storage, payload: &Payload) {
        let applied = match payload {
            Payload::Level(level) => storage.set_level_raw(level.level, &level.name).await,
            Payload::Server(server) => storage.set_server_raw(server.long_server_id, server.server_id, &server.name).await,
            Payload::Player(player) => storage.set_player_raw(player.long_player_id, player.player_id).await,
            Payload::Post(post) => storage.post_raw(&post.to_raw()).await,
            Payload::Toggle { .. } => Ok(()),
        };
        if let Err(err) = applied {
            tracing::error!(
                storage = %storage.name(),
                kind = payload.kind().suffix(),
                recoverable = err.is_recoverable(),
                "could not replicate: {err}"
            );
        }
    }

    async fn broadcast(&self, message_id: Uuid, payload: &Payload, except: Option<&str>) -> Result<(), ReplicationError> {
        let mut outcome = Outcome::default();
        for messaging in self.messaging.iter().filter(|messaging| Some(messaging.name()) != except) {
            outcome.record(messaging.name(), messaging.publish(message_id, payload).await);
        }
        outcome.finish(payload.kind().suffix())
    }

    /// One catch-up cycle. Returns how many posts were newly presented.
    pub async fn poll_once(&self) -> usize {
        let mut merged = BTreeMap::new();
        for storage in self.storages.iter().filter(|storage| !storage.is_closed()) {
            match storage.get_queue().await {
                Ok(posts) => {
                    for post in posts {
                        merged.entry(post.key()).or_insert(post);
                    }
                }
                Err(err) => {
                    tracing::error!(storage = %storage.name(), recoverable = err.is_recoverable(), "could not poll: {err}");
                }
            }
        }

        let mut presented = 0;
        for (key, post) in merged {
            if self.seen.posts.insert(key) {
                self.presenter.handle(&post);
                self.received.fetch_add(1, Ordering::Relaxed);
                presented += 1;
            }
        }
        presented
    }

    /// Runs `poll_once` every `interval` until `cancel` fires.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if coordinator.is_closed() {
                    break;
                }
                coordinator.seen.purge_expired();
                let presented = coordinator.poll_once().await;
                if presented > 0 {
                    tracing::debug!(presented, "caught up from storage");
                }
            }
        })
    }

    /// Stops transports first so nothing new arrives, then closes storage.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for messaging in &self.messaging {
            messaging.close().await;
        }
        for storage in &self.storages {
            storage.close().await;
        }
    }
}

fn primary_failure(what: &str, any_recoverable: bool, last_error: Option<StorageError>) -> ReplicationError {
    match last_error {
        Some(err) => ReplicationError::new(any_recoverable, format!("no storage accepted the {what}: {err}")),
        None => ReplicationError::hard("no storage engines are configured"),
    }
}

/// Tally of one fan-out across transports.
#[derive(Default)]
struct Outcome {
    attempted: usize,
    delivered: usize,
    any_recoverable: bool,
    last_error: Option<String>,
}

impl Outcome {
    fn record(&mut self, name: &str, result: Result<(), MessagingError>) {
        self.attempted += 1;
        match result {
            Ok(()) => self.delivered += 1,
            Err(err) => {
                tracing::error!(messaging = %name, recoverable = err.is_recoverable(), "could not publish: {err}");
                self.any_recoverable |= err.is_recoverable();
                self.last_error = Some(err.to_string());
            }
        }
    }

    /// Succeeds if any transport took it, or if there were none to try.
    fn finish(self, kind: &str) -> Result<(), ReplicationError> {
        if self.attempted == 0 || self.delivered > 0 {
            return Ok(());
        }
        Err(ReplicationError::new(
            self.any_recoverable,
            format!("no messaging engine accepted the {kind}: {}", self.last_error.unwrap_or_default()),
        ))
    }
}

#[async_trait]
impl ReceiptHandler for Coordinator {
    async fn on_envelope(&self, envelope: Envelope, origin: &str) {
        if self.is_closed() || !self.seen.messages.insert(envelope.message_id) {
            return;
        }
        if let Payload::Post(post) = &envelope.payload {
            let key = PostKey { id: post.id, server_id: post.server_id };
            if !self.seen.posts.insert(key) {
                return;
            }
        }

        tracing::debug!(
            message_id = %envelope.message_id,
            sender = %envelope.sender,
            messaging = %origin,
            kind = envelope.payload.kind().suffix(),
            "propagating to storage & messaging"
        );
        for storage in &self.storages {
            self.apply(storage.as_ref(), &envelope.payload).await;
        }
        // per-engine failures are already logged
        let _ = self.broadcast(envelope.message_id, &envelope.payload, Some(origin)).await;

        match &envelope.payload {
            Payload::Post(post) => {
                self.presenter.handle(&post.to_chat_post());
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            Payload::Toggle { player_id, level } => {
                self.presenter.toggle(*player_id, *level);
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            Payload::Level(_) | Payload::Server(_) | Payload::Player(_) => {}
        }
    }
}

#[async_trait]
impl StorageHandler for Coordinator {
    async fn on_player_created(&self, player_id: Uuid, long_player_id: i64, origin: &str) {
        let player = PlayerRecord { long_player_id, player_id };
        let message_id = Uuid::now_v7();
        self.seen.messages.insert(message_id);

        for storage in self.storages.iter().filter(|storage| storage.name() != origin) {
            if let Err(err) = storage.set_player_raw(long_player_id, player_id).await {
                tracing::error!(storage = %storage.name(), recoverable = err.is_recoverable(), "could not replicate player: {err}");
            }
        }

        let mut outcome = Outcome::default();
        for messaging in &self.messaging {
            outcome.record(messaging.name(), messaging.send_player(message_id, &player).await);
        }
        if let Err(err) = outcome.finish("player") {
            tracing::warn!(%player_id, "new player not broadcast: {err}");
        }
    }
}
