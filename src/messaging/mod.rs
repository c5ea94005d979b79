pub mod broker;
pub mod envelope;
pub mod local;
pub mod pubsub;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::MessagingKind;
use crate::error::{DecodeError, MessagingError};
use crate::model::{Level, PlayerRecord, PostResult, ServerRecord};

pub use broker::AmqpMessaging;
pub use envelope::{Envelope, Kind, Payload};
pub use local::{LocalBus, LocalMessaging};
pub use pubsub::RedisMessaging;

/// A real-time transport for replication envelopes.
///
/// Every publish is tagged with this process's sender id. Inbound envelopes
/// from that same sender are dropped before they reach the handler.
#[async_trait]
pub trait Messaging: Send + Sync {
    fn name(&self) -> &str;

    fn sender_id(&self) -> Uuid;

    fn attach(&self, handler: Weak<dyn ReceiptHandler>);

    async fn publish(&self, message_id: Uuid, payload: &Payload) -> Result<(), MessagingError>;

    async fn send_level(&self, message_id: Uuid, level: &Level) -> Result<(), MessagingError> {
        self.publish(message_id, &Payload::Level(level.clone())).await
    }

    async fn send_server(&self, message_id: Uuid, server: &ServerRecord) -> Result<(), MessagingError> {
        self.publish(message_id, &Payload::Server(server.clone())).await
    }

    async fn send_player(&self, message_id: Uuid, player: &PlayerRecord) -> Result<(), MessagingError> {
        self.publish(message_id, &Payload::Player(*player)).await
    }

    async fn send_post(&self, message_id: Uuid, post: &PostResult) -> Result<(), MessagingError> {
        self.publish(message_id, &Payload::Post(post.clone())).await
    }

    async fn send_toggle(&self, message_id: Uuid, player_id: Uuid, level: Option<u8>) -> Result<(), MessagingError> {
        self.publish(message_id, &Payload::Toggle { player_id, level }).await
    }

    /// Stops the subscriber loop. Safe to call more than once.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Receives validated envelopes from a transport.
#[async_trait]
pub trait ReceiptHandler: Send + Sync {
    async fn on_envelope(&self, envelope: Envelope, origin: &str);
}

/// Transport-independent half of receiving: validation, echo suppression and
/// hand-off to the attached handler.
pub struct Inbound {
    name: String,
    sender_id: Uuid,
    handler: OnceLock<Weak<dyn ReceiptHandler>>,
}

impl Inbound {
    pub fn new(name: &str, sender_id: Uuid) -> Self {
        Self { name: name.to_owned(), sender_id, handler: OnceLock::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach(&self, handler: Weak<dyn ReceiptHandler>) {
        if self.handler.set(handler).is_err() {
            tracing::warn!(messaging = %self.name, "receipt handler already attached, ignoring");
        }
    }

    /// `Ok(None)` means the envelope is our own echo.
    pub fn decode(
        &self,
        kind: Kind,
        sender: Option<&str>,
        message_id: Option<&str>,
        body: &Value,
    ) -> Result<Option<Envelope>, DecodeError> {
        let sender = envelope::parse_id("sender", sender)?;
        if sender == self.sender_id {
            return Ok(None);
        }
        let message_id = envelope::parse_id("messageID", message_id)?;
        let payload = Payload::from_value(kind, body)?;
        Ok(Some(Envelope { sender, message_id, payload }))
    }

    pub async fn accept(&self, kind: Kind, sender: Option<&str>, message_id: Option<&str>, body: &Value) {
        let envelope = match self.decode(kind, sender, message_id, body) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(messaging = %self.name, channel = kind.suffix(), "dropping malformed envelope: {err}");
                return;
            }
        };

        let Some(handler) = self.handler.get().and_then(Weak::upgrade) else {
            tracing::debug!(messaging = %self.name, message_id = %envelope.message_id, "no receiver attached, dropping");
            return;
        };
        handler.on_envelope(envelope, &self.name).await;
    }

    /// Accepts a body with `sender` and `messageID` embedded in it.
    pub async fn accept_tagged(&self, kind: Kind, bytes: &[u8]) {
        match envelope::split_tagged(bytes) {
            Ok((sender, message_id, body)) => self.accept(kind, sender.as_deref(), message_id.as_deref(), &body).await,
            Err(err) => {
                tracing::warn!(messaging = %self.name, channel = kind.suffix(), "dropping malformed envelope: {err}");
            }
        }
    }
}

/// Reconnect pacing shared by every network transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MessagingSettings {
    pub timeout_ms: u64,
    pub reconnect_ms: u64,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self { timeout_ms: 5000, reconnect_ms: 5000 }
    }
}

impl MessagingSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Base delay before a reconnect attempt, with up to 50% jitter on top.
    pub fn reconnect_delay(&self) -> Duration {
        use rand::Rng;
        let base = self.reconnect_ms.max(1);
        Duration::from_millis(base + rand::rng().random_range(0..=base / 2))
    }
}

/// Builds one configured messaging engine and starts its subscriber loop.
pub async fn connect(
    name: &str,
    kind: &MessagingKind,
    channel_prefix: &str,
    settings: &MessagingSettings,
    sender_id: Uuid,
    bus: &LocalBus,
) -> Result<Arc<dyn Messaging>, MessagingError> {
    let messaging: Arc<dyn Messaging> = match kind {
        MessagingKind::Rabbitmq { url } => {
            Arc::new(AmqpMessaging::connect(name, url, channel_prefix, settings, sender_id).await?)
        }
        MessagingKind::Redis { url } => {
            Arc::new(RedisMessaging::connect(name, url, channel_prefix, settings, sender_id).await?)
        }
        MessagingKind::Local => Arc::new(LocalMessaging::connect(name, bus, sender_id)),
    };
    tracing::info!(messaging = %name, "messaging engine ready");
    Ok(messaging)
}
