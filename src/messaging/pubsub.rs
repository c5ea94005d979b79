use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MessagingError;
use crate::messaging::envelope::{self, Kind, Payload};
use crate::messaging::{Inbound, Messaging, MessagingSettings, ReceiptHandler};

/// Redis pub/sub transport. Redis has no message properties, so `sender`
/// and `messageID` travel inside the JSON body.
pub struct RedisMessaging {
    prefix: String,
    sender_id: Uuid,
    publisher: ConnectionManager,
    inbound: Arc<Inbound>,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisMessaging {
    pub async fn connect(
        name: &str,
        url: &str,
        prefix: &str,
        settings: &MessagingSettings,
        sender_id: Uuid,
    ) -> Result<Self, MessagingError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(settings.timeout())
            .set_response_timeout(settings.timeout());
        let publisher = ConnectionManager::new_with_config(client.clone(), config).await?;

        let inbound = Arc::new(Inbound::new(name, sender_id));
        let cancel = CancellationToken::new();
        let subscriber = Subscriber {
            client,
            prefix: prefix.to_owned(),
            settings: settings.clone(),
            inbound: inbound.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(subscriber.run());

        Ok(Self {
            prefix: prefix.to_owned(),
            sender_id,
            publisher,
            inbound,
            cancel,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

struct Subscriber {
    client: redis::Client,
    prefix: String,
    settings: MessagingSettings,
    inbound: Arc<Inbound>,
    cancel: CancellationToken,
}

impl Subscriber {
    async fn run(self) {
        let name = self.inbound.name().to_owned();
        loop {
            match self.subscribe_once().await {
                Ok(()) if self.cancel.is_cancelled() => break,
                Ok(()) => tracing::warn!(messaging = %name, "subscription ended, reconnecting"),
                Err(err) => tracing::warn!(messaging = %name, recoverable = err.is_recoverable(), "subscription failed: {err}"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay()) => {}
            }
        }
        tracing::debug!(messaging = %name, "subscriber stopped");
    }

    /// Runs one subscription until it drops or we are cancelled.
    async fn subscribe_once(&self) -> Result<(), MessagingError> {
        let mut pubsub = tokio::time::timeout(self.settings.timeout(), self.client.get_async_pubsub())
            .await
            .map_err(|_| MessagingError::Timeout)??;
        let channels: Vec<String> = Kind::ALL.iter().map(|kind| kind.channel(&self.prefix)).collect();
        pubsub.subscribe(&channels).await?;
        tracing::debug!(messaging = %self.inbound.name(), "subscribed to {}", channels.join(", "));

        let messages = pubsub.on_message();
        tokio::pin!(messages);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = messages.next() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    match Kind::from_channel(&self.prefix, message.get_channel_name()) {
                        Ok(kind) => self.inbound.accept_tagged(kind, message.get_payload_bytes()).await,
                        Err(err) => tracing::warn!(messaging = %self.inbound.name(), "dropping message: {err}"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Messaging for RedisMessaging {
    fn name(&self) -> &str {
        self.inbound.name()
    }

    fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    fn attach(&self, handler: Weak<dyn ReceiptHandler>) {
        self.inbound.attach(handler);
    }

    async fn publish(&self, message_id: Uuid, payload: &Payload) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        let bytes = envelope::encode_tagged(self.sender_id, message_id, payload)?;
        let mut conn = self.publisher.clone();
        let _: i64 = conn.publish(payload.kind().channel(&self.prefix), bytes).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
