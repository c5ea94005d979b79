use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MessagingError;
use crate::messaging::envelope::{self, Kind, Payload};
use crate::messaging::{Inbound, Messaging, MessagingSettings, ReceiptHandler};

const PERSISTENT: u8 = 2;

/// AMQP transport: one durable fanout exchange per kind, and one exclusive
/// queue per process bound to all of them. The message id and sender ride in
/// message properties rather than the body.
pub struct AmqpMessaging {
    link: Arc<Link>,
    sender_id: Uuid,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the publisher side and the consumer loop.
struct Link {
    url: String,
    prefix: String,
    settings: MessagingSettings,
    inbound: Inbound,
    channel: RwLock<Option<Channel>>,
    cancel: CancellationToken,
}

struct Session {
    connection: Connection,
    consumer: Consumer,
}

impl AmqpMessaging {
    pub async fn connect(
        name: &str,
        url: &str,
        prefix: &str,
        settings: &MessagingSettings,
        sender_id: Uuid,
    ) -> Result<Self, MessagingError> {
        let link = Arc::new(Link {
            url: url.to_owned(),
            prefix: prefix.to_owned(),
            settings: settings.clone(),
            inbound: Inbound::new(name, sender_id),
            channel: RwLock::new(None),
            cancel: CancellationToken::new(),
        });

        let session = link.open().await?;
        let task = tokio::spawn(link.clone().run(session));

        Ok(Self {
            link,
            sender_id,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

impl Link {
    fn name(&self) -> &str {
        self.inbound.name()
    }

    async fn open(&self) -> Result<Session, MessagingError> {
        let connection = tokio::time::timeout(
            self.settings.timeout(),
            Connection::connect(&self.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| MessagingError::Timeout)??;
        let channel = connection.create_channel().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        for kind in Kind::ALL {
            let exchange = kind.channel(&self.prefix);
            channel
                .exchange_declare(
                    &exchange,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(queue.name().as_str(), &exchange, "", QueueBindOptions::default(), FieldTable::default())
                .await?;
        }

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &format!("{}-{}", self.name(), Uuid::new_v4()),
                BasicConsumeOptions { no_ack: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        *self.channel.write().await = Some(channel);
        Ok(Session { connection, consumer })
    }

    async fn run(self: Arc<Self>, session: Session) {
        let mut session = Some(session);
        loop {
            if let Some(Session { connection, consumer }) = session.take() {
                let outcome = self.consume(consumer).await;
                *self.channel.write().await = None;
                if self.cancel.is_cancelled() {
                    if let Err(err) = connection.close(200, "closing").await {
                        tracing::debug!(messaging = %self.name(), "error closing connection: {err}");
                    }
                    break;
                }
                match outcome {
                    Ok(()) => tracing::warn!(messaging = %self.name(), "consumer ended, reconnecting"),
                    Err(err) => tracing::warn!(messaging = %self.name(), recoverable = err.is_recoverable(), "consumer failed: {err}"),
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay()) => {}
            }

            match self.open().await {
                Ok(reopened) => {
                    tracing::info!(messaging = %self.name(), "reconnected");
                    session = Some(reopened);
                }
                Err(err) => tracing::warn!(messaging = %self.name(), recoverable = err.is_recoverable(), "reconnect failed: {err}"),
            }
        }
        tracing::debug!(messaging = %self.name(), "consumer stopped");
    }

    async fn consume(&self, mut consumer: Consumer) -> Result<(), MessagingError> {
        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                delivery = consumer.next() => delivery,
            };
            let Some(delivery) = delivery else {
                return Ok(());
            };
            let delivery = delivery?;

            let kind = match Kind::from_channel(&self.prefix, delivery.exchange.as_str()) {
                Ok(kind) => kind,
                Err(err) => {
                    tracing::warn!(messaging = %self.name(), "dropping delivery: {err}");
                    continue;
                }
            };
            let body = match serde_json::from_slice(&delivery.data) {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(messaging = %self.name(), channel = kind.suffix(), "dropping malformed envelope: {err}");
                    continue;
                }
            };

            let properties = &delivery.properties;
            let message_id = properties.message_id().as_ref().map(|id| id.as_str());
            let sender = properties.headers().as_ref().and_then(|headers| {
                headers
                    .inner()
                    .iter()
                    .find(|(key, _)| key.as_str() == "sender")
                    .and_then(|(_, value)| match value {
                        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
                        AMQPValue::ShortString(s) => Some(s.as_str()),
                        _ => None,
                    })
            });

            self.inbound.accept(kind, sender, message_id, &body).await;
        }
    }
}

#[async_trait]
impl Messaging for AmqpMessaging {
    fn name(&self) -> &str {
        self.link.name()
    }

    fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    fn attach(&self, handler: Weak<dyn ReceiptHandler>) {
        self.link.inbound.attach(handler);
    }

    async fn publish(&self, message_id: Uuid, payload: &Payload) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        let Some(channel) = self.link.channel.read().await.clone() else {
            return Err(MessagingError::Disconnected);
        };

        let body = envelope::encode_body(payload)?;
        let mut headers = FieldTable::default();
        headers.insert("sender".into(), AMQPValue::LongString(self.sender_id.to_string().into()));
        let properties = BasicProperties::default()
            .with_message_id(message_id.to_string().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        channel
            .basic_publish(
                &payload.kind().channel(&self.link.prefix),
                "",
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
