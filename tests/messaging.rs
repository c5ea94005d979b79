//! Transport behaviour: delivery between peers, echo suppression and
//! malformed input. Redis and RabbitMQ run when `REDIS_URL` / `AMQP_URL` are
//! set.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use staffchat::config::MessagingKind;
use staffchat::messaging::{self, Envelope, Inbound, Kind, LocalBus, Messaging, MessagingSettings, Payload, ReceiptHandler};
use uuid::Uuid;

#[derive(Default)]
struct Inbox(Mutex<Vec<(Envelope, String)>>);

impl Inbox {
    fn toggles(&self) -> Vec<(Uuid, Uuid, Option<u8>)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(envelope, _)| match envelope.payload {
                Payload::Toggle { player_id, level } => Some((envelope.sender, player_id, level)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ReceiptHandler for Inbox {
    async fn on_envelope(&self, envelope: Envelope, origin: &str) {
        self.0.lock().unwrap().push((envelope, origin.to_owned()));
    }
}

fn attach(messaging: &dyn Messaging) -> Arc<Inbox> {
    let inbox = Arc::new(Inbox::default());
    let handler: Weak<dyn ReceiptHandler> = Arc::downgrade(&inbox) as Weak<dyn ReceiptHandler>;
    messaging.attach(handler);
    inbox
}

/// Publishes toggles from `a` until `b` hears one, then checks `a` heard none
/// of its own.
async fn exchange(a: Arc<dyn Messaging>, b: Arc<dyn Messaging>) {
    let a_inbox = attach(a.as_ref());
    let b_inbox = attach(b.as_ref());
    let player = Uuid::new_v4();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b_inbox.toggles().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "peer never received a toggle");
        a.send_toggle(Uuid::new_v4(), player, Some(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (sender, player_id, level) = b_inbox.toggles()[0];
    assert_eq!(sender, a.sender_id());
    assert_eq!(player_id, player);
    assert_eq!(level, Some(3));
    assert_eq!(b_inbox.0.lock().unwrap()[0].1, b.name());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a_inbox.toggles().is_empty(), "own envelopes must be dropped");

    a.close().await;
    a.close().await;
    b.close().await;
    assert!(a.is_closed());
    assert!(matches!(
        a.send_toggle(Uuid::new_v4(), player, None).await,
        Err(staffchat::error::MessagingError::Closed)
    ));
}

#[tokio::test]
async fn local_bus_delivers_to_peers_only() {
    let bus = LocalBus::new();
    let settings = MessagingSettings::default();
    let a = messaging::connect("bus", &MessagingKind::Local, "staffchat", &settings, Uuid::new_v4(), &bus).await.unwrap();
    let b = messaging::connect("bus", &MessagingKind::Local, "staffchat", &settings, Uuid::new_v4(), &bus).await.unwrap();
    exchange(a, b).await;
}

#[tokio::test]
async fn redis_pubsub_delivers_to_peers_only() {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return;
    };
    let prefix = format!("staffchat-test-{}", Uuid::new_v4());
    let settings = MessagingSettings::default();
    let kind = MessagingKind::Redis { url };
    let bus = LocalBus::new();
    let a = messaging::connect("redis", &kind, &prefix, &settings, Uuid::new_v4(), &bus).await.unwrap();
    let b = messaging::connect("redis", &kind, &prefix, &settings, Uuid::new_v4(), &bus).await.unwrap();
    exchange(a, b).await;
}

#[tokio::test]
async fn rabbitmq_delivers_to_peers_only() {
    let Ok(url) = std::env::var("AMQP_URL") else {
        return;
    };
    let prefix = format!("staffchat-test-{}", Uuid::new_v4());
    let settings = MessagingSettings::default();
    let kind = MessagingKind::Rabbitmq { url };
    let bus = LocalBus::new();
    let a = messaging::connect("amqp", &kind, &prefix, &settings, Uuid::new_v4(), &bus).await.unwrap();
    let b = messaging::connect("amqp", &kind, &prefix, &settings, Uuid::new_v4(), &bus).await.unwrap();
    exchange(a, b).await;
}

#[tokio::test]
async fn inbound_drops_echoes_and_malformed_envelopes() {
    let me = Uuid::new_v4();
    let inbound = Inbound::new("bus", me);
    let inbox = Arc::new(Inbox::default());
    let handler: Weak<dyn ReceiptHandler> = Arc::downgrade(&inbox) as Weak<dyn ReceiptHandler>;
    inbound.attach(handler);

    let body = json!({"playerID": Uuid::nil(), "level": 2});
    let message_id = Uuid::new_v4().to_string();
    let other = Uuid::new_v4().to_string();

    assert!(inbound.decode(Kind::Toggle, Some(&me.to_string()), Some(&message_id), &body).unwrap().is_none());
    assert!(inbound.decode(Kind::Toggle, Some("nope"), Some(&message_id), &body).is_err());
    assert!(inbound.decode(Kind::Toggle, Some(&other), None, &body).is_err());

    inbound.accept(Kind::Toggle, Some(&me.to_string()), Some(&message_id), &body).await;
    inbound.accept(Kind::Toggle, Some(&other), Some("bad"), &body).await;
    inbound.accept(Kind::Post, Some(&other), Some(&message_id), &body).await;
    inbound.accept_tagged(Kind::Toggle, b"not json").await;
    assert!(inbox.0.lock().unwrap().is_empty());

    inbound.accept(Kind::Toggle, Some(&other), Some(&message_id), &body).await;
    assert_eq!(inbox.toggles(), vec![(other.parse().unwrap(), Uuid::nil(), Some(2))]);
}
