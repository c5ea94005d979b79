use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MessagingError;
use crate::messaging::envelope::{self, Kind, Payload};
use crate::messaging::{Inbound, Messaging, ReceiptHandler};

const BUS_CAPACITY: usize = 1024;

/// In-process fan-out carrying the same tagged JSON bodies as Redis pub/sub.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<(Kind, Arc<[u8]>)>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self { tx: broadcast::channel(BUS_CAPACITY).0 }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Kind, Arc<[u8]>)> {
        self.tx.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalMessaging {
    bus: LocalBus,
    sender_id: Uuid,
    inbound: Arc<Inbound>,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalMessaging {
    /// Subscribes before returning, so nothing published afterwards is missed.
    pub fn connect(name: &str, bus: &LocalBus, sender_id: Uuid) -> Self {
        let inbound = Arc::new(Inbound::new(name, sender_id));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(bus.subscribe(), inbound.clone(), cancel.clone()));

        Self {
            bus: bus.clone(),
            sender_id,
            inbound,
            cancel,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }
}

async fn run(mut rx: broadcast::Receiver<(Kind, Arc<[u8]>)>, inbound: Arc<Inbound>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok((kind, bytes)) => inbound.accept_tagged(kind, &bytes).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "local bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[async_trait]
impl Messaging for LocalMessaging {
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
        // No subscribers is not a failure.
        let _ = self.bus.tx.send((payload.kind(), bytes.into()));
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
