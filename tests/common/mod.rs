//! Shared helpers: in-process relays over temp SQLite files and a presenter
//! that records what reaches it.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use staffchat::config::StorageKind;
use staffchat::coordinator::Coordinator;
use staffchat::messaging::{LocalBus, LocalMessaging, Messaging};
use staffchat::model::{ChatPost, ServerIdentity};
use staffchat::presentation::PresentationHandler;
use staffchat::storage::{self, PoolSettings, Storage};
use uuid::Uuid;

#[derive(Default)]
pub struct RecordingPresenter {
    pub posts: Mutex<Vec<ChatPost>>,
    pub toggles: Mutex<Vec<(Uuid, Option<u8>)>>,
}

impl RecordingPresenter {
    pub fn posts(&self) -> Vec<ChatPost> {
        self.posts.lock().unwrap().clone()
    }

    pub fn toggles(&self) -> Vec<(Uuid, Option<u8>)> {
        self.toggles.lock().unwrap().clone()
    }
}

impl PresentationHandler for RecordingPresenter {
    fn handle(&self, post: &ChatPost) {
        self.posts.lock().unwrap().push(post.clone());
    }

    fn toggle(&self, player_id: Uuid, level: Option<u8>) {
        self.toggles.lock().unwrap().push((player_id, level));
    }
}

pub struct Relay {
    pub coordinator: Arc<Coordinator>,
    pub presenter: Arc<RecordingPresenter>,
}

pub fn identity(name: &str) -> ServerIdentity {
    ServerIdentity { id: Uuid::new_v4(), name: name.to_owned() }
}

pub fn pool() -> PoolSettings {
    PoolSettings { min_idle: 1, max_pool_size: 2, ..PoolSettings::default() }
}

pub async fn sqlite(dir: &Path, file: &str, name: &str, identity: &ServerIdentity) -> Arc<dyn Storage> {
    let kind = StorageKind::Sqlite { file: dir.join(file), prefix: "staffchat_".to_owned() };
    storage::connect(name, &kind, &pool(), identity).await.unwrap()
}

pub fn local(name: &str, bus: &LocalBus, identity: &ServerIdentity) -> Arc<dyn Messaging> {
    Arc::new(LocalMessaging::connect(name, bus, identity.id))
}

pub fn relay(identity: ServerIdentity, storages: Vec<Arc<dyn Storage>>, messaging: Vec<Arc<dyn Messaging>>) -> Relay {
    let presenter = Arc::new(RecordingPresenter::default());
    let coordinator = Coordinator::new(identity, storages, messaging, presenter.clone());
    Relay { coordinator, presenter }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(description: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
