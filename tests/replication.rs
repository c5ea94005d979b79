mod common;

use std::sync::Arc;
use std::time::Duration;

use staffchat::messaging::envelope::split_tagged;
use staffchat::messaging::{Envelope, Kind, LocalBus, Payload, ReceiptHandler};
use staffchat::model::{CONSOLE_ID, Level, PostResult, ServerIdentity, now_millis};
use tokio::sync::broadcast;
use uuid::Uuid;

use common::{eventually, identity, local, relay, sqlite};

/// Who published each frame still buffered in `frames`.
fn senders(frames: &mut broadcast::Receiver<(Kind, Arc<[u8]>)>) -> Vec<Uuid> {
    let mut senders = Vec::new();
    while let Ok((_, bytes)) = frames.try_recv() {
        let (sender, _, _) = split_tagged(&bytes).unwrap();
        senders.push(sender.unwrap().parse().unwrap());
    }
    senders
}

#[tokio::test]
async fn post_reaches_peer_over_bus() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();

    let a_id = identity("alpha");
    let b_id = identity("beta");
    let a_store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let b_store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let a_bus = local("bus", &bus, &a_id);
    let b_bus = local("bus", &bus, &b_id);
    let a = relay(a_id, vec![a_store], vec![a_bus]);
    let b = relay(b_id, vec![b_store.clone()], vec![b_bus]);

    let player = Uuid::new_v4();
    let post = a.coordinator.send_chat(player, 1, "hello").await.unwrap();
    assert_eq!(post.server_name, "alpha");
    assert_eq!(post.level_name, "ALL");

    eventually("beta presents the post", || b.presenter.posts().len() == 1).await;
    let received = &b.presenter.posts()[0];
    assert_eq!(received.id, post.id);
    assert_eq!(received.server_id, post.server_id);
    assert_eq!(received.message, "hello");

    let history = b_store.get_by_player(player, 1).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].server_id, post.server_id);

    // our own echo never comes back
    assert_eq!(a.presenter.posts().len(), 1);
    assert_eq!(a.coordinator.sent(), 1);
    assert_eq!(b.coordinator.received(), 1);
}

#[tokio::test]
async fn duplicate_delivery_is_applied_once() {
    let dir = tempfile::tempdir().unwrap();
    let b_id = identity("beta");
    let store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let b = relay(b_id, vec![store.clone()], vec![]);

    let post = PostResult {
        id: 41,
        long_server_id: 9,
        server_id: Uuid::new_v4(),
        server_name: "alpha".to_owned(),
        long_player_id: 3,
        player_id: Uuid::new_v4(),
        level: 1,
        level_name: "ALL".to_owned(),
        message: "twice".to_owned(),
        date: 1_700_000_000_000,
    };
    let envelope = Envelope { sender: Uuid::new_v4(), message_id: Uuid::new_v4(), payload: Payload::Post(post.clone()) };

    b.coordinator.on_envelope(envelope.clone(), "bus").await;
    b.coordinator.on_envelope(envelope, "bus").await;
    assert_eq!(b.presenter.posts().len(), 1);

    // same post relayed under a different message id
    let relayed = Envelope { sender: Uuid::new_v4(), message_id: Uuid::new_v4(), payload: Payload::Post(post) };
    b.coordinator.on_envelope(relayed, "other").await;
    assert_eq!(b.presenter.posts().len(), 1);
    assert_eq!(b.coordinator.received(), 1);
}

#[tokio::test]
async fn replayed_envelope_leaves_storage_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let b_id = identity("beta");
    let store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let b = relay(b_id, vec![store.clone()], vec![]);

    let player = Uuid::new_v4();
    let post = Envelope {
        sender: Uuid::new_v4(),
        message_id: Uuid::new_v4(),
        payload: Payload::Post(PostResult {
            id: 7,
            long_server_id: 4,
            server_id: Uuid::new_v4(),
            server_name: "alpha".to_owned(),
            long_player_id: 12,
            player_id: player,
            level: 1,
            level_name: "ALL".to_owned(),
            message: "only once".to_owned(),
            date: now_millis(),
        }),
    };
    let level = Envelope {
        sender: Uuid::new_v4(),
        message_id: Uuid::new_v4(),
        payload: Payload::Level(Level { level: 5, name: "MOD".to_owned() }),
    };
    b.coordinator.on_envelope(post.clone(), "bus").await;
    b.coordinator.on_envelope(level.clone(), "bus").await;

    // a local change after delivery must survive the replay
    store.set_level(5, "MODERATOR").await.unwrap();
    let history = store.get_by_player(player, 1).await.unwrap();
    let levels = store.get_levels().await.unwrap();
    let long_player_id = store.get_long_player_id(player).await.unwrap();

    b.coordinator.on_envelope(post, "bus").await;
    b.coordinator.on_envelope(level, "other").await;

    assert_eq!(store.get_by_player(player, 1).await.unwrap(), history);
    assert_eq!(store.get_levels().await.unwrap(), levels);
    assert!(levels.contains(&Level { level: 5, name: "MODERATOR".to_owned() }), "{levels:?}");
    assert_eq!(store.get_long_player_id(player).await.unwrap(), long_player_id);
    assert_eq!(history.len(), 1);
    assert_eq!(b.presenter.posts().len(), 1);
}

#[tokio::test]
async fn shared_storage_is_caught_up_by_polling() {
    let dir = tempfile::tempdir().unwrap();
    let a_id = identity("alpha");
    let b_id = identity("beta");
    let a_store = sqlite(dir.path(), "shared.db", "sqlite", &a_id).await;
    let b_store = sqlite(dir.path(), "shared.db", "sqlite", &b_id).await;
    let a = relay(a_id, vec![a_store], vec![]);
    let b = relay(b_id, vec![b_store], vec![]);

    let post = a.coordinator.send_chat(CONSOLE_ID, 1, "via the database").await.unwrap();

    assert_eq!(b.coordinator.poll_once().await, 1);
    assert_eq!(b.presenter.posts()[0].id, post.id);
    assert_eq!(b.presenter.posts()[0].server_name, "alpha");
    assert_eq!(b.coordinator.poll_once().await, 0);

    // a server never polls back its own posts
    assert_eq!(a.coordinator.poll_once().await, 0);
    assert_eq!(a.presenter.posts().len(), 1);
}

#[tokio::test]
async fn level_changes_and_toggles_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let a_id = identity("alpha");
    let b_id = identity("beta");
    let a_store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let b_store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let a_bus = local("bus", &bus, &a_id);
    let b_bus = local("bus", &bus, &b_id);
    let a = relay(a_id, vec![a_store], vec![a_bus]);
    let b = relay(b_id, vec![b_store], vec![b_bus]);

    a.coordinator.set_level(5, "MOD").await.unwrap();
    let player = Uuid::new_v4();
    a.coordinator.toggle_chat(player, Some(5)).await.unwrap();

    eventually("beta hears the toggle", || b.presenter.toggles() == vec![(player, Some(5))]).await;
    let levels = b.coordinator.get_levels().await.unwrap();
    assert!(levels.iter().any(|l| l.level == 5 && l.name == "MOD"), "{levels:?}");

    a.coordinator.toggle_chat(player, None).await.unwrap();
    eventually("beta hears the toggle off", || b.presenter.toggles().last() == Some(&(player, None))).await;
}

#[tokio::test]
async fn level_rename_reaches_every_storage() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let a_id = identity("alpha");
    let b_id = identity("beta");
    let first = sqlite(dir.path(), "a1.db", "first", &a_id).await;
    let second = sqlite(dir.path(), "a2.db", "second", &a_id).await;
    let b_store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let a_bus = local("bus", &bus, &a_id);
    let b_bus = local("bus", &bus, &b_id);
    let a = relay(a_id, vec![first.clone(), second.clone()], vec![a_bus]);
    let b = relay(b_id, vec![b_store.clone()], vec![b_bus]);

    a.coordinator.set_level(5, "MOD").await.unwrap();
    a.coordinator.set_level(5, "MODS").await.unwrap();
    // the bus is ordered, so once the toggle lands both level events have too
    let player = Uuid::new_v4();
    a.coordinator.toggle_chat(player, Some(5)).await.unwrap();
    eventually("beta hears the toggle", || b.presenter.toggles().len() == 1).await;

    for storage in [&first, &second, &b_store] {
        let levels = storage.get_levels().await.unwrap();
        let named: Vec<&str> = levels.iter().filter(|l| l.level == 5).map(|l| l.name.as_str()).collect();
        assert_eq!(named, ["MODS"], "{}: {levels:?}", storage.name());
    }
    assert!(b.coordinator.get_levels().await.unwrap().contains(&Level { level: 5, name: "MODS".to_owned() }));
}

#[tokio::test]
async fn relay_does_not_republish_to_its_origin() {
    let dir = tempfile::tempdir().unwrap();
    let west = LocalBus::new();
    let east = LocalBus::new();
    let mut west_frames = west.subscribe();
    let mut east_frames = east.subscribe();

    let a_id = identity("alpha");
    let b_id = identity("bridge");
    let c_id = identity("gamma");
    let (alpha, bridge) = (a_id.id, b_id.id);
    let a_store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let b_store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let c_store = sqlite(dir.path(), "c.db", "sqlite", &c_id).await;
    let a_west = local("west", &west, &a_id);
    let b_west = local("west", &west, &b_id);
    let b_east = local("east", &east, &b_id);
    let c_east = local("east", &east, &c_id);
    let a = relay(a_id, vec![a_store], vec![a_west]);
    let _b = relay(b_id, vec![b_store], vec![b_west, b_east]);
    let c = relay(c_id, vec![c_store], vec![c_east]);

    a.coordinator.send_chat(Uuid::new_v4(), 1, "one way").await.unwrap();
    eventually("gamma presents the post", || c.presenter.posts().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // alpha also announces its new player, and the bridge forwards that too
    let west_senders = senders(&mut west_frames);
    assert!(!west_senders.is_empty());
    assert!(west_senders.iter().all(|sender| *sender == alpha), "bridge echoed onto west");
    let east_senders = senders(&mut east_frames);
    assert!(!east_senders.is_empty());
    assert!(east_senders.iter().all(|sender| *sender == bridge));
}

#[tokio::test]
async fn posts_flood_across_bridged_buses() {
    let dir = tempfile::tempdir().unwrap();
    let west = LocalBus::new();
    let east = LocalBus::new();

    let a_id = identity("alpha");
    let b_id = identity("bridge");
    let c_id = identity("gamma");
    let a_store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let b_store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let c_store = sqlite(dir.path(), "c.db", "sqlite", &c_id).await;
    let a_west = local("west", &west, &a_id);
    let b_west = local("west", &west, &b_id);
    let b_east = local("east", &east, &b_id);
    let c_east = local("east", &east, &c_id);
    let a = relay(a_id, vec![a_store], vec![a_west]);
    let b = relay(b_id, vec![b_store], vec![b_west, b_east]);
    let c = relay(c_id, vec![c_store.clone()], vec![c_east]);

    let player = Uuid::new_v4();
    let post = a.coordinator.send_chat(player, 1, "over the bridge").await.unwrap();

    eventually("gamma presents the post", || c.presenter.posts().len() == 1).await;
    assert_eq!(c.presenter.posts()[0].server_id, post.server_id);
    eventually("bridge presents the post", || b.presenter.posts().len() == 1).await;
    assert_eq!(c_store.get_by_player(player, 1).await.unwrap().len(), 1);

    // nothing loops back to the origin
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.presenter.posts().len(), 1);
    assert_eq!(c.presenter.posts().len(), 1);
}

#[tokio::test]
async fn new_players_keep_their_surrogate_on_peers() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let a_id = identity("alpha");
    let b_id = identity("beta");
    let a_store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let b_store = sqlite(dir.path(), "b.db", "sqlite", &b_id).await;
    let a_bus = local("bus", &bus, &a_id);
    let b_bus = local("bus", &bus, &b_id);
    let a = relay(a_id, vec![a_store.clone()], vec![a_bus]);
    let b = relay(b_id, vec![b_store.clone()], vec![b_bus]);

    let player = Uuid::new_v4();
    a.coordinator.send_chat(player, 1, "first words").await.unwrap();
    eventually("beta presents the post", || b.presenter.posts().len() == 1).await;

    let on_a = a_store.get_long_player_id(player).await.unwrap();
    let on_b = b_store.get_long_player_id(player).await.unwrap();
    assert_eq!(on_a, on_b);
}

#[tokio::test]
async fn primary_failure_falls_over_then_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let a_id = identity("alpha");
    let first = sqlite(dir.path(), "first.db", "first", &a_id).await;
    let second = sqlite(dir.path(), "second.db", "second", &a_id).await;
    let a = relay(a_id, vec![first.clone(), second.clone()], vec![]);

    first.close().await;
    let post = a.coordinator.send_chat(CONSOLE_ID, 1, "still here").await.unwrap();
    assert_eq!(second.get_by_player(CONSOLE_ID, 1).await.unwrap()[0].id, post.id);

    second.close().await;
    let err = a.coordinator.send_chat(CONSOLE_ID, 1, "gone").await.unwrap_err();
    assert!(err.is_hard());
}

#[tokio::test]
async fn rejects_bad_input_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let a_id = identity("alpha");
    let store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let a = relay(a_id, vec![store.clone()], vec![]);

    assert!(a.coordinator.send_chat(CONSOLE_ID, 200, "x").await.unwrap_err().is_invalid());
    assert!(a.coordinator.send_chat(CONSOLE_ID, 1, "   ").await.unwrap_err().is_invalid());
    assert!(a.coordinator.set_level(3, "").await.unwrap_err().is_invalid());
    assert!(a.coordinator.toggle_chat(CONSOLE_ID, Some(128)).await.unwrap_err().is_invalid());
    // level 9 was never created
    assert!(a.coordinator.send_chat(CONSOLE_ID, 9, "x").await.unwrap_err().is_invalid());
    assert!(store.get_by_player(CONSOLE_ID, 1).await.unwrap().is_empty());
    assert!(a.presenter.posts().is_empty());
}

#[tokio::test]
async fn announce_renames_every_storage_despite_failures() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let old = identity("alpha");
    let first = sqlite(dir.path(), "first.db", "first", &old).await;
    let second = sqlite(dir.path(), "second.db", "second", &old).await;
    let messaging = local("bus", &bus, &old);
    messaging.close().await;

    let renamed = ServerIdentity { id: old.id, name: "alpha-2".to_owned() };
    let a = relay(renamed, vec![first.clone(), second.clone()], vec![messaging]);

    assert!(a.coordinator.announce_servers().await.is_err());
    assert_eq!(first.server().await.name, "alpha-2");
    assert_eq!(second.server().await.name, "alpha-2");
}

#[tokio::test]
async fn close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let a_id = identity("alpha");
    let store = sqlite(dir.path(), "a.db", "sqlite", &a_id).await;
    let messaging = local("bus", &bus, &a_id);
    let a = relay(a_id, vec![store.clone()], vec![messaging.clone()]);

    a.coordinator.close().await;
    a.coordinator.close().await;
    assert!(a.coordinator.is_closed());
    assert!(store.is_closed());
    assert!(messaging.is_closed());
}
