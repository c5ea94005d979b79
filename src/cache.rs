use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::PostKey;

pub const MESSAGE_IDLE: Duration = Duration::from_secs(5 * 60);
pub const MESSAGE_LIFETIME: Duration = Duration::from_secs(10 * 60);
pub const POST_IDLE: Duration = Duration::from_secs(2 * 60);
pub const POST_LIFETIME: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy)]
struct Stamp {
    written: Instant,
    accessed: Instant,
}

/// Concurrent set whose members expire after `idle` without access or
/// `lifetime` after being written, whichever comes first.
///
/// Membership test and insert happen under the map's shard lock, so two
/// callers racing on the same key see exactly one successful `insert`.
#[derive(Debug)]
pub struct TtlSet<K: Eq + Hash> {
    entries: DashMap<K, Stamp>,
    idle: Duration,
    lifetime: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> TtlSet<K> {
    pub fn new(idle: Duration, lifetime: Duration) -> Self {
        Self::with_capacity(idle, lifetime, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(idle: Duration, lifetime: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            idle,
            lifetime,
            capacity: capacity.max(1),
        }
    }

    fn live(&self, stamp: &Stamp, now: Instant) -> bool {
        now.duration_since(stamp.accessed) < self.idle && now.duration_since(stamp.written) < self.lifetime
    }

    /// Marks `key` as seen. Returns `true` if it was not already a live member.
    pub fn insert(&self, key: K) -> bool {
        let now = Instant::now();
        let fresh = match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if self.live(entry.get(), now) {
                    entry.get_mut().accessed = now;
                    false
                } else {
                    *entry.get_mut() = Stamp { written: now, accessed: now };
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Stamp { written: now, accessed: now });
                true
            }
        };

        if fresh && self.entries.len() > self.capacity {
            self.evict(now);
        }
        fresh
    }

    /// Live membership test. Counts as an access.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        if let Some(mut stamp) = self.entries.get_mut(key) {
            if self.live(&stamp, now) {
                stamp.accessed = now;
                return true;
            }
        }
        self.entries.remove_if(key, |_, stamp| !self.live(stamp, now));
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every member that is no longer live.
    pub fn purge_expired(&self) {
        self.purge(Instant::now());
    }

    fn purge(&self, now: Instant) {
        self.entries.retain(|_, stamp| self.live(stamp, now));
    }

    fn evict(&self, now: Instant) {
        self.purge(now);
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().written)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// The two process-wide dedup sets shared by every replication path.
#[derive(Debug)]
pub struct IdentityCache {
    pub messages: TtlSet<Uuid>,
    pub posts: TtlSet<PostKey>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self {
            messages: TtlSet::new(MESSAGE_IDLE, MESSAGE_LIFETIME),
            posts: TtlSet::new(POST_IDLE, POST_LIFETIME),
        }
    }

    pub fn purge_expired(&self) {
        self.messages.purge_expired();
        self.posts.purge_expired();
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}
