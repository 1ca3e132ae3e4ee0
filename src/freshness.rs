//! Query throttling and recency tracking.
//!
//! Two independent checkers share one sharded store layout:
//!
//! - [`FrequencyChecker`] answers "may I send this query again?" and arms a
//!   cooldown every time it says yes.
//! - [`RecentTimeChecker`] remembers the newest timestamp seen for a key and
//!   never moves backwards, so out-of-order arrivals cannot regress it.
//!
//! Keys hash onto independent shards. A caller only ever holds the lock of the
//! shard owning its key, so unrelated keys never wait on each other.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    time::Duration,
};

use log::debug;
use parking_lot::Mutex;

use crate::protocol::{Document, EntityId, Meta};

const SHARD_COUNT: usize = 16;

struct Shards<K> {
    shards: Vec<Mutex<HashMap<K, u64>>>,
}

impl<K: Hash + Eq> Shards<K> {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, u64>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}

/// Cooldown checker.
pub struct FrequencyChecker<K> {
    records: Shards<K>,
    expires: u64,
}

impl<K: Hash + Eq + Clone> FrequencyChecker<K> {
    pub fn new(expires: Duration) -> Self {
        Self {
            records: Shards::new(),
            expires: expires.as_millis() as u64,
        }
    }

    /// Returns true and arms `cooldown_until = now + ttl` if no unexpired record
    /// exists or `force` is set. Otherwise returns false and changes nothing.
    pub fn should_query(&self, key: &K, now: u64, force: bool) -> bool {
        let mut records = self.records.shard(key).lock();
        if !force {
            if let Some(&cooldown_until) = records.get(key) {
                if cooldown_until > now {
                    return false;
                }
            }
        }
        records.insert(key.clone(), now.saturating_add(self.expires));
        true
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

/// Recency checker.
pub struct RecentTimeChecker<K> {
    records: Shards<K>,
}

impl<K: Hash + Eq + Clone> RecentTimeChecker<K> {
    pub fn new() -> Self {
        Self {
            records: Shards::new(),
        }
    }

    /// Stores `observed` only if it is strictly after the current value.
    pub fn record_seen(&self, key: &K, observed: u64) -> bool {
        let mut records = self.records.shard(key).lock();
        match records.get(key) {
            Some(&latest) if latest >= observed => false,
            _ => {
                records.insert(key.clone(), observed);
                true
            }
        }
    }

    /// True iff nothing was recorded or the stored value is not after `reference`.
    pub fn is_stale(&self, key: &K, reference: u64) -> bool {
        match self.records.shard(key).lock().get(key) {
            None => true,
            Some(&latest) => latest <= reference,
        }
    }

    pub fn latest(&self, key: &K) -> Option<u64> {
        self.records.shard(key).lock().get(key).copied()
    }
}

impl<K: Hash + Eq + Clone> Default for RecentTimeChecker<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Meta,
    Document,
    Members,
    /// Timeline of membership commands received for a group.
    GroupHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FreshnessKey {
    pub entity: EntityId,
    pub kind: QueryKind,
}

impl FreshnessKey {
    pub fn new(entity: &EntityId, kind: QueryKind) -> Self {
        Self {
            entity: entity.clone(),
            kind,
        }
    }

    pub fn meta(entity: &EntityId) -> Self {
        Self::new(entity, QueryKind::Meta)
    }

    pub fn document(entity: &EntityId) -> Self {
        Self::new(entity, QueryKind::Document)
    }

    pub fn members(group: &EntityId) -> Self {
        Self::new(group, QueryKind::Members)
    }

    pub fn history(group: &EntityId) -> Self {
        Self::new(group, QueryKind::GroupHistory)
    }
}

/// Per-client freshness state: cooldowns for outgoing queries plus the latest
/// timestamps seen for entity documents and group histories.
pub struct FreshnessRegistry {
    cooldowns: FrequencyChecker<FreshnessKey>,
    recent: RecentTimeChecker<FreshnessKey>,
}

impl FreshnessRegistry {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldowns: FrequencyChecker::new(cooldown),
            recent: RecentTimeChecker::new(),
        }
    }

    pub fn should_query(&self, key: &FreshnessKey, now: u64, force: bool) -> bool {
        self.cooldowns.should_query(key, now, force)
    }

    pub fn record_seen(&self, key: &FreshnessKey, observed: u64) -> bool {
        self.recent.record_seen(key, observed)
    }

    pub fn is_stale(&self, key: &FreshnessKey, reference: u64) -> bool {
        self.recent.is_stale(key, reference)
    }

    pub fn latest_seen(&self, key: &FreshnessKey) -> Option<u64> {
        self.recent.latest(key)
    }

    /// Forget every armed cooldown. Recency records are kept.
    pub fn reset_cooldowns(&self) {
        debug!("Resetting query cooldowns");
        self.cooldowns.clear();
    }

    pub fn needs_query_meta(&self, id: &EntityId, meta: Option<&Meta>) -> bool {
        !id.is_broadcast() && meta.is_none()
    }

    /// Documents are missing, or something newer than the local copy was announced.
    pub fn needs_query_documents(&self, id: &EntityId, documents: &[Document]) -> bool {
        if id.is_broadcast() {
            return false;
        }
        match documents.iter().map(|doc| doc.time).max() {
            None => true,
            Some(current) => !self.is_stale(&FreshnessKey::document(id), current),
        }
    }

    /// Roster is missing, or a membership change newer than `last_history`
    /// (time of the roster we hold) was announced.
    pub fn needs_query_members(
        &self,
        group: &EntityId,
        members: Option<&[EntityId]>,
        last_history: Option<u64>,
    ) -> bool {
        if group.is_broadcast() {
            return false;
        }
        if members.map_or(true, |m| m.is_empty()) {
            return true;
        }
        last_history.is_some_and(|held| !self.is_stale(&FreshnessKey::history(group), held))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn key() -> FreshnessKey {
        FreshnessKey::meta(&EntityId::user("alice", "moky"))
    }

    #[test]
    fn test_should_query_inside_cooldown() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        let first = registry.should_query(&key(), 1_000, false);
        let second = registry.should_query(&key(), 2_000, false);
        assert_eq!((first, second), (true, false));

        // Cooldown elapsed
        assert!(registry.should_query(&key(), 601_000, false));
    }

    #[test]
    fn test_should_query_forced() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        assert!(registry.should_query(&key(), 1_000, true));
        assert!(registry.should_query(&key(), 1_001, true));
    }

    #[test]
    fn test_refused_query_does_not_extend_cooldown() {
        let registry = FreshnessRegistry::new(Duration::from_millis(100));
        assert!(registry.should_query(&key(), 0, false));
        assert!(!registry.should_query(&key(), 99, false));
        assert!(registry.should_query(&key(), 100, false));
    }

    #[test]
    fn test_reset_cooldowns_keeps_recency() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        assert!(registry.should_query(&key(), 0, false));
        assert!(registry.record_seen(&key(), 5));

        registry.reset_cooldowns();
        assert!(registry.should_query(&key(), 1, false));
        assert_eq!(registry.latest_seen(&key()), Some(5));
    }

    #[test]
    fn test_record_seen_is_monotonic() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        let newer = registry.record_seen(&key(), 2_000);
        let older = registry.record_seen(&key(), 1_000);
        assert_eq!((newer, older), (true, false));
        assert!(!registry.record_seen(&key(), 2_000));
        assert_eq!(registry.latest_seen(&key()), Some(2_000));
    }

    #[test]
    fn test_is_stale() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        assert!(registry.is_stale(&key(), 0));

        registry.record_seen(&key(), 1_000);
        assert!(registry.is_stale(&key(), 1_000));
        assert!(registry.is_stale(&key(), 1_500));
        assert!(!registry.is_stale(&key(), 999));
    }

    #[test]
    fn test_needs_query_members() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        let group = EntityId::group("team", "moky");
        let alice = EntityId::user("alice", "moky");
        let roster = vec![alice];

        assert!(registry.needs_query_members(&group, None, None));
        assert!(registry.needs_query_members(&group, Some(&[]), None));
        assert!(!registry.needs_query_members(&EntityId::everyone(), None, None));
        assert!(!registry.needs_query_members(&group, Some(&roster), Some(10)));

        registry.record_seen(&FreshnessKey::history(&group), 20);
        assert!(registry.needs_query_members(&group, Some(&roster), Some(10)));
        assert!(!registry.needs_query_members(&group, Some(&roster), Some(20)));
        assert!(!registry.needs_query_members(&group, Some(&roster), None));
    }

    #[test]
    fn test_needs_query_documents() {
        let registry = FreshnessRegistry::new(Duration::from_secs(600));
        let alice = EntityId::user("alice", "moky");
        let visa = Document::new(alice.clone(), crate::protocol::DocumentType::Visa, 1_000);

        assert!(registry.needs_query_documents(&alice, &[]));
        assert!(!registry.needs_query_documents(&EntityId::everyone(), &[]));
        assert!(!registry.needs_query_documents(&alice, &[visa.clone()]));

        // A login announced a newer document
        registry.record_seen(&FreshnessKey::document(&alice), 2_000);
        assert!(registry.needs_query_documents(&alice, &[visa]));
    }

    #[test]
    fn test_concurrent_should_query_grants_once() {
        let registry = Arc::new(FreshnessRegistry::new(Duration::from_secs(600)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.should_query(&key(), 10, false))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }
}
