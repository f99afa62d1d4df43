//! Bounded TTL cache mapping idempotency keys to prior results.
//!
//! The queue delivers possibly-many times; this cache turns redelivery into
//! at-most-one execution. Eviction is by insertion order once the capacity is
//! exceeded; entries also lapse after the TTL.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

use {
    octo_common::Clock,
    octo_protocol::{CommandResult, IDEMPOTENCY_CAPACITY, IDEMPOTENCY_TTL_SECS},
};

struct Entry {
    result: CommandResult,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Keys in insertion order; stale keys are swept on put.
    order: VecDeque<String>,
}

pub struct IdempotencyCache {
    capacity: usize,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl IdempotencyCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(
            IDEMPOTENCY_CAPACITY,
            chrono::Duration::seconds(IDEMPOTENCY_TTL_SECS),
            clock,
        )
    }

    pub fn with_limits(capacity: usize, ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            ttl,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The cached result for `key`, verbatim. Expired entries miss.
    pub fn get(&self, key: &str) -> Option<CommandResult> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        match inner.entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.result.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            },
            None => None,
        }
    }

    pub fn put(&self, key: String, result: CommandResult) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        let Inner { entries, order } = &mut *inner;
        entries.retain(|_, entry| now < entry.expires_at);
        order.retain(|k| entries.contains_key(k) && *k != key);

        entries.insert(
            key.clone(),
            Entry {
                result,
                expires_at: now + self.ttl,
            },
        );
        order.push_back(key);

        while entries.len() > self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    entries.remove(&oldest);
                },
                None => break,
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, octo_common::ManualClock};

    fn cache(capacity: usize) -> (IdempotencyCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::start_now());
        (
            IdempotencyCache::with_limits(
                capacity,
                chrono::Duration::hours(24),
                Arc::clone(&clock) as Arc<dyn Clock>,
            ),
            clock,
        )
    }

    #[test]
    fn hit_returns_result_verbatim() {
        let (cache, _clock) = cache(10);
        cache.put(
            "k".into(),
            CommandResult::ok("cmd-1", "done").with_meta(serde_json::json!({"port": 4096})),
        );
        let hit = cache.get("k").unwrap();
        assert_eq!(hit.command_id, "cmd-1");
        assert_eq!(hit.meta.unwrap()["port"], 4096);
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn entries_lapse_after_ttl() {
        let (cache, clock) = cache(10);
        cache.put("k".into(), CommandResult::ok("cmd-1", "done"));
        clock.advance(chrono::Duration::hours(23));
        assert!(cache.get("k").is_some());
        clock.advance(chrono::Duration::hours(2));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn eviction_is_oldest_first() {
        let (cache, _clock) = cache(2);
        cache.put("a".into(), CommandResult::ok("cmd-a", "a"));
        cache.put("b".into(), CommandResult::ok("cmd-b", "b"));
        cache.put("c".into(), CommandResult::ok("cmd-c", "c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn reinsert_refreshes_position() {
        let (cache, _clock) = cache(2);
        cache.put("a".into(), CommandResult::ok("cmd-a", "a"));
        cache.put("b".into(), CommandResult::ok("cmd-b", "b"));
        // Overwriting `a` makes `b` the oldest entry.
        cache.put("a".into(), CommandResult::ok("cmd-a2", "a2"));
        cache.put("c".into(), CommandResult::ok("cmd-c", "c"));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().command_id, "cmd-a2");
    }
}
