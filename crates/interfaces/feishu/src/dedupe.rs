use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use diarist_config::IngestConfig;
use lru::LruCache;

/// Drops platform redeliveries: an event id seen within `ttl` is a
/// duplicate.  Bounded to the most recently seen `capacity` ids.
pub struct EventDeduper {
    seen: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl EventDeduper {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.dedupe_capacity,
            Duration::from_secs(config.dedupe_ttl_secs),
        )
    }

    /// `true` the first time `event_id` is seen within the window.
    pub fn first_seen(&self, event_id: &str) -> bool {
        self.first_seen_at(event_id, Instant::now())
    }

    pub fn first_seen_at(&self, event_id: &str, now: Instant) -> bool {
        if event_id.is_empty() {
            return true;
        }
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let recent = seen
            .get(event_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.ttl);
        if recent {
            return false;
        }
        seen.put(event_id.to_string(), now);
        true
    }
}
