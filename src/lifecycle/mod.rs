//! Lifecycle policy layered over the entity cache
//!
//! - idle eviction: unsubscribed entities untouched for `idle_timeout`
//! - capacity bounds: separate LRU caps for resident entities and memoized
//!   derived states
//! - leak instrumentation: per-path subscribe/unsubscribe accounting

pub mod leak;
pub mod lru;

pub use leak::{LeakReport, LeakTracker, SubscriptionCounts};
pub use lru::LruIndex;

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{EntityCache, EntityPath};
use crate::config::CacheConfig;

pub struct Lifecycle {
    entities: LruIndex<EntityPath>,
    derived: LruIndex<EntityPath>,
    max_entities: usize,
    max_derived: usize,
    pub leaks: LeakTracker,
}

impl Lifecycle {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entities: LruIndex::new(),
            derived: LruIndex::new(),
            max_entities: config.max_entities.max(1),
            max_derived: config.max_derived_states.max(1),
            leaks: LeakTracker::new(config.leak_tracking, config.leak_tolerance),
        }
    }

    /// Record an access to a resident entity; returns entities over the cap
    pub fn touch_entity(&mut self, path: &EntityPath) -> Vec<EntityPath> {
        self.entities.touch(path);
        let mut evicted = Vec::new();
        while self.entities.len() > self.max_entities {
            match self.entities.pop_lru() {
                Some(lru) => evicted.push(lru),
                None => break,
            }
        }
        evicted
    }

    /// Record a derived-state computation; returns memos to drop
    pub fn touch_derived(&mut self, path: &EntityPath) -> Vec<EntityPath> {
        self.derived.touch(path);
        let mut evicted = Vec::new();
        while self.derived.len() > self.max_derived {
            match self.derived.pop_lru() {
                Some(lru) => evicted.push(lru),
                None => break,
            }
        }
        evicted
    }

    /// Forget `path` entirely (entity detached)
    pub fn remove(&mut self, path: &EntityPath) {
        self.entities.remove(path);
        self.derived.remove(path);
    }

    pub fn resident(&self) -> usize {
        self.entities.len()
    }

    pub fn memoized(&self) -> usize {
        self.derived.len()
    }
}

/// Periodically detach idle entities until the cache is dropped
pub fn spawn_idle_sweeper(cache: &Arc<EntityCache>, interval: Duration) -> JoinHandle<()> {
    let cache: Weak<EntityCache> = Arc::downgrade(cache);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        info!("Idle sweeper started (every {:?})", interval);
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let evicted = cache.sweep_idle();
            if !evicted.is_empty() {
                debug!("Idle sweep detached {} entities", evicted.len());
            }
        }
        debug!("Idle sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entities: usize, max_derived_states: usize) -> CacheConfig {
        CacheConfig {
            max_entities,
            max_derived_states,
            ..CacheConfig::default()
        }
    }

    fn path(id: &str) -> EntityPath {
        EntityPath::game(id).unwrap()
    }

    #[test]
    fn test_entity_cap_evicts_least_recent() {
        let mut lifecycle = Lifecycle::new(&config(2, 2));
        assert!(lifecycle.touch_entity(&path("a")).is_empty());
        assert!(lifecycle.touch_entity(&path("b")).is_empty());
        lifecycle.touch_entity(&path("a"));

        assert_eq!(lifecycle.touch_entity(&path("c")), vec![path("b")]);
        assert_eq!(lifecycle.resident(), 2);
    }

    #[test]
    fn test_derived_cap_is_separate() {
        let mut lifecycle = Lifecycle::new(&config(10, 1));
        lifecycle.touch_entity(&path("a"));
        lifecycle.touch_entity(&path("b"));
        assert!(lifecycle.touch_derived(&path("a")).is_empty());
        assert_eq!(lifecycle.touch_derived(&path("b")), vec![path("a")]);
        assert_eq!(lifecycle.resident(), 2);
        assert_eq!(lifecycle.memoized(), 1);

        lifecycle.remove(&path("b"));
        assert_eq!(lifecycle.memoized(), 0);
        assert_eq!(lifecycle.resident(), 1);
    }
}
