//! Subscription leak instrumentation
//!
//! Counts subscribe/unsubscribe calls per entity path. A path whose
//! outstanding count exceeds the tolerance is reported with `warn!`.
//! Disabled trackers record nothing.

use hashbrown::HashMap;
use tracing::warn;

use crate::cache::EntityPath;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionCounts {
    pub subscribed: u64,
    pub unsubscribed: u64,
}

impl SubscriptionCounts {
    pub fn outstanding(&self) -> u64 {
        self.subscribed.saturating_sub(self.unsubscribed)
    }
}

/// A path holding more subscriptions than tolerated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub path: EntityPath,
    pub outstanding: u64,
    pub tolerance: usize,
}

#[derive(Debug)]
pub struct LeakTracker {
    enabled: bool,
    tolerance: usize,
    counts: HashMap<EntityPath, SubscriptionCounts>,
}

impl LeakTracker {
    pub fn new(enabled: bool, tolerance: usize) -> Self {
        Self {
            enabled,
            tolerance,
            counts: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_subscribe(&mut self, path: &EntityPath) {
        if self.enabled {
            self.counts.entry(path.clone()).or_default().subscribed += 1;
        }
    }

    pub fn record_unsubscribe(&mut self, path: &EntityPath, count: u64) {
        if self.enabled {
            self.counts.entry(path.clone()).or_default().unsubscribed += count;
        }
    }

    pub fn counts(&self, path: &EntityPath) -> SubscriptionCounts {
        self.counts.get(path).copied().unwrap_or_default()
    }

    /// Report `path` if its outstanding subscriptions exceed the tolerance
    pub fn check(&self, path: &EntityPath) -> Option<LeakReport> {
        let outstanding = self.counts.get(path)?.outstanding();
        if outstanding <= self.tolerance as u64 {
            return None;
        }
        warn!(
            "Possible subscription leak on {}: {} outstanding (tolerance {})",
            path, outstanding, self.tolerance
        );
        Some(LeakReport {
            path: path.clone(),
            outstanding,
            tolerance: self.tolerance,
        })
    }

    /// Every path currently over tolerance
    pub fn leaks(&self) -> Vec<LeakReport> {
        let mut paths: Vec<&EntityPath> = self.counts.keys().collect();
        paths.sort();
        paths.into_iter().filter_map(|path| self.check(path)).collect()
    }

    pub fn forget(&mut self, path: &EntityPath) {
        self.counts.remove(path);
    }
}
