//! Compare-and-swap cell store
//!
//! Each key owns a versioned slot. A transaction reads a snapshot, runs the
//! caller's function outside any lock, then commits only if the slot version
//! is still the one it read; otherwise it retries against the fresh value.
//! Keys never share a lock, so transactions on different keys do not block
//! each other.

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Default retry budget before a transaction gives up
pub const DEFAULT_MAX_RETRIES: u32 = 64;

/// Decision returned by a transaction function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tx<V> {
    /// Leave the current value untouched (no-op resolution)
    Keep,
    /// Replace the current value
    Set(V),
}

/// Outcome of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult<V> {
    /// Value in the slot once the transaction resolved
    pub value: Option<V>,
    /// Whether this transaction wrote the value
    pub committed: bool,
    /// Slot version after resolution
    pub version: u64,
    /// Conflicts observed before resolving
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CasError {
    #[error("Transaction abandoned after {0} conflicting retries")]
    Contention(u32),
}

#[derive(Debug)]
struct Slot<V> {
    version: u64,
    value: Option<V>,
}

pub struct CasStore<K, V> {
    slots: RwLock<HashMap<K, Arc<Mutex<Slot<V>>>>>,
    max_retries: u32,
}

impl<K, V> CasStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            max_retries,
        }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<Slot<V>>> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    version: 0,
                    value: None,
                }))
            })
            .clone()
    }

    /// Current value, if any
    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.read().get(key).cloned()?;
        let value = slot.lock().value.clone();
        value
    }

    /// Atomically transform the value under `key`
    ///
    /// `f` receives the current value and may be called more than once when
    /// another writer commits in between, so it must be free of side effects.
    pub fn transact<F>(&self, key: &K, mut f: F) -> Result<TxResult<V>, CasError>
    where
        F: FnMut(Option<&V>) -> Tx<V>,
    {
        let slot = self.slot(key);
        let mut retries = 0;

        loop {
            let (version, snapshot) = {
                let guard = slot.lock();
                (guard.version, guard.value.clone())
            };

            match f(snapshot.as_ref()) {
                Tx::Keep => {
                    return Ok(TxResult {
                        value: snapshot,
                        committed: false,
                        version,
                        retries,
                    });
                }
                Tx::Set(next) => {
                    let mut guard = slot.lock();
                    if guard.version == version {
                        guard.version += 1;
                        guard.value = Some(next.clone());
                        return Ok(TxResult {
                            value: Some(next),
                            committed: true,
                            version: guard.version,
                            retries,
                        });
                    }
                }
            }

            retries += 1;
            debug!("CAS conflict, retry {}", retries);
            if retries > self.max_retries {
                return Err(CasError::Contention(retries));
            }
        }
    }

    /// Snapshot of every entry whose key matches `filter`
    pub fn scan<P>(&self, filter: P) -> Vec<(K, V)>
    where
        P: Fn(&K) -> bool,
    {
        let slots: Vec<(K, Arc<Mutex<Slot<V>>>)> = self
            .slots
            .read()
            .iter()
            .filter(|(key, _)| filter(key))
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let value = slot.lock().value.clone();
                value.map(|v| (key, v))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for CasStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
