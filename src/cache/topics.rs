//! Per-entity topic subscriptions
//!
//! Callbacks are invoked in registration order. `fire` snapshots the matching
//! subscribers and drops `once` entries before the caller invokes anything, so
//! a callback may subscribe or unsubscribe without deadlocking.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::event::Event;
use crate::game::GameState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The entity became ready (first snapshot applied)
    Ready,
    /// A confirmed create event arrived
    CreateEvent,
    /// A confirmed non-create event arrived
    Event,
    /// The event lists changed; derived state may differ
    Update,
}

/// Payload handed to subscribers
#[derive(Debug, Clone)]
pub enum Notification {
    Ready,
    CreateEvent(Arc<Event>),
    Event(Arc<Event>),
    /// Fresh derived state, when the entity has been created
    Update(Option<Arc<GameState>>),
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::Ready => Topic::Ready,
            Notification::CreateEvent(_) => Topic::CreateEvent,
            Notification::Event(_) => Topic::Event,
            Notification::Update(_) => Topic::Update,
        }
    }
}

pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

pub type SubscriptionId = u64;

struct Entry {
    id: SubscriptionId,
    topic: Topic,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
pub struct Topics {
    entries: SmallVec<[Entry; 4]>,
    next_id: SubscriptionId,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: Topic, once: bool, callback: Callback) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Entry {
            id,
            topic,
            once,
            callback,
        });
        id
    }

    /// Remove a subscription; returns whether it was still registered
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Callbacks to run for `topic`, in registration order.
    ///
    /// `once` entries are unregistered here; their ids are returned alongside
    /// so the caller can settle leak accounting.
    pub fn fire(&mut self, topic: Topic) -> (Vec<Callback>, Vec<SubscriptionId>) {
        let callbacks = self
            .entries
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.callback.clone())
            .collect();

        let mut fired_once = Vec::new();
        self.entries.retain(|e| {
            if e.topic == topic && e.once {
                fired_once.push(e.id);
                false
            } else {
                true
            }
        });

        (callbacks, fired_once)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every subscription, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
