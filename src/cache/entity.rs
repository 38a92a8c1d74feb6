//! Client-side entity: confirmed and optimistic event lists plus the memo
//!
//! Event lists are `Arc<Vec<Event>>` and are never mutated in place; every
//! change allocates a new list. The derived-state memo is keyed on the
//! pointer identity of the lists it was computed from.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::path::EntityPath;
use crate::cache::topics::Topics;
use crate::event::{Event, EventId};
use crate::game::{replay, GameState};

pub type EntityHandle = Arc<Mutex<Entity>>;

struct Derived {
    create: Option<Arc<Event>>,
    confirmed: Arc<Vec<Event>>,
    optimistic: Arc<Vec<Event>>,
    state: Option<Arc<GameState>>,
}

impl Derived {
    fn computed_from(&self, entity: &Entity) -> bool {
        let same_create = match (&self.create, &entity.create_event) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_create
            && Arc::ptr_eq(&self.confirmed, &entity.confirmed)
            && Arc::ptr_eq(&self.optimistic, &entity.optimistic)
    }
}

pub struct Entity {
    path: EntityPath,
    create_event: Option<Arc<Event>>,
    confirmed: Arc<Vec<Event>>,
    optimistic: Arc<Vec<Event>>,
    ready_tx: watch::Sender<bool>,
    derived: Option<Derived>,
    pub(crate) topics: Topics,
    pub(crate) attached: bool,
    pub(crate) attaching: bool,
    /// Bumped on every successful attach; a pump only clears `attached`
    /// for the attach that spawned it
    pub(crate) attach_generation: u64,
    pub(crate) pump: Option<JoinHandle<()>>,
    last_activity: Instant,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("path", &self.path)
            .field("attached", &self.attached)
            .field("attaching", &self.attaching)
            .finish_non_exhaustive()
    }
}

impl Entity {
    pub fn new(path: EntityPath) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            path,
            create_event: None,
            confirmed: Arc::new(Vec::new()),
            optimistic: Arc::new(Vec::new()),
            ready_tx,
            derived: None,
            topics: Topics::new(),
            attached: false,
            attaching: false,
            attach_generation: 0,
            pump: None,
            last_activity: Instant::now(),
        }
    }

    pub fn path(&self) -> &EntityPath {
        &self.path
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Receiver that observes the `ready` flag
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn create_event(&self) -> Option<&Arc<Event>> {
        self.create_event.as_ref()
    }

    pub fn confirmed(&self) -> Arc<Vec<Event>> {
        self.confirmed.clone()
    }

    pub fn optimistic(&self) -> Arc<Vec<Event>> {
        self.optimistic.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.topics.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Apply the history received on join; returns true if this made the
    /// entity ready
    pub(crate) fn apply_snapshot(&mut self, history: Vec<Event>) -> bool {
        let mut rest = Vec::with_capacity(history.len());
        for event in history {
            if event.is_create() {
                self.set_create(event);
            } else {
                rest.push(event);
            }
        }

        self.reconcile(rest.iter().map(|e| e.id));
        self.confirmed = Arc::new(rest);

        let was_ready = self.ready_tx.send_replace(true);
        !was_ready
    }

    /// Merge one confirmed event
    pub(crate) fn apply_confirmed(&mut self, event: Event) {
        let id = event.id;
        if event.is_create() {
            self.set_create(event);
        } else {
            let mut next = Vec::with_capacity(self.confirmed.len() + 1);
            next.extend(self.confirmed.iter().cloned());
            next.push(event);
            self.confirmed = Arc::new(next);
        }
        self.reconcile(std::iter::once(id));
    }

    pub(crate) fn push_optimistic(&mut self, event: Event) {
        let mut next = Vec::with_capacity(self.optimistic.len() + 1);
        next.extend(self.optimistic.iter().cloned());
        next.push(event);
        self.optimistic = Arc::new(next);
    }

    /// Drop an optimistic event whose submission failed
    pub(crate) fn rollback(&mut self, id: EventId) -> bool {
        if !self.optimistic.iter().any(|e| e.id == id) {
            return false;
        }
        self.optimistic = Arc::new(
            self.optimistic
                .iter()
                .filter(|e| e.id != id)
                .cloned()
                .collect(),
        );
        true
    }

    /// Memoized derived state; `None` until a create event is known
    pub fn derived_state(&mut self) -> Option<Arc<GameState>> {
        if let Some(memo) = &self.derived {
            if memo.computed_from(self) {
                return memo.state.clone();
            }
        }

        let state = replay(
            self.create_event.as_deref(),
            self.confirmed.iter().chain(self.optimistic.iter()),
        );
        let state = state.is_created().then(|| Arc::new(state));

        self.derived = Some(Derived {
            create: self.create_event.clone(),
            confirmed: self.confirmed.clone(),
            optimistic: self.optimistic.clone(),
            state: state.clone(),
        });
        state
    }

    pub(crate) fn clear_derived(&mut self) {
        self.derived = None;
    }

    fn set_create(&mut self, event: Event) {
        match &self.create_event {
            None => self.create_event = Some(Arc::new(event)),
            Some(existing) if existing.id == event.id => {}
            Some(_) => warn!("Ignoring second create event for {}", self.path),
        }
    }

    /// Remove optimistic events confirmed under any of `ids`
    fn reconcile(&mut self, ids: impl Iterator<Item = EventId>) {
        if self.optimistic.is_empty() {
            return;
        }
        let confirmed: Vec<EventId> = ids.collect();
        if !self.optimistic.iter().any(|e| confirmed.contains(&e.id)) {
            return;
        }
        self.optimistic = Arc::new(
            self.optimistic
                .iter()
                .filter(|e| !confirmed.contains(&e.id))
                .cloned()
                .collect(),
        );
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        Coord, CreateParams, EventKind, PuzzleDocument, Scope, ScopeParams, UpdateCellParams,
    };

    fn create() -> Event {
        Event::new(
            EventKind::Create(CreateParams {
                pid: "p".to_string(),
                puzzle: PuzzleDocument::from_rows(&["AB"]),
            }),
            None,
            1,
        )
    }

    fn fill(value: &str) -> Event {
        Event::new(
            EventKind::UpdateCell(UpdateCellParams {
                cell: Coord::new(0, 0),
                value: value.to_string(),
                pencil: false,
                autocheck: false,
            }),
            Some("u".to_string()),
            2,
        )
    }

    fn entity() -> Entity {
        Entity::new(EntityPath::game("g").unwrap())
    }

    #[test]
    fn test_snapshot_sets_ready_once() {
        let mut entity = entity();
        assert!(!entity.is_ready());
        assert!(entity.apply_snapshot(vec![create(), fill("A")]));
        assert!(entity.is_ready());
        assert!(entity.create_event().is_some());
        assert_eq!(entity.confirmed().len(), 1);
        assert!(!entity.apply_snapshot(Vec::new()));
    }

    #[test]
    fn test_confirmed_list_is_replaced_not_mutated() {
        let mut entity = entity();
        entity.apply_snapshot(vec![create()]);
        let before = entity.confirmed();
        entity.apply_confirmed(fill("A"));
        let after = entity.confirmed();

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.is_empty());
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn test_confirmation_removes_matching_optimistic() {
        let mut entity = entity();
        entity.apply_snapshot(vec![create()]);
        let mine = fill("A");
        let other = fill("B");
        entity.push_optimistic(mine.clone());
        entity.push_optimistic(other.clone());

        entity.apply_confirmed(mine.clone().with_timestamp(50));
        let optimistic = entity.optimistic();
        assert_eq!(optimistic.len(), 1);
        assert_eq!(optimistic[0].id, other.id);
    }

    #[test]
    fn test_rollback() {
        let mut entity = entity();
        let event = fill("A");
        entity.push_optimistic(event.clone());
        assert!(entity.rollback(event.id));
        assert!(!entity.rollback(event.id));
        assert!(entity.optimistic().is_empty());
    }

    #[test]
    fn test_derived_state_memoized_by_identity() {
        let mut entity = entity();
        assert!(entity.derived_state().is_none());

        entity.apply_snapshot(vec![create()]);
        let first = entity.derived_state().unwrap();
        let second = entity.derived_state().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        entity.push_optimistic(fill("A"));
        let third = entity.derived_state().unwrap();
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(third.cell(Coord::new(0, 0)).unwrap().value, "A");
    }

    #[test]
    fn test_optimistic_applied_after_confirmed() {
        let mut entity = entity();
        entity.apply_snapshot(vec![create(), fill("A")]);
        entity.push_optimistic(Event::new(
            EventKind::Reveal(ScopeParams { scope: Scope::All }),
            None,
            3,
        ));
        let state = entity.derived_state().unwrap();
        assert!(state.solved);
    }

    #[test]
    fn test_second_create_ignored() {
        let mut entity = entity();
        let first = create();
        entity.apply_snapshot(vec![first.clone()]);
        entity.apply_confirmed(create());
        assert_eq!(entity.create_event().unwrap().id, first.id);
    }
}
