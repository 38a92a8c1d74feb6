//! Client entity cache
//!
//! Registry of entities keyed by [`EntityPath`], owned by whoever builds it
//! (there is no global instance). It attaches entities to a [`SyncChannel`],
//! merges confirmed deliveries, applies local mutations optimistically and
//! serves memoized derived state.
//!
//! Locking: the entity map, the lifecycle state and each entity have their
//! own mutex. No method holds two of them at once, and callbacks always run
//! with no lock held.

pub mod entity;
pub mod path;
pub mod topics;

pub use entity::{Entity, EntityHandle};
pub use path::{EntityKind, EntityPath, PathError};
pub use topics::{Callback, Notification, SubscriptionId, Topic, Topics};

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::event::{
    AddPingParams, ChatParams, ClockAction, Coord, CreateParams, Event, EventId, EventKind,
    PuzzleDocument, ResetParams, Scope, ScopeParams, StartBattleParams, TeamId, Timestamp,
    UpdateCellParams, UpdateClockParams, UpdateColorParams, UpdateCursorParams,
    UpdateDisplayNameParams, UpdateTeamIdParams, UpdateTeamNameParams, UserId,
};
use crate::game::GameState;
use crate::lifecycle::{LeakReport, Lifecycle};
use crate::net::channel::{Ack, ChannelError, ChannelFuture, Delivery, SyncChannel};
use crate::util::clock::TimeSource;

/// Cache errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("could not load {0}")]
    LoadTimeout(EntityPath),
    #[error("{0} was detached")]
    Detached(EntityPath),
}

pub struct EntityCache {
    config: CacheConfig,
    channel: Arc<dyn SyncChannel>,
    time: Arc<dyn TimeSource>,
    user: UserId,
    entities: Mutex<HashMap<EntityPath, EntityHandle>>,
    lifecycle: Mutex<Lifecycle>,
    me: Weak<EntityCache>,
}

impl EntityCache {
    pub fn new(
        config: CacheConfig,
        channel: Arc<dyn SyncChannel>,
        time: Arc<dyn TimeSource>,
        user: impl Into<UserId>,
    ) -> Arc<Self> {
        let lifecycle = Lifecycle::new(&config);
        let user = user.into();
        Arc::new_cyclic(|me| Self {
            config,
            channel,
            time,
            user,
            entities: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(lifecycle),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Existing entity for `raw`, or a fresh skeleton. Fails fast on a
    /// malformed path.
    pub fn get_or_create(&self, raw: &str) -> Result<EntityHandle, PathError> {
        let path: EntityPath = raw.parse()?;
        Ok(self.get_or_create_path(&path))
    }

    pub fn get_or_create_path(&self, path: &EntityPath) -> EntityHandle {
        let (handle, created) = {
            let mut entities = self.entities.lock();
            match entities.get(path) {
                Some(handle) => (handle.clone(), false),
                None => {
                    let handle = Arc::new(Mutex::new(Entity::new(path.clone())));
                    entities.insert(path.clone(), handle.clone());
                    (handle, true)
                }
            }
        };
        if created {
            debug!("Created entity {}", path);
        }
        self.touch(path);
        handle
    }

    /// Resident entity for `path`, without creating one
    pub fn entity(&self, path: &EntityPath) -> Option<EntityHandle> {
        self.entities.lock().get(path).cloned()
    }

    pub fn contains(&self, path: &EntityPath) -> bool {
        self.entities.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> Vec<EntityPath> {
        let mut paths: Vec<EntityPath> = self.entities.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn is_ready(&self, path: &EntityPath) -> bool {
        self.entity(path).is_some_and(|h| h.lock().is_ready())
    }

    fn is_current(&self, path: &EntityPath, handle: &EntityHandle) -> bool {
        self.entity(path)
            .is_some_and(|current| Arc::ptr_eq(&current, handle))
    }

    /// Record an access; evicts least recently used entities over the cap
    fn touch(&self, path: &EntityPath) {
        let evicted = self.lifecycle.lock().touch_entity(path);
        for lru in evicted {
            info!("Evicting {} (entity cap {})", lru, self.config.max_entities);
            self.detach(&lru);
        }
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    /// Subscribe `path` to the sync channel.
    ///
    /// Idempotent while attached. On an unregistered path, games and
    /// compositions are created; puzzles and battles are left alone and the
    /// call is a silent no-op. Channel failures are returned so the caller
    /// can retry.
    pub async fn attach(&self, path: &EntityPath) -> Result<(), CacheError> {
        let handle = match self.entity(path) {
            Some(handle) => handle,
            None if path.kind().attach_creates() => self.get_or_create_path(path),
            None => {
                debug!("Attach on unregistered {} ignored", path);
                return Ok(());
            }
        };

        {
            let mut entity = handle.lock();
            if entity.attached || entity.attaching {
                return Ok(());
            }
            entity.attaching = true;
            entity.touch();
        }
        self.touch(path);

        let joined = tokio::time::timeout(self.config.request_timeout, self.channel.join(path))
            .await
            .unwrap_or(Err(ChannelError::Timeout));
        let subscription = match joined {
            Ok(subscription) => subscription,
            Err(e) => {
                handle.lock().attaching = false;
                warn!("Attach {} failed: {}", path, e);
                return Err(e.into());
            }
        };

        if !self.is_current(path, &handle) {
            debug!("{} detached while attaching", path);
            return Err(CacheError::Detached(path.clone()));
        }

        let became_ready = {
            let mut entity = handle.lock();
            entity.attaching = false;
            entity.attached = true;
            entity.attach_generation += 1;
            let became_ready = entity.apply_snapshot(subscription.history);
            entity.pump = Some(tokio::spawn(pump(
                self.me.clone(),
                path.clone(),
                Arc::downgrade(&handle),
                entity.attach_generation,
                subscription.deliveries,
            )));
            became_ready
        };

        info!("Attached {}", path);
        if became_ready {
            self.emit(path, &handle, Notification::Ready);
        }
        self.emit_update(path, &handle);
        Ok(())
    }

    /// Tear down every subscription and drop the entity. In-flight
    /// submissions are neither awaited nor retried.
    pub fn detach(&self, path: &EntityPath) -> bool {
        let Some(handle) = self.entities.lock().remove(path) else {
            return false;
        };

        let (was_attached, cleared) = {
            let mut entity = handle.lock();
            if let Some(pump) = entity.pump.take() {
                pump.abort();
            }
            let was_attached = entity.attached || entity.attaching;
            entity.attached = false;
            entity.attaching = false;
            (was_attached, entity.topics.clear())
        };

        if was_attached {
            self.channel.leave(path);
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.remove(path);
            lifecycle.leaks.record_unsubscribe(path, cleared as u64);
            lifecycle.leaks.check(path);
            lifecycle.leaks.forget(path);
        }

        info!("Detached {} ({} subscriptions dropped)", path, cleared);
        true
    }

    /// Wait until `path` is ready, or fail with "could not load"
    pub async fn wait_for_ready(
        &self,
        path: &EntityPath,
        timeout: Duration,
    ) -> Result<EntityHandle, CacheError> {
        let handle = self.get_or_create_path(path);
        let mut ready = handle.lock().ready_receiver();

        let outcome = tokio::time::timeout(timeout, ready.wait_for(|ready| *ready))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(_)) => Err(CacheError::Detached(path.clone())),
            Err(_) => {
                warn!("Timed out after {:?} waiting for {}", timeout, path);
                Err(CacheError::LoadTimeout(path.clone()))
            }
        }
    }

    /// [`wait_for_ready`](Self::wait_for_ready) with the configured timeout
    pub async fn wait_ready(&self, path: &EntityPath) -> Result<EntityHandle, CacheError> {
        self.wait_for_ready(path, self.config.ready_timeout).await
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, path: &EntityPath, topic: Topic, callback: F) -> Unsubscribe
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.add_subscriber(path, topic, false, Arc::new(callback))
    }

    /// Like [`subscribe`](Self::subscribe), removed after the first call
    pub fn once<F>(&self, path: &EntityPath, topic: Topic, callback: F) -> Unsubscribe
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.add_subscriber(path, topic, true, Arc::new(callback))
    }

    fn add_subscriber(
        &self,
        path: &EntityPath,
        topic: Topic,
        once: bool,
        callback: Callback,
    ) -> Unsubscribe {
        let handle = self.get_or_create_path(path);
        let id = {
            let mut entity = handle.lock();
            entity.touch();
            entity.topics.add(topic, once, callback)
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.leaks.record_subscribe(path);
            lifecycle.leaks.check(path);
        }

        Unsubscribe {
            cache: self.me.clone(),
            entity: Arc::downgrade(&handle),
            path: path.clone(),
            id,
        }
    }

    /// Leak report for `path`, if it is over tolerance
    pub fn leak_report(&self, path: &EntityPath) -> Option<LeakReport> {
        self.lifecycle.lock().leaks.check(path)
    }

    pub fn leaks(&self) -> Vec<LeakReport> {
        self.lifecycle.lock().leaks.leaks()
    }

    fn emit(&self, path: &EntityPath, handle: &EntityHandle, note: Notification) {
        let (callbacks, fired_once) = handle.lock().topics.fire(note.topic());
        if !fired_once.is_empty() {
            self.lifecycle
                .lock()
                .leaks
                .record_unsubscribe(path, fired_once.len() as u64);
        }
        for callback in callbacks {
            callback(&note);
        }
    }

    /// Fire `Update` with fresh derived state, computed only if someone listens
    fn emit_update(&self, path: &EntityPath, handle: &EntityHandle) {
        let (callbacks, fired_once) = handle.lock().topics.fire(Topic::Update);
        if callbacks.is_empty() {
            return;
        }
        if !fired_once.is_empty() {
            self.lifecycle
                .lock()
                .leaks
                .record_unsubscribe(path, fired_once.len() as u64);
        }
        let note = Notification::Update(self.derive(path, handle));
        for callback in callbacks {
            callback(&note);
        }
    }

    // ------------------------------------------------------------------
    // Confirmed deliveries
    // ------------------------------------------------------------------

    fn receive(&self, path: &EntityPath, handle: &EntityHandle, delivery: Delivery) {
        let note = match &delivery {
            Delivery::CreateEvent(event) => Notification::CreateEvent(Arc::new(event.clone())),
            Delivery::Event(event) => Notification::Event(Arc::new(event.clone())),
        };
        handle.lock().apply_confirmed(delivery.into_event());
        self.emit(path, handle, note);
        self.emit_update(path, handle);
    }

    // ------------------------------------------------------------------
    // Derived state
    // ------------------------------------------------------------------

    /// Memoized derived state. Returns the same `Arc` until the entity's
    /// event lists change.
    pub fn compute_game_state(&self, path: &EntityPath) -> Option<Arc<GameState>> {
        let handle = self.entity(path)?;
        self.touch(path);
        self.derive(path, &handle)
    }

    fn derive(&self, path: &EntityPath, handle: &EntityHandle) -> Option<Arc<GameState>> {
        let state = handle.lock().derived_state();

        let evicted = self.lifecycle.lock().touch_derived(path);
        for lru in evicted {
            debug!("Dropping derived state of {}", lru);
            if let Some(other) = self.entity(&lru) {
                other.lock().clear_derived();
            }
        }
        state
    }

    // ------------------------------------------------------------------
    // Idle eviction
    // ------------------------------------------------------------------

    /// Detach every unsubscribed entity idle for at least `idle_timeout`
    pub fn sweep_idle(&self) -> Vec<EntityPath> {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> Vec<EntityPath> {
        let handles: Vec<(EntityPath, EntityHandle)> = self
            .entities
            .lock()
            .iter()
            .map(|(path, handle)| (path.clone(), handle.clone()))
            .collect();

        let idle: Vec<EntityPath> = handles
            .into_iter()
            .filter(|(_, handle)| {
                let entity = handle.lock();
                entity.topics.is_empty()
                    && now.saturating_duration_since(entity.last_activity())
                        >= self.config.idle_timeout
            })
            .map(|(path, _)| path)
            .collect();

        for path in &idle {
            info!("Detaching idle entity {}", path);
            self.detach(path);
        }
        idle
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Apply `kind` optimistically and submit it. `None` when the entity is
    /// missing or not ready.
    fn mutate(&self, path: &EntityPath, kind: EventKind) -> Option<Submission> {
        let handle = self.entity(path)?;
        let event = Event::new(kind, Some(self.user.clone()), self.time.now_ms());

        {
            let mut entity = handle.lock();
            if !entity.is_ready() {
                debug!("Ignoring {} on {}: not ready", event.tag(), path);
                return None;
            }
            entity.push_optimistic(event.clone());
            entity.touch();
        }
        self.touch(path);
        self.emit_update(path, &handle);

        let id = event.id;
        let ack = self.channel.submit(path, event);
        Some(Submission::start(
            ack,
            self.config.request_timeout,
            id,
            self.me.clone(),
            path.clone(),
            Arc::downgrade(&handle),
        ))
    }

    /// Remove a pending optimistic event; returns whether it was pending
    pub fn rollback(&self, path: &EntityPath, event_id: EventId) -> bool {
        match self.entity(path) {
            Some(handle) => self.rollback_entity(path, &handle, event_id),
            None => false,
        }
    }

    fn rollback_entity(&self, path: &EntityPath, handle: &EntityHandle, event_id: EventId) -> bool {
        let removed = handle.lock().rollback(event_id);
        if removed {
            warn!("Rolled back {} on {}", event_id, path);
            self.emit_update(path, handle);
        }
        removed
    }

    pub fn create(&self, path: &EntityPath, pid: &str, puzzle: PuzzleDocument) -> Option<Submission> {
        if self.entity(path)?.lock().create_event().is_some() {
            debug!("{} already created", path);
            return None;
        }
        self.mutate(
            path,
            EventKind::Create(CreateParams {
                pid: pid.to_string(),
                puzzle,
            }),
        )
    }

    pub fn update_cell(
        &self,
        path: &EntityPath,
        cell: Coord,
        value: &str,
        pencil: bool,
        autocheck: bool,
    ) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::UpdateCell(UpdateCellParams {
                cell,
                value: value.to_string(),
                pencil,
                autocheck,
            }),
        )
    }

    pub fn update_cursor(&self, path: &EntityPath, cell: Coord) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::UpdateCursor(UpdateCursorParams {
                id: self.user.clone(),
                cell,
            }),
        )
    }

    pub fn add_ping(&self, path: &EntityPath, cell: Coord) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::AddPing(AddPingParams {
                id: self.user.clone(),
                cell,
            }),
        )
    }

    pub fn update_display_name(&self, path: &EntityPath, display_name: &str) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::UpdateDisplayName(UpdateDisplayNameParams {
                id: self.user.clone(),
                display_name: display_name.to_string(),
            }),
        )
    }

    pub fn update_color(&self, path: &EntityPath, color: &str) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::UpdateColor(UpdateColorParams {
                id: self.user.clone(),
                color: color.to_string(),
            }),
        )
    }

    pub fn check(&self, path: &EntityPath, scope: Scope) -> Option<Submission> {
        if scope.is_empty() {
            return None;
        }
        self.mutate(path, EventKind::Check(ScopeParams { scope }))
    }

    pub fn reveal(&self, path: &EntityPath, scope: Scope) -> Option<Submission> {
        if scope.is_empty() {
            return None;
        }
        self.mutate(path, EventKind::Reveal(ScopeParams { scope }))
    }

    pub fn reset(&self, path: &EntityPath, scope: Scope, force: bool) -> Option<Submission> {
        if scope.is_empty() {
            return None;
        }
        self.mutate(path, EventKind::Reset(ResetParams { scope, force }))
    }

    pub fn chat(&self, path: &EntityPath, sender: &str, text: &str) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::Chat(ChatParams {
                sender_id: self.user.clone(),
                sender: sender.to_string(),
                text: text.to_string(),
            }),
        )
    }

    fn clock(&self, path: &EntityPath, action: ClockAction) -> Option<Submission> {
        self.mutate(path, EventKind::UpdateClock(UpdateClockParams { action }))
    }

    pub fn start_clock(&self, path: &EntityPath) -> Option<Submission> {
        self.clock(path, ClockAction::Start)
    }

    pub fn pause_clock(&self, path: &EntityPath) -> Option<Submission> {
        self.clock(path, ClockAction::Pause)
    }

    pub fn reset_clock(&self, path: &EntityPath) -> Option<Submission> {
        self.clock(path, ClockAction::Reset)
    }

    pub fn update_team_id(&self, path: &EntityPath, team_id: TeamId) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::UpdateTeamId(UpdateTeamIdParams {
                id: self.user.clone(),
                team_id,
            }),
        )
    }

    pub fn update_team_name(&self, path: &EntityPath, team_id: TeamId, name: &str) -> Option<Submission> {
        self.mutate(
            path,
            EventKind::UpdateTeamName(UpdateTeamNameParams {
                team_id,
                name: name.to_string(),
            }),
        )
    }

    pub fn start_battle(&self, path: &EntityPath, started_at: Timestamp) -> Option<Submission> {
        self.mutate(path, EventKind::StartBattle(StartBattleParams { started_at }))
    }
}

/// Forwards confirmed deliveries into the entity until the stream ends.
/// A stream that ends on its own (connection lost) leaves the entity
/// unattached so the next `attach` joins again.
async fn pump(
    cache: Weak<EntityCache>,
    path: EntityPath,
    entity: Weak<Mutex<Entity>>,
    generation: u64,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let (Some(cache), Some(handle)) = (cache.upgrade(), entity.upgrade()) else {
            return;
        };
        cache.receive(&path, &handle, delivery);
    }

    let Some(handle) = entity.upgrade() else {
        return;
    };
    let mut entity = handle.lock();
    if entity.attached && entity.attach_generation == generation {
        entity.attached = false;
        entity.pump = None;
        warn!("Delivery stream for {} ended; entity no longer attached", path);
    } else {
        debug!("Delivery stream for {} ended", path);
    }
}

/// Handle returned by [`EntityCache::subscribe`] and [`EntityCache::once`]
pub struct Unsubscribe {
    cache: Weak<EntityCache>,
    entity: Weak<Mutex<Entity>>,
    path: EntityPath,
    id: SubscriptionId,
}

impl Unsubscribe {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the subscription; false if it already fired (`once`) or the
    /// entity was detached
    pub fn unsubscribe(self) -> bool {
        let Some(entity) = self.entity.upgrade() else {
            return false;
        };
        let removed = entity.lock().topics.remove(self.id);
        if removed {
            if let Some(cache) = self.cache.upgrade() {
                cache.lifecycle.lock().leaks.record_unsubscribe(&self.path, 1);
            }
        }
        removed
    }
}

enum SubmissionState {
    /// A watcher task owns the ack future and reports back
    Watched(oneshot::Receiver<Result<Ack, ChannelError>>),
    /// No runtime at submit time; resolved when polled
    Direct(ChannelFuture<Ack>),
    Done,
}

/// Pending acknowledgement of an optimistic mutation
///
/// A rejected submission rolls back its optimistic event whether or not the
/// `Submission` is awaited.
#[must_use = "dropping a Submission does not cancel it; await it to observe the ack"]
pub struct Submission {
    event_id: EventId,
    cache: Weak<EntityCache>,
    path: EntityPath,
    entity: Weak<Mutex<Entity>>,
    state: SubmissionState,
}

impl Submission {
    fn start(
        ack: ChannelFuture<Ack>,
        timeout: Duration,
        event_id: EventId,
        cache: Weak<EntityCache>,
        path: EntityPath,
        entity: Weak<Mutex<Entity>>,
    ) -> Self {
        let state = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = oneshot::channel();
                let watcher_cache = cache.clone();
                let watcher_path = path.clone();
                let watcher_entity = entity.clone();
                runtime.spawn(async move {
                    let result = tokio::time::timeout(timeout, ack)
                        .await
                        .unwrap_or(Err(ChannelError::Timeout));
                    if result.is_err() {
                        settle_rejected(&watcher_cache, &watcher_path, &watcher_entity, event_id);
                    }
                    let _ = tx.send(result);
                });
                SubmissionState::Watched(rx)
            }
            Err(_) => SubmissionState::Direct(ack),
        };

        Self {
            event_id,
            cache,
            path,
            entity,
            state,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn path(&self) -> &EntityPath {
        &self.path
    }
}

fn settle_rejected(
    cache: &Weak<EntityCache>,
    path: &EntityPath,
    entity: &Weak<Mutex<Entity>>,
    event_id: EventId,
) {
    let (Some(cache), Some(handle)) = (cache.upgrade(), entity.upgrade()) else {
        return;
    };
    cache.rollback_entity(path, &handle, event_id);
}

impl Future for Submission {
    type Output = Result<Ack, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = match &mut this.state {
            SubmissionState::Watched(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(_)) => Err(ChannelError::Closed),
                Poll::Pending => return Poll::Pending,
            },
            SubmissionState::Direct(ack) => match ack.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    if result.is_err() {
                        settle_rejected(&this.cache, &this.path, &this.entity, this.event_id);
                    }
                    result
                }
                Poll::Pending => return Poll::Pending,
            },
            SubmissionState::Done => return Poll::Ready(Err(CacheError::Channel(ChannelError::Closed))),
        };
        this.state = SubmissionState::Done;
        Poll::Ready(result.map_err(CacheError::from))
    }
}
