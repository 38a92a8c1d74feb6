//! Server-side sync hub
//!
//! Owns the event log and the per-entity subscriber lists. Submissions are
//! acknowledged as soon as they are queued; a single loop task drains the
//! queue, appends each event (the log assigns the timestamp) and fans it out
//! to every subscriber of the entity, the submitter included.
//!
//! `join` reads history and registers the subscriber under the same lock the
//! loop holds while appending, so a subscriber sees every event exactly once.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::cache::EntityPath;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::net::channel::{Ack, ChannelError, ChannelFuture, Delivery, Subscription, SyncChannel};
use crate::store::EventLog;

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Pending {
    path: EntityPath,
    event: Event,
}

pub struct SyncHub {
    log: Arc<dyn EventLog>,
    topics: Mutex<HashMap<EntityPath, Vec<Subscriber>>>,
    queue: mpsc::Sender<Pending>,
    next_subscriber: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SyncHub {
    /// Create the hub and spawn its loop task (requires a tokio runtime)
    pub fn start(log: Arc<dyn EventLog>, queue_capacity: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let hub = Arc::new(Self {
            log,
            topics: Mutex::new(HashMap::new()),
            queue,
            next_subscriber: AtomicU64::new(1),
            metrics,
        });

        tokio::spawn(run_loop(Arc::downgrade(&hub), rx));
        info!("Sync hub started (queue capacity {})", queue_capacity);
        hub
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Subscribe to `path`, returning its history and a live delivery stream
    pub fn join(&self, path: &EntityPath) -> Result<(SubscriberId, Subscription), ChannelError> {
        let mut topics = self.topics.lock();

        let history = self
            .log
            .events(&path.to_string())
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let (tx, deliveries) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let subscribers = topics.entry(path.clone()).or_default();
        if subscribers.is_empty() {
            self.metrics.entities_active.fetch_add(1, Ordering::Relaxed);
        }
        subscribers.push(Subscriber { id, tx });
        self.metrics.subscribers_active.fetch_add(1, Ordering::Relaxed);

        debug!("Subscriber {} joined {} ({} events)", id, path, history.len());
        Ok((id, Subscription { history, deliveries }))
    }

    /// Remove one subscriber; unknown ids are ignored
    pub fn leave(&self, path: &EntityPath, id: SubscriberId) {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(path) else {
            return;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = before - subscribers.len();
        self.metrics
            .subscribers_active
            .fetch_sub(removed as u64, Ordering::Relaxed);

        if subscribers.is_empty() {
            topics.remove(path);
            self.metrics.entities_active.fetch_sub(1, Ordering::Relaxed);
        }
        debug!("Subscriber {} left {}", id, path);
    }

    /// Queue `event` for ordering; resolves on acceptance
    pub fn submit(&self, path: &EntityPath, event: Event) -> Result<Ack, ChannelError> {
        let ack = Ack { event_id: event.id };
        let pending = Pending {
            path: path.clone(),
            event,
        };

        match self.queue.try_send(pending) {
            Ok(()) => {
                self.metrics.submissions_accepted.fetch_add(1, Ordering::Relaxed);
                Ok(ack)
            }
            Err(TrySendError::Full(pending)) => {
                self.metrics.submissions_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Submission queue full, rejecting {} for {}", pending.event.tag(), pending.path);
                Err(ChannelError::Rejected("submission queue full".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Number of live subscribers for `path`
    pub fn subscriber_count(&self, path: &EntityPath) -> usize {
        self.topics.lock().get(path).map_or(0, Vec::len)
    }

    fn apply(&self, pending: Pending) {
        let Pending { path, event } = pending;
        let started = Instant::now();
        let mut topics = self.topics.lock();

        let stored = match self.log.append(&path.to_string(), event) {
            Ok(stored) => stored,
            Err(e) => {
                self.metrics.append_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Append to {} failed: {}", path, e);
                return;
            }
        };
        self.metrics.events_appended.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_append_time(started.elapsed());

        let Some(subscribers) = topics.get_mut(&path) else {
            return;
        };

        // Receivers dropped without `leave` are pruned here
        let before = subscribers.len();
        subscribers.retain(|s| s.tx.send(Delivery::from_event(stored.clone())).is_ok());
        let delivered = subscribers.len();
        self.metrics
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if delivered < before {
            self.metrics
                .subscribers_active
                .fetch_sub((before - delivered) as u64, Ordering::Relaxed);
            debug!("Pruned {} closed subscribers of {}", before - delivered, path);
        }
        if subscribers.is_empty() {
            topics.remove(&path);
            self.metrics.entities_active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

async fn run_loop(hub: Weak<SyncHub>, mut rx: mpsc::Receiver<Pending>) {
    while let Some(pending) = rx.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.apply(pending);
    }
    debug!("Sync hub loop stopped");
}

/// In-process [`SyncChannel`] backed by a [`SyncHub`]
///
/// One instance per client; it remembers its own subscriber id per path so
/// `leave` only drops this client's subscription.
pub struct LocalChannel {
    hub: Arc<SyncHub>,
    joined: Arc<Mutex<HashMap<EntityPath, SubscriberId>>>,
}

impl LocalChannel {
    pub fn new(hub: Arc<SyncHub>) -> Self {
        Self {
            hub,
            joined: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }
}

impl SyncChannel for LocalChannel {
    fn join(&self, path: &EntityPath) -> ChannelFuture<Subscription> {
        let hub = self.hub.clone();
        let joined = self.joined.clone();
        let path = path.clone();

        Box::pin(async move {
            let (id, subscription) = hub.join(&path)?;
            if let Some(previous) = joined.lock().insert(path.clone(), id) {
                hub.leave(&path, previous);
            }
            Ok(subscription)
        })
    }

    fn leave(&self, path: &EntityPath) {
        if let Some(id) = self.joined.lock().remove(path) {
            self.hub.leave(path, id);
        }
    }

    fn submit(&self, path: &EntityPath, event: Event) -> ChannelFuture<Ack> {
        let result = self.hub.submit(path, event);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CreateParams, EventKind, PuzzleDocument, Scope, ScopeParams};
    use crate::store::InMemoryEventLog;
    use crate::util::clock::ManualTimeSource;

    fn hub() -> (Arc<SyncHub>, Arc<ManualTimeSource>) {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let log = Arc::new(InMemoryEventLog::new(time.clone()));
        (SyncHub::start(log, 16, Arc::new(Metrics::new())), time)
    }

    fn create() -> Event {
        Event::new(
            EventKind::Create(CreateParams {
                pid: "p".to_string(),
                puzzle: PuzzleDocument::from_rows(&["AB"]),
            }),
            Some("u".to_string()),
            0,
        )
    }

    fn check() -> Event {
        Event::new(EventKind::Check(ScopeParams { scope: Scope::All }), None, 0)
    }

    #[tokio::test]
    async fn test_submit_fans_out_with_server_timestamp() {
        let (hub, _time) = hub();
        let path = EntityPath::game("g1").unwrap();

        let (_, mut first) = hub.join(&path).unwrap();
        let (_, mut second) = hub.join(&path).unwrap();
        assert!(first.history.is_empty());

        let event = create();
        let ack = hub.submit(&path, event.clone()).unwrap();
        assert_eq!(ack.event_id, event.id);

        for sub in [&mut first, &mut second] {
            match sub.deliveries.recv().await.unwrap() {
                Delivery::CreateEvent(delivered) => {
                    assert_eq!(delivered.id, event.id);
                    assert_eq!(delivered.timestamp, 1_000);
                }
                other => panic!("unexpected delivery {:?}", other),
            }
        }
        assert_eq!(hub.log().len("/game/g1"), 1);
    }

    #[tokio::test]
    async fn test_join_after_append_sees_history_not_duplicates() {
        let (hub, _time) = hub();
        let path = EntityPath::game("g2").unwrap();

        let (_, mut early) = hub.join(&path).unwrap();
        hub.submit(&path, create()).unwrap();
        early.deliveries.recv().await.unwrap();

        let (_, mut late) = hub.join(&path).unwrap();
        assert_eq!(late.history.len(), 1);

        hub.submit(&path, check()).unwrap();
        assert!(matches!(late.deliveries.recv().await, Some(Delivery::Event(_))));
        assert!(late.deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_stops_deliveries() {
        let (hub, _time) = hub();
        let path = EntityPath::game("g3").unwrap();

        let (id, mut sub) = hub.join(&path).unwrap();
        let (_, mut witness) = hub.join(&path).unwrap();
        hub.leave(&path, id);
        assert_eq!(hub.subscriber_count(&path), 1);

        hub.submit(&path, check()).unwrap();
        witness.deliveries.recv().await.unwrap();
        assert!(sub.deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let (hub, _time) = hub();
        let path = EntityPath::game("g4").unwrap();

        let (_, sub) = hub.join(&path).unwrap();
        drop(sub);
        let (_, mut witness) = hub.join(&path).unwrap();

        hub.submit(&path, check()).unwrap();
        witness.deliveries.recv().await.unwrap();
        assert_eq!(hub.subscriber_count(&path), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let time = Arc::new(ManualTimeSource::new(0));
        let log = Arc::new(InMemoryEventLog::new(time));
        let hub = SyncHub::start(log, 1, Arc::new(Metrics::new()));
        let path = EntityPath::game("g5").unwrap();

        // No await point in between, so the loop cannot drain the queue
        let results: Vec<_> = (0..4).map(|_| hub.submit(&path, check())).collect();
        assert!(results[0].is_ok());
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ChannelError::Rejected(_)))));
    }

    #[tokio::test]
    async fn test_local_channel_rejoin_replaces_subscription() {
        let (hub, _time) = hub();
        let channel = LocalChannel::new(hub.clone());
        let path = EntityPath::game("g6").unwrap();

        let _first = channel.join(&path).await.unwrap();
        let _second = channel.join(&path).await.unwrap();
        assert_eq!(hub.subscriber_count(&path), 1);

        channel.leave(&path);
        assert_eq!(hub.subscriber_count(&path), 0);

        let ack = channel.submit(&path, check()).await.unwrap();
        assert_ne!(ack.event_id, uuid::Uuid::nil());
    }
}
