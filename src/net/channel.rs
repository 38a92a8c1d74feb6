//! Synchronization channel seam between the client cache and the server
//!
//! `submit` resolves once the server has *accepted* an event. Persistence and
//! ordering are confirmed later, when the event comes back as a [`Delivery`]
//! on the entity's subscription.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::cache::EntityPath;
use crate::event::{Event, EventId};

/// Boxed future returned by channel operations
pub type ChannelFuture<T> = Pin<Box<dyn Future<Output = Result<T, ChannelError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Submission rejected: {0}")]
    Rejected(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Acknowledgement that a submission was accepted for ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub event_id: EventId,
}

/// Server-to-client push for one entity
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The entity's `create` event
    CreateEvent(Event),
    /// Any other confirmed event
    Event(Event),
}

impl Delivery {
    pub fn from_event(event: Event) -> Self {
        if event.is_create() {
            Delivery::CreateEvent(event)
        } else {
            Delivery::Event(event)
        }
    }

    pub fn event(&self) -> &Event {
        match self {
            Delivery::CreateEvent(event) | Delivery::Event(event) => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Delivery::CreateEvent(event) | Delivery::Event(event) => event,
        }
    }
}

/// Result of joining an entity topic
///
/// `history` is the confirmed log at join time; `deliveries` carries every
/// event appended after it, with no gap and no overlap.
#[derive(Debug)]
pub struct Subscription {
    pub history: Vec<Event>,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Client view of the synchronization transport
pub trait SyncChannel: Send + Sync {
    /// Subscribe to an entity's create-event and event topics
    fn join(&self, path: &EntityPath) -> ChannelFuture<Subscription>;

    /// Drop the subscription for `path`; in-flight submissions are unaffected
    fn leave(&self, path: &EntityPath);

    /// Emit an event and wait for the acceptance acknowledgement
    fn submit(&self, path: &EntityPath, event: Event) -> ChannelFuture<Ack>;
}
