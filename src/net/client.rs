//! TCP implementation of [`SyncChannel`]
//!
//! Requests carry a connection-local id; the reader task resolves the
//! matching oneshot when the reply arrives. Deliveries are routed by entity
//! path. The route is registered before `Join` is sent so no delivery that
//! follows `Joined` can be missed.
//!
//! Every request is encoded up front: one that does not fit a frame is
//! rejected on its own and the connection stays up. Every reply is awaited
//! under `ChannelConfig::request_timeout`.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[cfg(feature = "battle")]
use crate::battle::{BattleRequest, BattleResponse};
use crate::cache::EntityPath;
use crate::config::ChannelConfig;
use crate::event::Event;
use crate::net::channel::{Ack, ChannelError, ChannelFuture, Delivery, Subscription, SyncChannel};
use crate::net::framing::{read_json, write_frame, FramingError};
use crate::net::protocol::{encode, ClientMessage, RequestId, ServerMessage};

/// A request waiting for its reply
struct Pending {
    reply: oneshot::Sender<ServerMessage>,
    /// `History` frames received ahead of `Joined`
    history: Vec<Event>,
}

impl Pending {
    fn finish(self, message: ServerMessage) {
        let message = match message {
            ServerMessage::Joined {
                request_id,
                path,
                history,
            } if !self.history.is_empty() => {
                let mut full = self.history;
                full.extend(history);
                ServerMessage::Joined {
                    request_id,
                    path,
                    history: full,
                }
            }
            other => other,
        };
        let _ = self.reply.send(message);
    }
}

struct Shared {
    /// `None` once the connection is gone
    pending: Mutex<Option<HashMap<RequestId, Pending>>>,
    routes: Mutex<HashMap<EntityPath, mpsc::UnboundedSender<Delivery>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Some(HashMap::new())),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Fail everything in flight and end every delivery stream
    fn close(&self) {
        self.pending.lock().take();
        self.routes.lock().clear();
    }

    fn resolve(&self, request_id: RequestId) -> Option<Pending> {
        self.pending.lock().as_mut()?.remove(&request_id)
    }

    fn extend_history(&self, request_id: RequestId, events: Vec<Event>) -> bool {
        let mut pending = self.pending.lock();
        match pending.as_mut().and_then(|p| p.get_mut(&request_id)) {
            Some(entry) => {
                entry.history.extend(events);
                true
            }
            None => false,
        }
    }
}

/// Await the reply to `request_id`, dropping the pending entry on timeout
async fn await_reply(
    shared: Arc<Shared>,
    request_id: RequestId,
    rx: oneshot::Receiver<ServerMessage>,
    timeout: Duration,
) -> Result<ServerMessage, ChannelError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(_)) => Err(ChannelError::Closed),
        Err(_) => {
            shared.resolve(request_id);
            tracing::warn!("Request {} timed out after {:?}", request_id, timeout);
            Err(ChannelError::Timeout)
        }
    }
}

/// Client side of the TCP sync protocol
pub struct TcpChannel {
    config: ChannelConfig,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TcpChannel {
    /// Connect to a sync server with the default [`ChannelConfig`]
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ChannelError> {
        Self::connect_with(addr, ChannelConfig::default()).await
    }

    pub async fn connect_with<A: ToSocketAddrs>(
        addr: A,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::new());
        let (outbound, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read_half, shared.clone(), config.max_frame_bytes));
        let writer = tokio::spawn(write_loop(
            write_half,
            rx,
            shared.clone(),
            config.max_frame_bytes,
        ));

        Ok(Self {
            config,
            outbound,
            shared,
            next_request: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Whether the connection is still up
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.outbound.is_closed()
    }

    /// Requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().as_ref().map_or(0, |p| p.len())
    }

    fn encode(&self, message: &ClientMessage) -> Result<Vec<u8>, ChannelError> {
        let data = encode(message).map_err(|e| ChannelError::Transport(e.to_string()))?;
        if data.len() > self.config.max_frame_bytes {
            return Err(ChannelError::Rejected(format!(
                "message too large: {} bytes (max {})",
                data.len(),
                self.config.max_frame_bytes
            )));
        }
        Ok(data)
    }

    fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<(RequestId, oneshot::Receiver<ServerMessage>), ChannelError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let data = self.encode(&build(request_id))?;
        let (reply, rx) = oneshot::channel();

        match self.shared.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(
                    request_id,
                    Pending {
                        reply,
                        history: Vec::new(),
                    },
                );
            }
            None => return Err(ChannelError::Closed),
        }
        if self.outbound.send(data).is_err() {
            self.shared.resolve(request_id);
            return Err(ChannelError::Closed);
        }
        Ok((request_id, rx))
    }

    /// Run a battle request on the server
    #[cfg(feature = "battle")]
    pub async fn battle(&self, request: BattleRequest) -> Result<BattleResponse, ChannelError> {
        let (request_id, rx) = self.request(|request_id| ClientMessage::Battle { request_id, request })?;
        let reply = await_reply(self.shared.clone(), request_id, rx, self.config.request_timeout).await?;
        match reply {
            ServerMessage::BattleResult { response, .. } => Ok(response),
            ServerMessage::BattleFailed { reason, .. } => Err(ChannelError::Rejected(reason)),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl SyncChannel for TcpChannel {
    fn join(&self, path: &EntityPath) -> ChannelFuture<Subscription> {
        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        self.shared.routes.lock().insert(path.clone(), deliveries_tx);

        let requested = self.request(|request_id| ClientMessage::Join {
            request_id,
            path: path.clone(),
        });
        let (request_id, rx) = match requested {
            Ok(requested) => requested,
            Err(e) => {
                self.shared.routes.lock().remove(path);
                return Box::pin(async move { Err(e) });
            }
        };

        let shared = self.shared.clone();
        let outbound = self.outbound.clone();
        let timeout = self.config.request_timeout;
        let path = path.clone();
        Box::pin(async move {
            let reply = match await_reply(shared.clone(), request_id, rx, timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    shared.routes.lock().remove(&path);
                    if matches!(e, ChannelError::Timeout) {
                        // The server may still join; tell it not to bother
                        if let Ok(data) = encode(&ClientMessage::Leave { path: path.clone() }) {
                            let _ = outbound.send(data);
                        }
                    }
                    return Err(e);
                }
            };
            match reply {
                ServerMessage::Joined { history, .. } => Ok(Subscription { history, deliveries }),
                ServerMessage::JoinFailed { reason, .. } => {
                    shared.routes.lock().remove(&path);
                    Err(ChannelError::Rejected(reason))
                }
                other => Err(unexpected(&other)),
            }
        })
    }

    fn leave(&self, path: &EntityPath) {
        self.shared.routes.lock().remove(path);
        match self.encode(&ClientMessage::Leave { path: path.clone() }) {
            Ok(data) => {
                let _ = self.outbound.send(data);
            }
            Err(e) => tracing::warn!("Could not send leave for {}: {}", path, e),
        }
    }

    fn submit(&self, path: &EntityPath, event: Event) -> ChannelFuture<Ack> {
        let requested = self.request(|request_id| ClientMessage::Submit {
            request_id,
            path: path.clone(),
            event,
        });
        let (request_id, rx) = match requested {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!("Submit on {} not sent: {}", path, e);
                return Box::pin(async move { Err(e) });
            }
        };

        let shared = self.shared.clone();
        let timeout = self.config.request_timeout;
        Box::pin(async move {
            match await_reply(shared, request_id, rx, timeout).await? {
                ServerMessage::Ack { event_id, .. } => Ok(Ack { event_id }),
                ServerMessage::Rejected { reason, .. } => Err(ChannelError::Rejected(reason)),
                other => Err(unexpected(&other)),
            }
        })
    }
}

fn unexpected(message: &ServerMessage) -> ChannelError {
    ChannelError::Transport(format!("unexpected reply: {:?}", message))
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>, max_frame_bytes: usize) {
    loop {
        let message: ServerMessage = match read_json(&mut reader, max_frame_bytes).await {
            Ok(message) => message,
            Err(FramingError::Codec(e)) => {
                tracing::warn!("Failed to decode server message: {}", e);
                continue;
            }
            Err(FramingError::ConnectionClosed) => {
                tracing::debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Read failed: {}", e);
                break;
            }
        };

        if let ServerMessage::History { request_id, events } = message {
            if !shared.extend_history(request_id, events) {
                tracing::debug!("History for unknown request {}", request_id);
            }
            continue;
        }

        if let Some(request_id) = message.request_id() {
            match shared.resolve(request_id) {
                Some(pending) => pending.finish(message),
                None => tracing::debug!("Reply for unknown request {}", request_id),
            }
            continue;
        }

        match message {
            ServerMessage::CreateEvent { path, event } => route(&shared, &path, Delivery::CreateEvent(event)),
            ServerMessage::Event { path, event } => route(&shared, &path, Delivery::Event(event)),
            ServerMessage::Error { reason } => tracing::warn!("Server error: {}", reason),
            ServerMessage::Pong {
                client_timestamp,
                server_timestamp,
            } => tracing::trace!("Pong {} / {}", client_timestamp, server_timestamp),
            other => tracing::debug!("Ignoring {:?}", other),
        }
    }

    shared.close();
}

fn route(shared: &Shared, path: &EntityPath, delivery: Delivery) {
    let mut routes = shared.routes.lock();
    if let Some(tx) = routes.get(path) {
        if tx.send(delivery).is_err() {
            routes.remove(path);
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
    max_frame_bytes: usize,
) {
    while let Some(data) = rx.recv().await {
        match write_frame(&mut writer, &data, max_frame_bytes).await {
            Ok(()) => {}
            Err(FramingError::MessageTooLarge(len, max)) => {
                tracing::warn!("Skipping oversized frame ({} > {})", len, max);
            }
            Err(e) => {
                tracing::warn!("Write failed: {}", e);
                break;
            }
        }
    }
    shared.close();
}
