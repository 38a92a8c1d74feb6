//! TCP sync server
//!
//! One reader task per connection decodes [`ClientMessage`] frames and
//! dispatches them to the [`SyncHub`]; one writer task drains an outbound
//! queue of [`ServerMessage`]s. Every joined entity gets a forwarder task
//! that moves hub deliveries into the same outbound queue, so a `Joined`
//! reply is always written before the deliveries that follow it. Long
//! histories go out as `History` frames ahead of `Joined`; a request reply
//! that still does not fit a frame is answered with a failure instead.

use hashbrown::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(feature = "battle")]
use crate::battle::BattleService;
use crate::cache::EntityPath;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::channel::{Delivery, Subscription};
use crate::net::framing::{read_frame, write_frame, FramingError};
use crate::net::hub::{SubscriberId, SyncHub};
use crate::event::Event;
use crate::net::protocol::{decode, encode, join_reply, ClientMessage, ServerMessage, ENVELOPE_RESERVE};
use crate::util::clock::{SystemTimeSource, TimeSource};

/// Shared state handed to every connection task
struct ServerContext {
    hub: Arc<SyncHub>,
    #[cfg(feature = "battle")]
    battle: Option<Arc<BattleService>>,
    metrics: Arc<Metrics>,
    time: Arc<dyn TimeSource>,
    max_frame_bytes: usize,
}

/// TCP server speaking the framed JSON sync protocol
pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    context: ServerContext,
}

impl SyncServer {
    /// Bind the listening socket
    pub async fn bind(
        config: ServerConfig,
        hub: Arc<SyncHub>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port)).await?;

        let context = ServerContext {
            hub,
            #[cfg(feature = "battle")]
            battle: None,
            metrics,
            time: Arc::new(SystemTimeSource),
            max_frame_bytes: config.max_frame_bytes,
        };

        Ok(Self {
            config,
            listener,
            context,
        })
    }

    /// Serve battle requests through `service`
    #[cfg(feature = "battle")]
    pub fn with_battle(mut self, service: Arc<BattleService>) -> Self {
        self.context.battle = Some(service);
        self
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Sync server listening on {}", self.local_addr()?);

        let context = Arc::new(self.context);
        let max_connections = self.config.max_connections as u64;

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };

            if context.metrics.connections_active.load(Ordering::Relaxed) >= max_connections {
                context.metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Connection from {} rejected: at capacity ({})", peer, max_connections);
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer, e);
            }

            let context = context.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, context).await {
                    tracing::warn!("Connection {} error: {}", peer, e);
                }
            });
        }
    }
}

/// Keeps `connections_active` accurate however the connection ends
struct ConnectionGuard(Arc<Metrics>);

impl ConnectionGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-entity subscription owned by one connection
struct Joined {
    subscriber: SubscriberId,
    forwarder: JoinHandle<()>,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ServerContext>,
) -> anyhow::Result<()> {
    let _guard = ConnectionGuard::new(context.metrics.clone());
    tracing::debug!("Connection accepted from {}", peer);

    let (mut reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(
        writer,
        out_rx,
        context.metrics.clone(),
        context.max_frame_bytes,
    ));

    let mut joined: HashMap<EntityPath, Joined> = HashMap::new();
    let result = read_loop(&mut reader, &context, &out_tx, &mut joined).await;

    for (path, entry) in joined.drain() {
        entry.forwarder.abort();
        context.hub.leave(&path, entry.subscriber);
    }
    drop(out_tx);
    writer_task.abort();

    tracing::debug!("Connection from {} closed", peer);
    match result {
        Ok(()) | Err(FramingError::ConnectionClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    context: &ServerContext,
    out: &mpsc::UnboundedSender<ServerMessage>,
    joined: &mut HashMap<EntityPath, Joined>,
) -> Result<(), FramingError> {
    loop {
        let frame = read_frame(reader, context.max_frame_bytes).await?;
        context.metrics.record_received(frame.len());

        let message: ClientMessage = match decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Failed to decode client message: {}", e);
                let _ = out.send(ServerMessage::Error {
                    reason: format!("malformed message: {}", e),
                });
                continue;
            }
        };

        let reply = dispatch(message, context, out, joined);
        if let Some(reply) = reply {
            if out.send(reply).is_err() {
                return Ok(());
            }
        }
    }
}

fn dispatch(
    message: ClientMessage,
    context: &ServerContext,
    out: &mpsc::UnboundedSender<ServerMessage>,
    joined: &mut HashMap<EntityPath, Joined>,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Join { request_id, path } => {
            if let Some(previous) = joined.remove(&path) {
                previous.forwarder.abort();
                context.hub.leave(&path, previous.subscriber);
            }

            match context.hub.join(&path) {
                Ok((subscriber, Subscription { history, deliveries })) => {
                    // Queue the reply before the forwarder can queue anything
                    let frames = join_reply(request_id, path.clone(), history, context.max_frame_bytes);
                    for frame in frames {
                        let _ = out.send(frame);
                    }
                    let forwarder = tokio::spawn(forward(path.clone(), deliveries, out.clone()));
                    joined.insert(path, Joined { subscriber, forwarder });
                    None
                }
                Err(e) => Some(ServerMessage::JoinFailed {
                    request_id,
                    reason: e.to_string(),
                }),
            }
        }

        ClientMessage::Leave { path } => {
            if let Some(entry) = joined.remove(&path) {
                entry.forwarder.abort();
                context.hub.leave(&path, entry.subscriber);
            }
            None
        }

        ClientMessage::Submit {
            request_id,
            path,
            event,
        } => Some(match undeliverable(&event, context.max_frame_bytes) {
            Some(reason) => ServerMessage::Rejected { request_id, reason },
            None => match context.hub.submit(&path, event) {
                Ok(ack) => ServerMessage::Ack {
                    request_id,
                    event_id: ack.event_id,
                },
                Err(e) => ServerMessage::Rejected {
                    request_id,
                    reason: e.to_string(),
                },
            },
        }),

        #[cfg(feature = "battle")]
        ClientMessage::Battle { request_id, request } => Some(match &context.battle {
            Some(service) => match service.handle(request) {
                Ok(response) => ServerMessage::BattleResult {
                    request_id,
                    response,
                },
                Err(e) => ServerMessage::BattleFailed {
                    request_id,
                    reason: e.to_string(),
                },
            },
            None => ServerMessage::BattleFailed {
                request_id,
                reason: "battle service unavailable".to_string(),
            },
        }),

        ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong {
            client_timestamp: timestamp,
            server_timestamp: context.time.now_ms(),
        }),
    }
}

/// Events that could not be fanned out to subscribers within one frame
fn undeliverable(event: &Event, max_frame_bytes: usize) -> Option<String> {
    let len = encode(event).map_or(usize::MAX, |bytes| bytes.len());
    let limit = max_frame_bytes.saturating_sub(ENVELOPE_RESERVE);
    (len > limit).then(|| format!("event too large: {} bytes (max {})", len, limit))
}

async fn forward(
    path: EntityPath,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    out: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let message = match delivery {
            Delivery::CreateEvent(event) => ServerMessage::CreateEvent {
                path: path.clone(),
                event,
            },
            Delivery::Event(event) => ServerMessage::Event {
                path: path.clone(),
                event,
            },
        };
        if out.send(message).is_err() {
            break;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    metrics: Arc<Metrics>,
    max_frame_bytes: usize,
) {
    while let Some(message) = rx.recv().await {
        let written = match write_message(&mut writer, &message, max_frame_bytes).await {
            Err(FramingError::MessageTooLarge(len, max)) => {
                let reason = format!("reply too large: {} bytes (max {})", len, max);
                match message.failure(reason) {
                    Some(failure) => {
                        tracing::warn!("Replacing oversized reply ({} > {}) with a failure", len, max);
                        write_message(&mut writer, &failure, max_frame_bytes).await
                    }
                    None => {
                        tracing::warn!("Dropping oversized server message ({} > {})", len, max);
                        continue;
                    }
                }
            }
            written => written,
        };

        match written {
            Ok(len) => metrics.record_sent(len),
            Err(FramingError::Codec(e)) => {
                tracing::error!("Failed to encode server message: {}", e);
            }
            Err(e) => {
                tracing::debug!("Write failed: {}", e);
                break;
            }
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ServerMessage,
    max_frame_bytes: usize,
) -> Result<usize, FramingError> {
    let data = encode(message)?;
    write_frame(writer, &data, max_frame_bytes).await?;
    Ok(data.len())
}
