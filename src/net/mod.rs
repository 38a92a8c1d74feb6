//! Synchronization transport: the channel seam, the server hub and the TCP
//! wire protocol between them

pub mod channel;
pub mod client;
pub mod framing;
pub mod hub;
pub mod protocol;
pub mod transport;

pub use channel::{Ack, ChannelError, ChannelFuture, Delivery, Subscription, SyncChannel};
pub use client::TcpChannel;
pub use hub::{LocalChannel, SubscriberId, SyncHub};
pub use protocol::{ClientMessage, ServerMessage};
pub use transport::SyncServer;
