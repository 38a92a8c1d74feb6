//! Crossword Sync Library
//!
//! Real-time synchronization core for collaborative crossword games: an
//! append-only event log per entity, a pure reducer from events to game
//! state, and a client entity cache that merges optimistic local edits with
//! the server's confirmed order.
//!
//! # Features
//!
//! - `battle` - Team battle support: winner recording and power-up pickups on a compare-and-set store (enabled by default)
//! - `minimal` - Build without optional features for testing/debugging

pub mod cache;
pub mod config;
pub mod event;
pub mod game;
pub mod lifecycle;
pub mod metrics;
pub mod net;
pub mod store;
pub mod util;

// Feature-gated modules (enabled by default)
#[cfg(feature = "battle")]
pub mod battle;

pub use cache::{EntityCache, EntityPath};
pub use event::{Event, EventKind};
pub use game::{reduce, replay, GameState};
