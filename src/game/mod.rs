//! Game model: grid helpers, derived state and the reducer

pub mod grid;
pub mod reducer;
pub mod state;

pub use reducer::{reduce, replay};
pub use state::{Cell, ChatMessage, Cursor, GameClock, GameState, Ping, UserProfile};
