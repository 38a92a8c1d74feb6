//! Server-side storage primitives
//!
//! - [`EventLog`]: append-only, per-entity ordered event log
//! - [`CasStore`]: versioned key/value cells with compare-and-swap transactions

pub mod cas;
pub mod memory;

pub use cas::{CasError, CasStore, Tx, TxResult};
pub use memory::InMemoryEventLog;

use crate::event::{Event, EventError};

/// Ordered append primitive backing every shared entity
///
/// Entity ids are the entity path strings (`/game/abc`). Appends are not
/// deduplicated: two submissions of the same logical action produce two rows.
pub trait EventLog: Send + Sync {
    /// Persist `event`, overwriting its timestamp with the server's
    fn append(&self, entity_id: &str, event: Event) -> Result<Event, StoreError>;

    /// All events for `entity_id`, timestamp ascending
    fn events(&self, entity_id: &str) -> Result<Vec<Event>, StoreError>;

    /// The single `create` event, or `None` if absent or ambiguous
    fn create_event(&self, entity_id: &str) -> Result<Option<Event>, StoreError>;

    /// Number of rows stored for `entity_id`
    fn len(&self, entity_id: &str) -> usize;

    /// Ids of every entity with at least one row
    fn entity_ids(&self) -> Vec<String>;
}

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Corrupt row for {entity_id}: {source}")]
    CorruptRow {
        entity_id: String,
        #[source]
        source: EventError,
    },
}
