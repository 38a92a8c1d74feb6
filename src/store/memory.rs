//! In-memory event log
//!
//! Rows are kept in their persisted shape ([`LogRow`]) and decoded on read,
//! so the row codec is exercised exactly as a database-backed log would.

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error};

use crate::event::{Event, LogRow};
use crate::store::{EventLog, StoreError};
use crate::util::clock::{SystemTimeSource, TimeSource};

pub struct InMemoryEventLog {
    rows: RwLock<HashMap<String, Vec<LogRow>>>,
    time: Arc<dyn TimeSource>,
}

impl InMemoryEventLog {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            time,
        }
    }

    /// Raw rows for inspection (tests, admin tooling)
    pub fn rows(&self, entity_id: &str) -> Vec<LogRow> {
        self.rows
            .read()
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    fn decode(entity_id: &str, row: &LogRow) -> Result<Event, StoreError> {
        row.to_event().map_err(|source| StoreError::CorruptRow {
            entity_id: entity_id.to_string(),
            source,
        })
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }
}

impl EventLog for InMemoryEventLog {
    fn append(&self, entity_id: &str, event: Event) -> Result<Event, StoreError> {
        let mut rows = self.rows.write();
        let log = rows.entry(entity_id.to_string()).or_default();

        // Never step backwards, even if the wall clock does
        let last = log.last().map(|row| row.timestamp).unwrap_or(i64::MIN);
        let stamped = event.with_timestamp(self.time.now_ms().max(last));

        log.push(LogRow::from_event(entity_id, &stamped));
        debug!(
            "Appended {} to {} at {} ({} rows)",
            stamped.tag(),
            entity_id,
            stamped.timestamp,
            log.len()
        );
        Ok(stamped)
    }

    fn events(&self, entity_id: &str) -> Result<Vec<Event>, StoreError> {
        let rows = self.rows.read();
        let Some(log) = rows.get(entity_id) else {
            return Ok(Vec::new());
        };
        log.iter().map(|row| Self::decode(entity_id, row)).collect()
    }

    fn create_event(&self, entity_id: &str) -> Result<Option<Event>, StoreError> {
        let rows = self.rows.read();
        let Some(log) = rows.get(entity_id) else {
            return Ok(None);
        };

        let creates: Vec<&LogRow> = log.iter().filter(|row| row.is_create()).collect();
        match creates.as_slice() {
            [] => Ok(None),
            [row] => Self::decode(entity_id, row).map(Some),
            many => {
                error!(
                    "Data integrity: {} has {} create rows, refusing to pick one",
                    entity_id,
                    many.len()
                );
                Ok(None)
            }
        }
    }

    fn len(&self, entity_id: &str) -> usize {
        self.rows.read().get(entity_id).map_or(0, Vec::len)
    }

    fn entity_ids(&self) -> Vec<String> {
        self.rows.read().keys().cloned().collect()
    }
}
