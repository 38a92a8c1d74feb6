//! Wire and persisted-row shapes for events

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::event::{Event, EventError, EventId, EventKind, Timestamp, UserId, KNOWN_TAGS};

/// `{type, params, timestamp, user, id}` as sent over the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub user: Option<UserId>,
    /// Older producers omit the correlation id; one is generated on decode
    #[serde(default)]
    pub id: Option<EventId>,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        let (tag, params) = match event.kind {
            EventKind::Unknown { tag, params } => (tag, params),
            kind => {
                let tag = kind.tag().to_string();
                // Adjacently tagged: {"type": .., "params": ..}
                let params = match serde_json::to_value(&kind) {
                    Ok(Value::Object(mut map)) => map.remove("params").unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                (tag, params)
            }
        };
        Self {
            tag,
            params,
            timestamp: event.timestamp,
            user: event.user,
            id: Some(event.id),
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = EventError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let kind = if KNOWN_TAGS.contains(&wire.tag.as_str()) {
            serde_json::from_value(json!({ "type": wire.tag, "params": wire.params })).map_err(
                |e| EventError::MalformedParams {
                    tag: wire.tag.clone(),
                    reason: e.to_string(),
                },
            )?
        } else {
            EventKind::Unknown {
                tag: wire.tag,
                params: wire.params,
            }
        };

        Ok(Event {
            id: wire.id.unwrap_or_else(Uuid::new_v4),
            kind,
            timestamp: wire.timestamp,
            user: wire.user,
        })
    }
}

/// Persisted log row: `(entity_id, user_id, timestamp, event_type, event_payload)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub entity_id: String,
    pub user_id: Option<UserId>,
    pub timestamp: Timestamp,
    pub event_type: String,
    pub event_payload: Value,
}

impl LogRow {
    pub fn from_event(entity_id: &str, event: &Event) -> Self {
        let wire = WireEvent::from(event.clone());
        Self {
            entity_id: entity_id.to_string(),
            user_id: wire.user.clone(),
            timestamp: wire.timestamp,
            event_type: wire.tag.clone(),
            event_payload: json!({ "params": wire.params, "id": wire.id }),
        }
    }

    pub fn to_event(&self) -> Result<Event, EventError> {
        let Value::Object(payload) = &self.event_payload else {
            return Err(EventError::MalformedPayload(format!(
                "expected object for {} row",
                self.event_type
            )));
        };
        let id = match payload.get("id") {
            Some(Value::Null) | None => None,
            Some(raw) => Some(
                serde_json::from_value(raw.clone())
                    .map_err(|e| EventError::MalformedPayload(e.to_string()))?,
            ),
        };
        Event::try_from(WireEvent {
            tag: self.event_type.clone(),
            params: payload.get("params").cloned().unwrap_or(Value::Null),
            timestamp: self.timestamp,
            user: self.user_id.clone(),
            id,
        })
    }

    pub fn is_create(&self) -> bool {
        self.event_type == "create"
    }
}
