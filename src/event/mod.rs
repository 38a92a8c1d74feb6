//! Event model
//!
//! Every mutation of a shared entity is an immutable [`Event`]: a typed
//! [`EventKind`] plus the server-assigned timestamp, the acting user and a
//! client-assigned correlation id used to reconcile optimistic copies.

pub mod puzzle;
pub mod scope;
pub mod wire;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use puzzle::{Clue, ClueSet, PuzzleDocument, PuzzleInfo};
pub use scope::{Coord, Scope};
pub use wire::{LogRow, WireEvent};

pub use crate::util::clock::Timestamp;

/// Opaque user identifier
pub type UserId = String;

/// Correlation id, assigned once when the event is first built
pub type EventId = Uuid;

/// Battle team index
pub type TeamId = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub pid: String,
    pub puzzle: PuzzleDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCellParams {
    pub cell: Coord,
    /// Zero or one printable character; empty clears the cell
    pub value: String,
    #[serde(default)]
    pub pencil: bool,
    #[serde(default)]
    pub autocheck: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCursorParams {
    pub id: UserId,
    pub cell: Coord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddPingParams {
    pub id: UserId,
    pub cell: Coord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDisplayNameParams {
    pub id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateColorParams {
    pub id: UserId,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockAction {
    Start,
    Pause,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateClockParams {
    pub action: ClockAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeParams {
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetParams {
    pub scope: Scope,
    /// Also clear cells already verified or revealed
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParams {
    pub sender_id: UserId,
    pub sender: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTeamIdParams {
    pub id: UserId,
    pub team_id: TeamId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTeamNameParams {
    pub team_id: TeamId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBattleParams {
    pub started_at: Timestamp,
}

/// One variant per event tag
///
/// Serialized adjacently tagged (`{"type": ..., "params": ...}`), matching the
/// wire shape. `Unknown` keeps tags this build does not recognise so they can
/// be stored and forwarded untouched; the reducer treats them as no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum EventKind {
    Create(CreateParams),
    UpdateCell(UpdateCellParams),
    UpdateCursor(UpdateCursorParams),
    AddPing(AddPingParams),
    UpdateDisplayName(UpdateDisplayNameParams),
    UpdateColor(UpdateColorParams),
    UpdateClock(UpdateClockParams),
    Check(ScopeParams),
    Reveal(ScopeParams),
    Reset(ResetParams),
    Chat(ChatParams),
    UpdateTeamId(UpdateTeamIdParams),
    UpdateTeamName(UpdateTeamNameParams),
    StartBattle(StartBattleParams),
    #[serde(skip)]
    Unknown {
        tag: String,
        params: serde_json::Value,
    },
}

/// Tags with a typed variant in [`EventKind`]
pub const KNOWN_TAGS: &[&str] = &[
    "create",
    "updateCell",
    "updateCursor",
    "addPing",
    "updateDisplayName",
    "updateColor",
    "updateClock",
    "check",
    "reveal",
    "reset",
    "chat",
    "updateTeamId",
    "updateTeamName",
    "startBattle",
];

impl EventKind {
    /// Wire tag of this event
    pub fn tag(&self) -> &str {
        match self {
            EventKind::Create(_) => "create",
            EventKind::UpdateCell(_) => "updateCell",
            EventKind::UpdateCursor(_) => "updateCursor",
            EventKind::AddPing(_) => "addPing",
            EventKind::UpdateDisplayName(_) => "updateDisplayName",
            EventKind::UpdateColor(_) => "updateColor",
            EventKind::UpdateClock(_) => "updateClock",
            EventKind::Check(_) => "check",
            EventKind::Reveal(_) => "reveal",
            EventKind::Reset(_) => "reset",
            EventKind::Chat(_) => "chat",
            EventKind::UpdateTeamId(_) => "updateTeamId",
            EventKind::UpdateTeamName(_) => "updateTeamName",
            EventKind::StartBattle(_) => "startBattle",
            EventKind::Unknown { tag, .. } => tag,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, EventKind::Create(_))
    }
}

/// Immutable, timestamped mutation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    /// Server-assigned on append; client-local for optimistic copies
    pub timestamp: Timestamp,
    pub user: Option<UserId>,
}

impl Event {
    /// Build a fresh event with a new correlation id
    pub fn new(kind: EventKind, user: Option<UserId>, timestamp: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp,
            user,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    pub fn is_create(&self) -> bool {
        self.kind.is_create()
    }
}

/// Event decoding errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("Malformed params for '{tag}': {reason}")]
    MalformedParams { tag: String, reason: String },
    #[error("Malformed log row payload: {0}")]
    MalformedPayload(String),
}
