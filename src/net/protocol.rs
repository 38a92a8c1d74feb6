use serde::{Deserialize, Serialize};

#[cfg(feature = "battle")]
use crate::battle::{BattleRequest, BattleResponse};
use crate::cache::EntityPath;
use crate::event::{Event, EventId, Timestamp};

/// Correlates a request with its response on one connection
pub type RequestId = u64;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to an entity; answered with `Joined` or `JoinFailed`
    Join {
        request_id: RequestId,
        path: EntityPath,
    },
    /// Drop the subscription for an entity
    Leave { path: EntityPath },
    /// Submit an event; answered with `Ack` or `Rejected`
    Submit {
        request_id: RequestId,
        path: EntityPath,
        event: Event,
    },
    #[cfg(feature = "battle")]
    Battle {
        request_id: RequestId,
        request: BattleRequest,
    },
    /// Ping for latency measurement
    Ping { timestamp: Timestamp },
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Leading slice of a join's history; the rest arrives in `Joined`
    History {
        request_id: RequestId,
        events: Vec<Event>,
    },
    Joined {
        request_id: RequestId,
        path: EntityPath,
        history: Vec<Event>,
    },
    JoinFailed {
        request_id: RequestId,
        reason: String,
    },
    /// Submission accepted for ordering (not yet persisted)
    Ack {
        request_id: RequestId,
        event_id: EventId,
    },
    Rejected {
        request_id: RequestId,
        reason: String,
    },
    /// Confirmed create event for a joined entity
    CreateEvent { path: EntityPath, event: Event },
    /// Confirmed non-create event for a joined entity
    Event { path: EntityPath, event: Event },
    #[cfg(feature = "battle")]
    BattleResult {
        request_id: RequestId,
        response: BattleResponse,
    },
    #[cfg(feature = "battle")]
    BattleFailed {
        request_id: RequestId,
        reason: String,
    },
    Pong {
        client_timestamp: Timestamp,
        server_timestamp: Timestamp,
    },
    /// Unparseable or unsupported request
    Error { reason: String },
}

impl ServerMessage {
    /// Request this message answers, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerMessage::Joined { request_id, .. }
            | ServerMessage::JoinFailed { request_id, .. }
            | ServerMessage::Ack { request_id, .. }
            | ServerMessage::Rejected { request_id, .. } => Some(*request_id),
            #[cfg(feature = "battle")]
            ServerMessage::BattleResult { request_id, .. }
            | ServerMessage::BattleFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Short failure standing in for a request reply that cannot be
    /// delivered. `None` for messages no request is waiting on.
    pub fn failure(&self, reason: String) -> Option<ServerMessage> {
        match self {
            ServerMessage::History { request_id, .. }
            | ServerMessage::Joined { request_id, .. }
            | ServerMessage::JoinFailed { request_id, .. } => Some(ServerMessage::JoinFailed {
                request_id: *request_id,
                reason,
            }),
            ServerMessage::Ack { request_id, .. } | ServerMessage::Rejected { request_id, .. } => {
                Some(ServerMessage::Rejected {
                    request_id: *request_id,
                    reason,
                })
            }
            #[cfg(feature = "battle")]
            ServerMessage::BattleResult { request_id, .. }
            | ServerMessage::BattleFailed { request_id, .. } => Some(ServerMessage::BattleFailed {
                request_id: *request_id,
                reason,
            }),
            _ => None,
        }
    }
}

/// Room left in every frame for the envelope around an event list
pub const ENVELOPE_RESERVE: usize = 512;

/// Split a join's history into `History` frames followed by one `Joined`,
/// each sized to fit `max_frame_bytes`. An event too large for any frame
/// still gets a frame of its own; the writer turns that into `JoinFailed`.
pub fn join_reply(
    request_id: RequestId,
    path: EntityPath,
    history: Vec<Event>,
    max_frame_bytes: usize,
) -> Vec<ServerMessage> {
    let budget = max_frame_bytes.saturating_sub(ENVELOPE_RESERVE);
    let mut frames = Vec::new();
    let mut chunk: Vec<Event> = Vec::new();
    let mut chunk_bytes = 0;

    for event in history {
        // +1 for the separating comma
        let size = serde_json::to_vec(&event).map_or(budget, |bytes| bytes.len()) + 1;
        if !chunk.is_empty() && chunk_bytes + size > budget {
            frames.push(ServerMessage::History {
                request_id,
                events: std::mem::take(&mut chunk),
            });
            chunk_bytes = 0;
        }
        chunk_bytes += size;
        chunk.push(event);
    }

    frames.push(ServerMessage::Joined {
        request_id,
        path,
        history: chunk,
    });
    frames
}

/// Encode a message to JSON bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decode a message from JSON bytes
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChatParams, EventKind, Scope, ScopeParams};

    #[test]
    fn test_client_message_wire_shape() {
        let event = Event::new(EventKind::Check(ScopeParams { scope: Scope::All }), None, 5);
        let message = ClientMessage::Submit {
            request_id: 7,
            path: EntityPath::game("g").unwrap(),
            event: event.clone(),
        };

        let json: serde_json::Value = serde_json::from_slice(&encode(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "submit");
        assert_eq!(json["path"], "/game/g");
        assert_eq!(json["event"]["type"], "check");
        assert_eq!(json["event"]["params"]["scope"], "all");

        let back: ClientMessage = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_request_id() {
        let ack = ServerMessage::Ack {
            request_id: 3,
            event_id: uuid::Uuid::nil(),
        };
        assert_eq!(ack.request_id(), Some(3));

        let pong = ServerMessage::Pong {
            client_timestamp: 1,
            server_timestamp: 2,
        };
        assert_eq!(pong.request_id(), None);
    }

    #[test]
    fn test_join_reply_splits_long_history() {
        let path = EntityPath::game("g").unwrap();
        let history: Vec<Event> = (0..600)
            .map(|i| {
                Event::new(
                    EventKind::Chat(ChatParams {
                        sender_id: "a".to_string(),
                        sender: "A".to_string(),
                        text: "x".repeat(100),
                    }),
                    None,
                    i,
                )
            })
            .collect();
        let total = serde_json::to_vec(&history).unwrap().len();
        assert!(total > 65536);

        let frames = join_reply(9, path.clone(), history.clone(), 65536);
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(encode(frame).unwrap().len() <= 65536);
        }

        let mut rebuilt = Vec::new();
        for frame in &frames[..frames.len() - 1] {
            match frame {
                ServerMessage::History { request_id, events } => {
                    assert_eq!(*request_id, 9);
                    rebuilt.extend(events.iter().cloned());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        match frames.last() {
            Some(ServerMessage::Joined {
                request_id,
                path: p,
                history: tail,
            }) => {
                assert_eq!(*request_id, 9);
                assert_eq!(p, &path);
                rebuilt.extend(tail.iter().cloned());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rebuilt, history);
    }

    #[test]
    fn test_join_reply_short_history_is_one_frame() {
        let path = EntityPath::game("g").unwrap();
        let frames = join_reply(1, path, Vec::new(), 65536);
        assert!(matches!(
            frames.as_slice(),
            [ServerMessage::Joined { history, .. }] if history.is_empty()
        ));
    }

    #[test]
    fn test_failure_replaces_request_replies_only() {
        let joined = ServerMessage::Joined {
            request_id: 4,
            path: EntityPath::game("g").unwrap(),
            history: Vec::new(),
        };
        assert_eq!(
            joined.failure("too large".to_string()),
            Some(ServerMessage::JoinFailed {
                request_id: 4,
                reason: "too large".to_string()
            })
        );

        let error = ServerMessage::Error {
            reason: "x".to_string(),
        };
        assert_eq!(error.failure("too large".to_string()), None);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let result: Result<ClientMessage, _> = decode(br#"{"type":"explode"}"#);
        assert!(result.is_err());
    }
}
