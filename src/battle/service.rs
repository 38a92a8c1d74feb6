//! Server-side battle request handling
//!
//! Boards are the game entities of each team. Claims are validated against
//! the board state replayed from the event log, never against client input.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::battle::store::{BattleError, BattleStore, ClaimOutcome};
use crate::battle::{BattleId, Pickup, PickupId, PowerUp, PowerUpId, Winner};
use crate::cache::EntityPath;
use crate::event::TeamId;
use crate::game::{replay, GameState};
use crate::store::EventLog;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BattleRequest {
    SetWinner { battle: BattleId, team: TeamId },
    Winner { battle: BattleId },
    Spawn {
        battle: BattleId,
        boards: Vec<EntityPath>,
        count: usize,
    },
    Claim {
        battle: BattleId,
        pickup: PickupId,
        team: TeamId,
    },
    UsePowerUp {
        battle: BattleId,
        team: TeamId,
        powerup: PowerUpId,
    },
    Pickups { battle: BattleId },
    PowerUps { battle: BattleId, team: TeamId },
    LivePickups { battle: BattleId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum BattleResponse {
    Winner(Option<Winner>),
    Pickups(Vec<Pickup>),
    Claim(ClaimOutcome),
    PowerUps(Vec<PowerUp>),
    PowerUp(Option<PowerUp>),
    Count(usize),
}

pub struct BattleService {
    store: Arc<BattleStore>,
    log: Arc<dyn EventLog>,
}

impl BattleService {
    pub fn new(store: Arc<BattleStore>, log: Arc<dyn EventLog>) -> Self {
        Self { store, log }
    }

    pub fn store(&self) -> &Arc<BattleStore> {
        &self.store
    }

    /// Current state of a board, replayed from the log
    pub fn board_state(&self, board: &EntityPath) -> Result<GameState, BattleError> {
        let id = board.to_string();
        let unknown = || BattleError::UnknownBoard(board.clone());

        let create = self.log.create_event(&id).map_err(|_| unknown())?;
        let events = self.log.events(&id).map_err(|_| unknown())?;
        let Some(create) = create else {
            return Err(unknown());
        };

        let state = replay(Some(&create), events.iter().filter(|e| !e.is_create()));
        Ok(state)
    }

    pub fn handle(&self, request: BattleRequest) -> Result<BattleResponse, BattleError> {
        debug!("Battle request {:?}", request);
        match request {
            BattleRequest::SetWinner { battle, team } => {
                let winner = self.store.set_winner(&battle, team)?;
                Ok(BattleResponse::Winner(Some(winner)))
            }
            BattleRequest::Winner { battle } => Ok(BattleResponse::Winner(self.store.winner(&battle))),
            BattleRequest::Spawn {
                battle,
                boards,
                count,
            } => {
                let states = boards
                    .iter()
                    .map(|path| self.board_state(path))
                    .collect::<Result<Vec<_>, _>>()?;
                let views: Vec<(EntityPath, &GameState)> =
                    boards.iter().cloned().zip(states.iter()).collect();
                let spawned =
                    self.store
                        .spawn_powerups(&battle, &views, count, &mut rand::thread_rng())?;
                Ok(BattleResponse::Pickups(spawned))
            }
            BattleRequest::Claim {
                battle,
                pickup,
                team,
            } => {
                let target = self
                    .store
                    .pickups(&battle)
                    .into_iter()
                    .find(|p| p.id == pickup)
                    .ok_or(BattleError::UnknownPickup(pickup))?;
                let board = self.board_state(&target.location.board)?;
                let outcome = self.store.claim_pickup(&battle, pickup, team, &board)?;
                Ok(BattleResponse::Claim(outcome))
            }
            BattleRequest::UsePowerUp {
                battle,
                team,
                powerup,
            } => Ok(BattleResponse::PowerUp(
                self.store.use_powerup(&battle, team, powerup)?,
            )),
            BattleRequest::Pickups { battle } => Ok(BattleResponse::Pickups(self.store.pickups(&battle))),
            BattleRequest::PowerUps { battle, team } => {
                Ok(BattleResponse::PowerUps(self.store.powerups(&battle, team)))
            }
            BattleRequest::LivePickups { battle } => {
                Ok(BattleResponse::Count(self.store.count_live_pickups(&battle)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Coord, CreateParams, Event, EventKind, PuzzleDocument, UpdateCellParams};
    use crate::metrics::Metrics;
    use crate::store::InMemoryEventLog;
    use crate::util::clock::ManualTimeSource;

    fn service() -> (BattleService, Arc<InMemoryEventLog>) {
        let time = Arc::new(ManualTimeSource::new(100));
        let log = Arc::new(InMemoryEventLog::new(time.clone()));
        let store = Arc::new(BattleStore::new(time, Arc::new(Metrics::new())));
        (BattleService::new(store, log.clone()), log)
    }

    fn create_board(log: &InMemoryEventLog, id: &str, rows: &[&str]) -> EntityPath {
        let path = EntityPath::game(id).unwrap();
        log.append(
            &path.to_string(),
            Event::new(
                EventKind::Create(CreateParams {
                    pid: "p".to_string(),
                    puzzle: PuzzleDocument::from_rows(rows),
                }),
                None,
                0,
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_claim_validated_against_log() {
        let (service, log) = service();
        let board = create_board(&log, "team0", &["A"]);

        let BattleResponse::Pickups(spawned) = service
            .handle(BattleRequest::Spawn {
                battle: "b".to_string(),
                boards: vec![board.clone()],
                count: 1,
            })
            .unwrap()
        else {
            panic!("expected pickups");
        };
        let pickup = spawned[0].id;

        let claim = BattleRequest::Claim {
            battle: "b".to_string(),
            pickup,
            team: 0,
        };
        let BattleResponse::Claim(outcome) = service.handle(claim.clone()).unwrap() else {
            panic!("expected claim");
        };
        assert!(!outcome.claimed);

        log.append(
            &board.to_string(),
            Event::new(
                EventKind::UpdateCell(UpdateCellParams {
                    cell: Coord::new(0, 0),
                    value: "A".to_string(),
                    pencil: false,
                    autocheck: false,
                }),
                Some("u".to_string()),
                0,
            ),
        )
        .unwrap();

        let BattleResponse::Claim(outcome) = service.handle(claim).unwrap() else {
            panic!("expected claim");
        };
        assert!(outcome.claimed);
        assert_eq!(
            service
                .handle(BattleRequest::LivePickups {
                    battle: "b".to_string()
                })
                .unwrap(),
            BattleResponse::Count(0)
        );
    }

    #[test]
    fn test_unknown_board() {
        let (service, _log) = service();
        let err = service
            .handle(BattleRequest::Spawn {
                battle: "b".to_string(),
                boards: vec![EntityPath::game("nope").unwrap()],
                count: 1,
            })
            .unwrap_err();
        assert!(matches!(err, BattleError::UnknownBoard(_)));
    }

    #[test]
    fn test_request_wire_shape() {
        let request = BattleRequest::SetWinner {
            battle: "b".to_string(),
            team: 1,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op"], "setWinner");
        let back: BattleRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
