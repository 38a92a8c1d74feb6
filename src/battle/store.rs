//! Battle CAS transactions
//!
//! Three independent cell stores: the winner per battle, each pickup per
//! (battle, pickup) and each team's power-up inventory per (battle, team).
//! Transactions that find their goal already met resolve to the current
//! value without writing.

use bitvec::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use crate::battle::{
    BattleId, Pickup, PickupId, PickupLocation, PowerUp, PowerUpId, PowerUpKind, Winner,
};
use crate::cache::EntityPath;
use crate::event::TeamId;
use crate::game::GameState;
use crate::metrics::Metrics;
use crate::store::{CasError, CasStore, Tx, TxResult};
use crate::util::clock::TimeSource;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BattleError {
    #[error(transparent)]
    Contention(#[from] CasError),
    #[error("Unknown pickup {0}")]
    UnknownPickup(PickupId),
    #[error("Unknown board {0}")]
    UnknownBoard(EntityPath),
}

/// Result of a pickup claim
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    /// This claim flipped the pickup
    pub claimed: bool,
    pub pickup: Pickup,
    /// Power-up granted to the claiming team
    pub powerup: Option<PowerUp>,
}

pub struct BattleStore {
    winners: CasStore<BattleId, Winner>,
    pickups: CasStore<(BattleId, PickupId), Pickup>,
    inventories: CasStore<(BattleId, TeamId), Vec<PowerUp>>,
    time: Arc<dyn TimeSource>,
    metrics: Arc<Metrics>,
}

impl BattleStore {
    pub fn new(time: Arc<dyn TimeSource>, metrics: Arc<Metrics>) -> Self {
        Self {
            winners: CasStore::new(),
            pickups: CasStore::new(),
            inventories: CasStore::new(),
            time,
            metrics,
        }
    }

    fn record<V>(&self, result: &TxResult<V>) {
        self.metrics.record_cas(result.committed, result.retries);
    }

    /// First team to call this wins; later calls return the recorded winner
    pub fn set_winner(&self, battle: &str, team: TeamId) -> Result<Winner, BattleError> {
        let completed_at = self.time.now_ms();
        let result = self.winners.transact(&battle.to_string(), |current| match current {
            Some(_) => Tx::Keep,
            None => Tx::Set(Winner { team, completed_at }),
        })?;
        self.record(&result);

        if result.committed {
            self.metrics.winners_set.fetch_add(1, Ordering::Relaxed);
            info!("Battle {} won by team {}", battle, team);
        }
        // A winner is always present once the transaction resolves
        Ok(result.value.unwrap_or(Winner { team, completed_at }))
    }

    pub fn winner(&self, battle: &str) -> Option<Winner> {
        self.winners.get(&battle.to_string())
    }

    /// Claim a pickup for `team`.
    ///
    /// Eligible only while the pickup is unclaimed and `board` (the state of
    /// the pickup's board) holds the correct value in the pickup's cell. A
    /// successful claim is followed by a separate grant transaction.
    pub fn claim_pickup(
        &self,
        battle: &str,
        pickup_id: PickupId,
        team: TeamId,
        board: &GameState,
    ) -> Result<ClaimOutcome, BattleError> {
        let key = (battle.to_string(), pickup_id);
        let current = self
            .pickups
            .get(&key)
            .ok_or(BattleError::UnknownPickup(pickup_id))?;

        if current.picked_up || !board.is_correct(current.location.cell) {
            debug!("Pickup {} not eligible for team {}", pickup_id, team);
            return Ok(ClaimOutcome {
                claimed: false,
                pickup: current,
                powerup: None,
            });
        }

        let result = self.pickups.transact(&key, |pickup| match pickup {
            Some(pickup) if !pickup.picked_up => Tx::Set(Pickup {
                picked_up: true,
                ..pickup.clone()
            }),
            _ => Tx::Keep,
        })?;
        self.record(&result);

        let pickup = result.value.ok_or(BattleError::UnknownPickup(pickup_id))?;
        if !result.committed {
            return Ok(ClaimOutcome {
                claimed: false,
                pickup,
                powerup: None,
            });
        }

        self.metrics.pickups_claimed.fetch_add(1, Ordering::Relaxed);
        let powerup = PowerUp::from_pickup(&pickup);
        self.grant_powerup(battle, team, powerup.clone())?;
        info!("Team {} claimed pickup {} ({:?})", team, pickup_id, pickup.kind);

        Ok(ClaimOutcome {
            claimed: true,
            pickup,
            powerup: Some(powerup),
        })
    }

    /// Append a power-up to a team's inventory
    pub fn grant_powerup(
        &self,
        battle: &str,
        team: TeamId,
        powerup: PowerUp,
    ) -> Result<Vec<PowerUp>, BattleError> {
        let result = self
            .inventories
            .transact(&(battle.to_string(), team), |inventory| {
                let mut next = inventory.cloned().unwrap_or_default();
                if next.iter().any(|p| p.id == powerup.id) {
                    return Tx::Keep;
                }
                next.push(powerup.clone());
                Tx::Set(next)
            })?;
        self.record(&result);

        if result.committed {
            self.metrics.powerups_granted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result.value.unwrap_or_default())
    }

    /// Redeem a power-up; `None` if the team does not hold it (already used)
    pub fn use_powerup(
        &self,
        battle: &str,
        team: TeamId,
        powerup_id: PowerUpId,
    ) -> Result<Option<PowerUp>, BattleError> {
        let mut used = None;
        let result = self
            .inventories
            .transact(&(battle.to_string(), team), |inventory| {
                used = None;
                let Some(inventory) = inventory else {
                    return Tx::Keep;
                };
                let Some(found) = inventory.iter().find(|p| p.id == powerup_id) else {
                    return Tx::Keep;
                };
                used = Some(found.clone());
                Tx::Set(
                    inventory
                        .iter()
                        .filter(|p| p.id != powerup_id)
                        .cloned()
                        .collect(),
                )
            })?;
        self.record(&result);

        if !result.committed {
            return Ok(None);
        }
        self.metrics.powerups_used.fetch_add(1, Ordering::Relaxed);
        Ok(used)
    }

    pub fn powerups(&self, battle: &str, team: TeamId) -> Vec<PowerUp> {
        self.inventories
            .get(&(battle.to_string(), team))
            .unwrap_or_default()
    }

    /// Every pickup of `battle`, claimed or not
    pub fn pickups(&self, battle: &str) -> Vec<Pickup> {
        let mut pickups: Vec<Pickup> = self
            .pickups
            .scan(|(b, _)| b == battle)
            .into_iter()
            .map(|(_, pickup)| pickup)
            .collect();
        pickups.sort_by_key(|p| p.id);
        pickups
    }

    pub fn count_live_pickups(&self, battle: &str) -> usize {
        self.pickups(battle).iter().filter(|p| !p.picked_up).count()
    }

    /// Place up to `count` new pickups on distinct white cells that hold no
    /// live pickup, sampled across `boards`
    pub fn spawn_powerups<R: Rng + ?Sized>(
        &self,
        battle: &str,
        boards: &[(EntityPath, &GameState)],
        count: usize,
        rng: &mut R,
    ) -> Result<Vec<Pickup>, BattleError> {
        let live: Vec<Pickup> = self
            .pickups(battle)
            .into_iter()
            .filter(|p| !p.picked_up)
            .collect();

        let mut candidates = Vec::new();
        for (path, state) in boards {
            let cols = state.cols();
            let mut occupied = bitvec![0; state.rows() * cols];
            for pickup in live.iter().filter(|p| &p.location.board == path) {
                let index = pickup.location.cell.row * cols + pickup.location.cell.col;
                if index < occupied.len() {
                    occupied.set(index, true);
                }
            }

            for cell in state.cells_in_scope(&crate::event::Scope::All) {
                if !occupied[cell.row * cols + cell.col] {
                    candidates.push(PickupLocation {
                        board: path.clone(),
                        cell,
                    });
                }
            }
        }

        let chosen: Vec<PickupLocation> = candidates
            .choose_multiple(rng, count)
            .cloned()
            .collect();

        let mut spawned = Vec::with_capacity(chosen.len());
        for location in chosen {
            let pickup = Pickup {
                id: uuid::Uuid::new_v4(),
                location,
                kind: PowerUpKind::random(rng),
                picked_up: false,
            };
            let result = self
                .pickups
                .transact(&(battle.to_string(), pickup.id), |existing| match existing {
                    Some(_) => Tx::Keep,
                    None => Tx::Set(pickup.clone()),
                })?;
            self.record(&result);
            if result.committed {
                spawned.push(pickup);
            }
        }

        debug!("Spawned {} pickups in battle {}", spawned.len(), battle);
        Ok(spawned)
    }
}
