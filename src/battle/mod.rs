//! Competitive battle mode
//!
//! Shared battle state (winner, pickups, power-up inventories) lives in
//! compare-and-swap cells and is only ever changed through transactions.

pub mod service;
pub mod store;

pub use service::{BattleRequest, BattleResponse, BattleService};
pub use store::{BattleError, BattleStore, ClaimOutcome};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::EntityPath;
use crate::event::{Coord, TeamId, Timestamp};

pub type BattleId = String;
pub type PickupId = Uuid;
pub type PowerUpId = Uuid;

/// First team to finish; written once per battle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub team: TeamId,
    pub completed_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerUpKind {
    RevealSquare,
    HideCursors,
    ReverseTyping,
    FreezeClock,
}

impl PowerUpKind {
    pub const ALL: [PowerUpKind; 4] = [
        PowerUpKind::RevealSquare,
        PowerUpKind::HideCursors,
        PowerUpKind::ReverseTyping,
        PowerUpKind::FreezeClock,
    ];

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        *Self::ALL.choose(rng).unwrap_or(&PowerUpKind::RevealSquare)
    }
}

/// Cell on one team's board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupLocation {
    pub board: EntityPath,
    pub cell: Coord,
}

/// Collectible bound to a cell; claimed by filling the cell correctly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pickup {
    pub id: PickupId,
    pub location: PickupLocation,
    pub kind: PowerUpKind,
    pub picked_up: bool,
}

/// Power-up held by a team until used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerUp {
    pub id: PowerUpId,
    pub kind: PowerUpKind,
    pub source_pickup: PickupId,
}

impl PowerUp {
    pub fn from_pickup(pickup: &Pickup) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: pickup.kind,
            source_pickup: pickup.id,
        }
    }
}
