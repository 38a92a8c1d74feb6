//! Derived game state
//!
//! Everything a renderer reads: the cell grid, aligned clues, presence
//! (cursors, pings, names, colors, teams), chat, the clock and the solved
//! flag. Produced only by the reducer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::event::{Coord, PuzzleDocument, PuzzleInfo, Scope, TeamId, Timestamp, UserId};
use crate::game::grid::{self, AlignedClues};

/// Pings older than this many entries are dropped
pub const MAX_PINGS: usize = 32;

/// One grid square
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    /// Zero or one character; empty when unfilled
    pub value: String,
    pub black: bool,
    pub number: Option<u32>,
    /// Verified correct (by check, autocheck or reveal)
    pub checked: bool,
    /// Verified wrong; cleared by the next edit
    pub incorrect: bool,
    pub revealed: bool,
    pub pencil: bool,
    pub circled: bool,
    /// User who last wrote the value
    pub attribution: Option<UserId>,
}

impl Cell {
    pub fn white() -> Self {
        Self::default()
    }

    pub fn black() -> Self {
        Self {
            black: true,
            ..Default::default()
        }
    }

    pub fn is_filled(&self) -> bool {
        !self.value.is_empty()
    }

    /// Verified cells refuse edits
    pub fn is_locked(&self) -> bool {
        self.checked || self.revealed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub cell: Coord,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: UserId,
    pub cell: Coord,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub team_id: Option<TeamId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_id: UserId,
    pub sender: String,
    pub text: String,
    pub timestamp: Timestamp,
}

/// Game clock; elapsed time is derived from transition timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameClock {
    /// Elapsed milliseconds accumulated up to `last_updated`
    pub elapsed_time: i64,
    pub running: bool,
    /// Timestamp of the last start/pause/reset transition
    pub last_updated: Timestamp,
}

impl GameClock {
    pub fn start(&mut self, at: Timestamp) {
        if !self.running {
            self.running = true;
            self.last_updated = at;
        }
    }

    pub fn pause(&mut self, at: Timestamp) {
        if self.running {
            self.elapsed_time += (at - self.last_updated).max(0);
            self.running = false;
            self.last_updated = at;
        }
    }

    pub fn reset(&mut self, at: Timestamp) {
        self.elapsed_time = 0;
        self.last_updated = at;
    }

    /// Elapsed milliseconds as seen at `now`
    pub fn elapsed_at(&self, now: Timestamp) -> i64 {
        if self.running {
            self.elapsed_time + (now - self.last_updated).max(0)
        } else {
            self.elapsed_time
        }
    }
}

/// Renderable snapshot of a game
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub pid: Option<String>,
    pub info: PuzzleInfo,
    pub grid: Vec<Vec<Cell>>,
    pub solution: Vec<Vec<String>>,
    pub clues: AlignedClues,
    pub cursors: BTreeMap<UserId, Cursor>,
    pub pings: Vec<Ping>,
    pub users: BTreeMap<UserId, UserProfile>,
    pub team_names: BTreeMap<TeamId, String>,
    pub battle_started_at: Option<Timestamp>,
    pub chat: Vec<ChatMessage>,
    pub clock: GameClock,
    pub solved: bool,
    pub created_at: Option<Timestamp>,
}

impl GameState {
    /// Fresh state for a newly created game
    pub fn from_puzzle(pid: &str, puzzle: &PuzzleDocument, created_at: Timestamp) -> Self {
        let solution = grid::normalize_solution(&puzzle.solution);
        let numbering = grid::compute_numbering(&solution);

        let mut cells: Vec<Vec<Cell>> = solution
            .iter()
            .enumerate()
            .map(|(r, row)| {
                row.iter()
                    .enumerate()
                    .map(|(c, value)| {
                        if grid::is_black_value(value) {
                            Cell::black()
                        } else {
                            Cell {
                                number: numbering.numbers[r][c],
                                ..Cell::white()
                            }
                        }
                    })
                    .collect()
            })
            .collect();

        for circle in &puzzle.circles {
            if let Some(cell) = cells
                .get_mut(circle.row)
                .and_then(|row| row.get_mut(circle.col))
            {
                cell.circled = true;
            }
        }

        Self {
            pid: Some(pid.to_string()),
            info: puzzle.info.clone(),
            grid: cells,
            clues: AlignedClues {
                across: grid::align_clues(&puzzle.clues.across, numbering.max_number),
                down: grid::align_clues(&puzzle.clues.down, numbering.max_number),
            },
            solution,
            clock: GameClock {
                last_updated: created_at,
                ..Default::default()
            },
            created_at: Some(created_at),
            ..Default::default()
        }
    }

    pub fn is_created(&self) -> bool {
        self.pid.is_some()
    }

    pub fn rows(&self) -> usize {
        self.grid.len()
    }

    pub fn cols(&self) -> usize {
        self.grid.first().map_or(0, Vec::len)
    }

    pub fn cell(&self, at: Coord) -> Option<&Cell> {
        self.grid.get(at.row).and_then(|row| row.get(at.col))
    }

    pub fn cell_mut(&mut self, at: Coord) -> Option<&mut Cell> {
        self.grid.get_mut(at.row).and_then(|row| row.get_mut(at.col))
    }

    pub fn solution_at(&self, at: Coord) -> Option<&str> {
        self.solution
            .get(at.row)
            .and_then(|row| row.get(at.col))
            .map(String::as_str)
    }

    pub fn is_white(&self, at: Coord) -> bool {
        self.cell(at).is_some_and(|cell| !cell.black)
    }

    /// Filled and equal to the solution
    pub fn is_correct(&self, at: Coord) -> bool {
        match (self.cell(at), self.solution_at(at)) {
            (Some(cell), Some(answer)) => {
                !cell.black && cell.is_filled() && cell.value.eq_ignore_ascii_case(answer)
            }
            _ => false,
        }
    }

    /// In-bounds white cells covered by `scope`
    pub fn cells_in_scope(&self, scope: &Scope) -> Vec<Coord> {
        match scope {
            Scope::All => grid::white_cells(&self.solution),
            Scope::Cells(cells) => cells
                .iter()
                .copied()
                .filter(|at| self.is_white(*at))
                .collect(),
        }
    }

    /// Every white cell holds the right answer
    pub fn all_correct(&self) -> bool {
        let whites = grid::white_cells(&self.solution);
        !whites.is_empty() && whites.iter().all(|at| self.is_correct(*at))
    }

    pub fn filled_count(&self) -> usize {
        self.grid
            .iter()
            .flatten()
            .filter(|cell| !cell.black && cell.is_filled())
            .count()
    }

    pub fn team_of(&self, user: &str) -> Option<TeamId> {
        self.users.get(user).and_then(|profile| profile.team_id)
    }
}
