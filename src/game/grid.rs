//! Grid construction and standard crossword numbering

use crate::event::puzzle::BLACK_SQUARE;
use crate::event::{Clue, Coord};

/// Clue texts indexed by clue number (`across[n]` is the clue for n-Across)
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AlignedClues {
    pub across: Vec<Option<String>>,
    pub down: Vec<Option<String>>,
}

/// Numbers assigned to the white cells of a grid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Numbering {
    pub numbers: Vec<Vec<Option<u32>>>,
    pub across_starts: Vec<u32>,
    pub down_starts: Vec<u32>,
    pub max_number: u32,
}

pub fn is_black_value(value: &str) -> bool {
    value == BLACK_SQUARE || value.is_empty()
}

/// Pad ragged rows with black squares so every row has the same width
pub fn normalize_solution(solution: &[Vec<String>]) -> Vec<Vec<String>> {
    let cols = solution.iter().map(Vec::len).max().unwrap_or(0);
    solution
        .iter()
        .map(|row| {
            let mut row = row.clone();
            row.resize(cols, BLACK_SQUARE.to_string());
            row
        })
        .collect()
}

/// Number every cell that starts an across or down entry, left to right,
/// top to bottom
pub fn compute_numbering(solution: &[Vec<String>]) -> Numbering {
    let rows = solution.len();
    let cols = solution.first().map_or(0, Vec::len);
    let white = |r: usize, c: usize| -> bool {
        solution
            .get(r)
            .and_then(|row| row.get(c))
            .is_some_and(|v| !is_black_value(v))
    };

    let mut numbering = Numbering {
        numbers: vec![vec![None; cols]; rows],
        ..Default::default()
    };
    let mut next = 1;

    for r in 0..rows {
        for c in 0..cols {
            if !white(r, c) {
                continue;
            }
            let starts_across = (c == 0 || !white(r, c - 1)) && white(r, c + 1);
            let starts_down = (r == 0 || !white(r - 1, c)) && white(r + 1, c);
            if !(starts_across || starts_down) {
                continue;
            }

            numbering.numbers[r][c] = Some(next);
            if starts_across {
                numbering.across_starts.push(next);
            }
            if starts_down {
                numbering.down_starts.push(next);
            }
            numbering.max_number = next;
            next += 1;
        }
    }

    numbering
}

/// Place each clue at the index of its number; numbers past the grid's
/// highest number are dropped
pub fn align_clues(clues: &[Clue], max_number: u32) -> Vec<Option<String>> {
    let mut aligned = vec![None; max_number as usize + 1];
    for clue in clues {
        if let Some(slot) = aligned.get_mut(clue.number as usize) {
            *slot = Some(clue.text.clone());
        }
    }
    aligned
}

/// All white coordinates, row-major
pub fn white_cells(solution: &[Vec<String>]) -> Vec<Coord> {
    solution
        .iter()
        .enumerate()
        .flat_map(|(r, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, v)| !is_black_value(v))
                .map(move |(c, _)| Coord::new(r, c))
        })
        .collect()
}
