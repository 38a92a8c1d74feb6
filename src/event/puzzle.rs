//! Puzzle document handed over by the format converter at create time

use serde::{Deserialize, Serialize};

use crate::event::Coord;

/// Marker used in solution rows for black squares
pub const BLACK_SQUARE: &str = ".";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PuzzleInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub copyright: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clue {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClueSet {
    #[serde(default)]
    pub across: Vec<Clue>,
    #[serde(default)]
    pub down: Vec<Clue>,
}

/// Converted puzzle: solution rows (`"."` marks black squares) plus clues
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PuzzleDocument {
    pub solution: Vec<Vec<String>>,
    #[serde(default)]
    pub clues: ClueSet,
    #[serde(default)]
    pub info: PuzzleInfo,
    #[serde(default)]
    pub circles: Vec<Coord>,
}

impl PuzzleDocument {
    /// Build from compact rows such as `["AB.", "CDE"]`
    pub fn from_rows(rows: &[&str]) -> Self {
        let solution = rows
            .iter()
            .map(|row| row.chars().map(|c| c.to_string()).collect())
            .collect();
        Self {
            solution,
            ..Default::default()
        }
    }

    pub fn with_clues(mut self, across: &[(u32, &str)], down: &[(u32, &str)]) -> Self {
        let to_clues = |list: &[(u32, &str)]| {
            list.iter()
                .map(|(number, text)| Clue {
                    number: *number,
                    text: (*text).to_string(),
                })
                .collect()
        };
        self.clues = ClueSet {
            across: to_clues(across),
            down: to_clues(down),
        };
        self
    }
}
