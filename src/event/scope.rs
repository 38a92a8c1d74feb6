//! Cell coordinates and operation scopes

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Zero-indexed grid coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub row: usize,
    pub col: usize,
}

impl Coord {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Set of cells an operation applies to
///
/// On the wire this is either the literal token `"all"` or a list of
/// `{row, col}` objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Cells(Vec<Coord>),
}

const ALL_TOKEN: &str = "all";

impl Scope {
    pub fn cells(cells: impl IntoIterator<Item = Coord>) -> Self {
        Scope::Cells(cells.into_iter().collect())
    }

    pub fn single(cell: Coord) -> Self {
        Scope::Cells(vec![cell])
    }

    /// An explicit list with no cells; mutation helpers drop these silently
    pub fn is_empty(&self) -> bool {
        matches!(self, Scope::Cells(cells) if cells.is_empty())
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scope::All => serializer.serialize_str(ALL_TOKEN),
            Scope::Cells(cells) => cells.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Token(String),
            Cells(Vec<Coord>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Token(token) if token == ALL_TOKEN => Ok(Scope::All),
            Raw::Token(token) => Err(de::Error::custom(format!(
                "unknown scope token '{}'",
                token
            ))),
            Raw::Cells(cells) => Ok(Scope::Cells(cells)),
        }
    }
}
