//! Entity paths (`/game/{id}`, `/puzzle/{id}`, ...)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of collaborative entity, taken from the path prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Game,
    Puzzle,
    Battle,
    Composition,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::Game => "game",
            EntityKind::Puzzle => "puzzle",
            EntityKind::Battle => "battle",
            EntityKind::Composition => "composition",
        }
    }

    /// Whether `attach` on an unregistered path creates the entity.
    ///
    /// Games and compositions are created on demand; puzzles and battles
    /// must be registered with `get_or_create` first, otherwise attach is a
    /// silent no-op.
    pub fn attach_creates(self) -> bool {
        matches!(self, EntityKind::Game | EntityKind::Composition)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "game" => Some(EntityKind::Game),
            "puzzle" => Some(EntityKind::Puzzle),
            "battle" => Some(EntityKind::Battle),
            "composition" => Some(EntityKind::Composition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Malformed entity path '{0}': expected /<kind>/<id>")]
    Malformed(String),
    #[error("Unknown entity kind '{0}'")]
    UnknownKind(String),
    #[error("Invalid entity id '{0}'")]
    InvalidId(String),
}

/// Validated entity path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityPath {
    kind: EntityKind,
    id: String,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl EntityPath {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Result<Self, PathError> {
        let id = id.into();
        if !valid_id(&id) {
            return Err(PathError::InvalidId(id));
        }
        Ok(Self { kind, id })
    }

    pub fn game(id: impl Into<String>) -> Result<Self, PathError> {
        Self::new(EntityKind::Game, id)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for EntityPath {
    type Err = PathError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| PathError::Malformed(raw.to_string()))?;
        let (prefix, id) = rest
            .split_once('/')
            .ok_or_else(|| PathError::Malformed(raw.to_string()))?;
        let kind =
            EntityKind::from_prefix(prefix).ok_or_else(|| PathError::UnknownKind(prefix.to_string()))?;
        Self::new(kind, id)
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.kind.prefix(), self.id)
    }
}

impl TryFrom<String> for EntityPath {
    type Error = PathError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<EntityPath> for String {
    fn from(path: EntityPath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: EntityPath = "/game/abc-123_x".parse().unwrap();
        assert_eq!(path.kind(), EntityKind::Game);
        assert_eq!(path.id(), "abc-123_x");
        assert_eq!(path.to_string(), "/game/abc-123_x");

        let battle: EntityPath = "/battle/b1".parse().unwrap();
        assert_eq!(battle.kind(), EntityKind::Battle);
    }

    #[test]
    fn test_malformed_paths() {
        assert!(matches!(
            "game/abc".parse::<EntityPath>(),
            Err(PathError::Malformed(_))
        ));
        assert!(matches!(
            "/game".parse::<EntityPath>(),
            Err(PathError::Malformed(_))
        ));
        assert!(matches!(
            "/room/abc".parse::<EntityPath>(),
            Err(PathError::UnknownKind(_))
        ));
        assert!(matches!(
            "/game/".parse::<EntityPath>(),
            Err(PathError::InvalidId(_))
        ));
        assert!(matches!(
            "/game/a/b".parse::<EntityPath>(),
            Err(PathError::InvalidId(_))
        ));
    }

    #[test]
    fn test_attach_policy_per_kind() {
        assert!(EntityKind::Game.attach_creates());
        assert!(EntityKind::Composition.attach_creates());
        assert!(!EntityKind::Puzzle.attach_creates());
        assert!(!EntityKind::Battle.attach_creates());
    }

    #[test]
    fn test_serde_as_string() {
        let path = EntityPath::game("g1").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"/game/g1\"");
        let back: EntityPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<EntityPath>("\"/nope/x\"").is_err());
    }
}
