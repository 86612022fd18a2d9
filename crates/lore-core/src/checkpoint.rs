use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::RoomId;

/// Which way through a room's timeline a crawl walks.
///
/// Serialized as the Matrix pagination direction (`"b"` / `"f"`).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "b")]
    Backward,
    #[serde(rename = "f")]
    Forward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b" | "backward" | "backwards" => Ok(Self::Backward),
            "f" | "forward" | "forwards" => Ok(Self::Forward),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Durable crawl cursor for one room and direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub room_id: RoomId,
    /// Opaque pagination token handed out by the homeserver.
    pub token: String,
    pub direction: Direction,
    /// A full crawl keeps going through already indexed history;
    /// a partial crawl stops at the first page that was already indexed.
    #[serde(default)]
    pub full_crawl: bool,
}

impl Checkpoint {
    pub fn new(room_id: RoomId, token: impl Into<String>, direction: Direction) -> Self {
        Self {
            room_id,
            token: token.into(),
            direction,
            full_crawl: false,
        }
    }

    pub fn backward(room_id: RoomId, token: impl Into<String>) -> Self {
        Self::new(room_id, token, Direction::Backward)
    }

    pub fn forward(room_id: RoomId, token: impl Into<String>) -> Self {
        Self::new(room_id, token, Direction::Forward)
    }

    pub fn with_full_crawl(mut self, full_crawl: bool) -> Self {
        self.full_crawl = full_crawl;
        self
    }

    pub fn key(&self) -> CheckpointKey {
        CheckpointKey {
            room_id: self.room_id.clone(),
            direction: self.direction,
        }
    }

    /// Same identity, new cursor. Used to build the replacement after a page.
    pub fn advance(&self, token: impl Into<String>) -> Self {
        Self {
            room_id: self.room_id.clone(),
            token: token.into(),
            direction: self.direction,
            full_crawl: self.full_crawl,
        }
    }
}

/// Identity of a checkpoint: at most one may exist per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub room_id: RoomId,
    pub direction: Direction,
}

impl CheckpointKey {
    pub fn new(room_id: RoomId, direction: Direction) -> Self {
        Self { room_id, direction }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_camel_case() {
        let cp = Checkpoint::backward(RoomId::from_raw("!r1:localhost"), "t0").with_full_crawl(true);
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["roomId"], "!r1:localhost");
        assert_eq!(json["token"], "t0");
        assert_eq!(json["direction"], "b");
        assert_eq!(json["fullCrawl"], true);
    }

    #[test]
    fn full_crawl_defaults_to_false() {
        let cp: Checkpoint =
            serde_json::from_str(r#"{"roomId":"!r:x","token":"t","direction":"f"}"#).unwrap();
        assert_eq!(cp.direction, Direction::Forward);
        assert!(!cp.full_crawl);
    }

    #[test]
    fn advance_keeps_identity() {
        let cp = Checkpoint::backward(RoomId::from_raw("!r:x"), "t0").with_full_crawl(true);
        let next = cp.advance("t1");
        assert_eq!(next.key(), cp.key());
        assert_eq!(next.token, "t1");
        assert!(next.full_crawl);
    }

    #[test]
    fn direction_parse() {
        assert_eq!("b".parse::<Direction>().unwrap(), Direction::Backward);
        assert_eq!("forwards".parse::<Direction>().unwrap(), Direction::Forward);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn key_display() {
        let key = CheckpointKey::new(RoomId::from_raw("!r:x"), Direction::Backward);
        assert_eq!(key.to_string(), "!r:x/b");
    }
}
