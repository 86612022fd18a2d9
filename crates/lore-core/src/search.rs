use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::Direction;
use crate::event::{MatrixEvent, Profile};
use crate::ids::{EventId, RoomId, UserId};

/// Query sent to `searchEventIndex`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchArgs {
    pub search_term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub before_limit: u32,
    #[serde(default)]
    pub after_limit: u32,
    #[serde(default)]
    pub order_by_recency: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<String>,
}

fn default_limit() -> u32 {
    10
}

impl SearchArgs {
    pub fn term(search_term: impl Into<String>) -> Self {
        Self {
            search_term: search_term.into(),
            room_id: None,
            limit: default_limit(),
            before_limit: 0,
            after_limit: 0,
            order_by_recency: true,
            next_batch: None,
        }
    }

    pub fn in_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }
}

/// Surrounding timeline returned with each hit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default)]
    pub events_before: Vec<MatrixEvent>,
    #[serde(default)]
    pub events_after: Vec<MatrixEvent>,
    #[serde(default)]
    pub profile_info: HashMap<UserId, Profile>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub rank: f32,
    pub result: MatrixEvent,
    #[serde(default)]
    pub context: EventContext,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub count: u64,
    pub results: Vec<SearchHit>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<String>,
}

/// Read-only snapshot of the index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub event_count: u64,
    pub room_count: u64,
    /// Bytes on disk.
    pub size: u64,
}

/// Paging request for events that carry an attachment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadFileArgs {
    pub room_id: RoomId,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_event: Option<EventId>,
    #[serde(default = "default_file_direction")]
    pub direction: Direction,
}

fn default_file_direction() -> Direction {
    Direction::Backward
}

impl LoadFileArgs {
    pub fn latest(room_id: RoomId, limit: u32) -> Self {
        Self {
            room_id,
            limit,
            from_event: None,
            direction: Direction::Backward,
        }
    }
}
