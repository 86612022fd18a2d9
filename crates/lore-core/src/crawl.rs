use serde::{Deserialize, Serialize};

use crate::checkpoint::Direction;
use crate::ids::RoomId;

/// Per room-direction crawl state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Idle,
    Crawling,
    Done,
    /// Excluded from selection after too many failures or a store invariant
    /// violation.
    Stalled,
}

impl PairState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Stalled)
    }
}

/// Observability events emitted by the crawler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CrawlEvent {
    #[serde(rename = "step_completed")]
    StepCompleted {
        room_id: RoomId,
        direction: Direction,
        events_indexed: usize,
        duration_ms: u64,
    },

    #[serde(rename = "room_done")]
    RoomDone {
        room_id: RoomId,
        direction: Direction,
    },

    #[serde(rename = "retry_scheduled")]
    RetryScheduled {
        room_id: RoomId,
        direction: Direction,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    #[serde(rename = "room_stalled")]
    RoomStalled {
        room_id: RoomId,
        direction: Direction,
        failures: u32,
        error: String,
    },

    #[serde(rename = "stopped")]
    Stopped { done: usize, stalled: usize },
}

impl CrawlEvent {
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::StepCompleted { room_id, .. }
            | Self::RoomDone { room_id, .. }
            | Self::RetryScheduled { room_id, .. }
            | Self::RoomStalled { room_id, .. } => Some(room_id),
            Self::Stopped { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepCompleted { .. } => "step_completed",
            Self::RoomDone { .. } => "room_done",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RoomStalled { .. } => "room_stalled",
            Self::Stopped { .. } => "stopped",
        }
    }
}
