use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checkpoint::Checkpoint;
use crate::ids::{EventId, RoomId, UserId};

pub const MESSAGE_TYPE: &str = "m.room.message";
pub const NAME_TYPE: &str = "m.room.name";
pub const TOPIC_TYPE: &str = "m.room.topic";
pub const MEMBER_TYPE: &str = "m.room.member";

/// A timeline event as the index engine stores it.
///
/// Only the fields the engine keys on are typed; everything else the
/// homeserver sent is kept in `extra` and written back out unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender: UserId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MatrixEvent {
    pub fn message(
        event_id: impl Into<String>,
        room_id: RoomId,
        sender: impl Into<String>,
        origin_server_ts: i64,
        body: &str,
    ) -> Self {
        Self {
            event_id: EventId::from_raw(event_id),
            room_id,
            sender: UserId::from_raw(sender),
            event_type: MESSAGE_TYPE.to_string(),
            origin_server_ts,
            content: serde_json::json!({"msgtype": "m.text", "body": body}),
            extra: Map::new(),
        }
    }

    /// Searchable text: message body, room name or room topic.
    pub fn text(&self) -> Option<&str> {
        let field = match self.event_type.as_str() {
            MESSAGE_TYPE => "body",
            NAME_TYPE => "name",
            TOPIC_TYPE => "topic",
            _ => return None,
        };
        self.content.get(field).and_then(Value::as_str)
    }

    /// Media URL of an attachment, plain or encrypted.
    pub fn url(&self) -> Option<&str> {
        self.content
            .get("url")
            .and_then(Value::as_str)
            .or_else(|| {
                self.content
                    .get("file")
                    .and_then(|f| f.get("url"))
                    .and_then(Value::as_str)
            })
    }

    pub fn is_redacted(&self) -> bool {
        self.extra
            .get("unsigned")
            .and_then(|u| u.get("redacted_because"))
            .is_some()
    }

    pub fn state_key(&self) -> Option<&str> {
        self.extra.get("state_key").and_then(Value::as_str)
    }

    /// Whether the event carries anything worth putting in the index.
    pub fn is_indexable(&self) -> bool {
        if self.is_redacted() {
            return false;
        }
        match self.event_type.as_str() {
            MESSAGE_TYPE => self.text().is_some(),
            NAME_TYPE | TOPIC_TYPE => self.text().is_some(),
            _ => false,
        }
    }
}

/// Sender display data at the time of the event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn named(displayname: impl Into<String>) -> Self {
        Self {
            displayname: Some(displayname.into()),
            avatar_url: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventAndProfile {
    pub event: MatrixEvent,
    #[serde(default)]
    pub profile: Profile,
}

impl EventAndProfile {
    pub fn new(event: MatrixEvent, profile: Profile) -> Self {
        Self { event, profile }
    }
}

/// One page of history fetched for a checkpoint. Lives for a single crawl step.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoricEventBatch {
    pub events: Vec<EventAndProfile>,
    /// The checkpoint that was consumed to fetch this page.
    pub consumed: Checkpoint,
    /// Replacement cursor, `None` when this direction is exhausted.
    pub next: Option<Checkpoint>,
}

impl HistoricEventBatch {
    pub fn exhausted(consumed: Checkpoint) -> Self {
        Self {
            events: Vec::new(),
            consumed,
            next: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.events.is_empty() && self.next.is_none()
    }
}
