//! Wire format shared by both sides of the boundary.
//!
//! Request: `{ type, method, content?, id? }` where `type` names the
//! capability. Reply: `{ id, success, result?, error?: { code, message } }`.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use lore_core::checkpoint::{Checkpoint, CheckpointKey, Direction};
use lore_core::errors::BridgeError;
use lore_core::event::{EventAndProfile, MatrixEvent, Profile};
use lore_core::ids::{EventId, RoomId};
use lore_core::keys::KeyOwner;
use lore_core::search::{LoadFileArgs, SearchArgs};

/// Which capability a request is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boundary {
    #[serde(rename = "seshat")]
    Index,
    #[serde(rename = "keytar")]
    Keys,
    #[serde(rename = "platform")]
    Platform,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub boundary: Boundary,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Envelope {
    /// Encode a typed request.
    pub fn request<R: BridgeRequest>(request: &R, id: Option<u64>) -> Result<Self, BridgeError> {
        let value = serde_json::to_value(request).map_err(|e| BridgeError::Codec(e.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(BridgeError::Codec("request did not encode to an object".into()));
        };
        let method = match map.remove("method") {
            Some(Value::String(m)) => m,
            _ => return Err(BridgeError::Codec("request has no method".into())),
        };
        Ok(Self {
            boundary: R::BOUNDARY,
            method,
            content: map.remove("content"),
            id,
        })
    }

    /// Decode into the typed request for this envelope's boundary.
    pub fn decode<R: BridgeRequest>(&self) -> Result<R, BridgeError> {
        if self.boundary != R::BOUNDARY || !R::METHODS.contains(&self.method.as_str()) {
            return Err(BridgeError::MethodNotFound(self.method.clone()));
        }
        let mut map = serde_json::Map::new();
        map.insert("method".into(), Value::String(self.method.clone()));
        if let Some(content) = self.content.as_ref().filter(|c| !c.is_null()) {
            map.insert("content".into(), content.clone());
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| BridgeError::Codec(format!("{}: {e}", self.method)))
    }
}

/// A typed request family bound to one boundary tag.
pub trait BridgeRequest: Serialize + DeserializeOwned + Send + Sync {
    const BOUNDARY: Boundary;
    const METHODS: &'static [&'static str];
}

/// Index engine and checkpoint store surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "content",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum IndexRequest {
    SupportsEventIndexing,
    InitEventIndex,
    CloseEventIndex,
    DeleteEventIndex,
    IsEventIndexEmpty,
    IsRoomIndexed {
        room_id: RoomId,
    },
    AddEventToIndex {
        ev: MatrixEvent,
        #[serde(default)]
        profile: Profile,
    },
    CommitLiveEvents,
    DeleteEvent {
        event_id: EventId,
    },
    AddHistoricEvents {
        events: Vec<EventAndProfile>,
        #[serde(default)]
        checkpoint: Option<Checkpoint>,
        #[serde(default)]
        old_checkpoint: Option<Checkpoint>,
    },
    SearchEventIndex {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<String>,
        config: SearchArgs,
    },
    LoadFileEvents(LoadFileArgs),
    GetStats,
    GetUserVersion,
    SetUserVersion {
        version: u32,
    },
    AddCrawlerCheckpoint {
        checkpoint: Checkpoint,
    },
    RemoveCrawlerCheckpoint {
        old_checkpoint: Checkpoint,
    },
    ReplaceCrawlerCheckpoint {
        old_checkpoint: Checkpoint,
        #[serde(default)]
        checkpoint: Option<Checkpoint>,
    },
    LoadCheckpoints,
}

impl BridgeRequest for IndexRequest {
    const BOUNDARY: Boundary = Boundary::Index;
    const METHODS: &'static [&'static str] = &[
        "supportsEventIndexing",
        "initEventIndex",
        "closeEventIndex",
        "deleteEventIndex",
        "isEventIndexEmpty",
        "isRoomIndexed",
        "addEventToIndex",
        "commitLiveEvents",
        "deleteEvent",
        "addHistoricEvents",
        "searchEventIndex",
        "loadFileEvents",
        "getStats",
        "getUserVersion",
        "setUserVersion",
        "addCrawlerCheckpoint",
        "removeCrawlerCheckpoint",
        "replaceCrawlerCheckpoint",
        "loadCheckpoints",
    ];
}

/// Pickle key storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "content", rename_all = "camelCase")]
pub enum KeyRequest {
    GetPickleKey(KeyOwner),
    CreatePickleKey(KeyOwner),
    DestroyPickleKey(KeyOwner),
}

impl KeyRequest {
    pub fn owner(&self) -> &KeyOwner {
        match self {
            Self::GetPickleKey(o) | Self::CreatePickleKey(o) | Self::DestroyPickleKey(o) => o,
        }
    }
}

impl BridgeRequest for KeyRequest {
    const BOUNDARY: Boundary = Boundary::Keys;
    const METHODS: &'static [&'static str] =
        &["getPickleKey", "createPickleKey", "destroyPickleKey"];
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "content", rename_all = "camelCase")]
pub enum PlatformRequest {
    GetVersion,
    GetConfig,
}

impl BridgeRequest for PlatformRequest {
    const BOUNDARY: Boundary = Boundary::Platform;
    const METHODS: &'static [&'static str] = &["getVersion", "getConfig"];
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, error: &BridgeError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(WireError::from_error(error)),
        }
    }

    /// Back to a `Result`, decoding the error code into its variant.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(self
            .error
            .map(WireError::into_error)
            .unwrap_or_else(|| BridgeError::Codec("failed reply without error".into())))
    }

    /// Decode a successful result into `T`.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, BridgeError> {
        let value = self.into_result()?;
        serde_json::from_value(value).map_err(|e| BridgeError::Codec(format!("reply: {e}")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    pub fn from_error(error: &BridgeError) -> Self {
        let (message, data) = match error {
            BridgeError::ChannelUnavailable(m)
            | BridgeError::Engine(m)
            | BridgeError::PermissionDenied(m)
            | BridgeError::Codec(m)
            | BridgeError::MethodNotFound(m) => (m.clone(), None),
            BridgeError::Timeout(d) => (
                error.to_string(),
                Some(json!({ "ms": d.as_millis() as u64 })),
            ),
            BridgeError::DuplicateCheckpoint(key) => (
                error.to_string(),
                Some(json!({ "roomId": key.room_id, "direction": key.direction })),
            ),
            BridgeError::SchemaVersionMismatch { expected, found } => (
                error.to_string(),
                Some(json!({ "expected": expected, "found": found })),
            ),
            BridgeError::Cancelled => (error.to_string(), None),
        };
        Self {
            code: error.wire_code().to_string(),
            message,
            data,
        }
    }

    pub fn into_error(self) -> BridgeError {
        let data = self.data.unwrap_or(Value::Null);
        match self.code.as_str() {
            "CHANNEL_UNAVAILABLE" => BridgeError::ChannelUnavailable(self.message),
            "TIMEOUT" => BridgeError::Timeout(Duration::from_millis(
                data.get("ms").and_then(Value::as_u64).unwrap_or(0),
            )),
            "ENGINE_ERROR" => BridgeError::Engine(self.message),
            "DUPLICATE_CHECKPOINT" => {
                let room_id = data.get("roomId").and_then(Value::as_str);
                let direction = data
                    .get("direction")
                    .and_then(Value::as_str)
                    .and_then(|d| d.parse::<Direction>().ok());
                match (room_id, direction) {
                    (Some(room_id), Some(direction)) => BridgeError::DuplicateCheckpoint(
                        CheckpointKey::new(RoomId::from_raw(room_id), direction),
                    ),
                    _ => BridgeError::Codec(format!("malformed duplicate checkpoint error: {}", self.message)),
                }
            }
            "SCHEMA_VERSION_MISMATCH" => BridgeError::SchemaVersionMismatch {
                expected: data.get("expected").and_then(Value::as_u64).unwrap_or(0) as u32,
                found: data.get("found").and_then(Value::as_u64).unwrap_or(0) as u32,
            },
            "PERMISSION_DENIED" => BridgeError::PermissionDenied(self.message),
            "INVALID_PARAMS" => BridgeError::Codec(self.message),
            "METHOD_NOT_FOUND" => BridgeError::MethodNotFound(self.message),
            "CANCELLED" => BridgeError::Cancelled,
            _ => BridgeError::Engine(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> Checkpoint {
        Checkpoint::backward(RoomId::from_raw("!r1:localhost"), "t0").with_full_crawl(true)
    }

    #[test]
    fn checkpoint_survives_the_envelope() {
        let req = IndexRequest::AddCrawlerCheckpoint {
            checkpoint: checkpoint(),
        };
        let envelope = Envelope::request(&req, Some(7)).unwrap();
        let wire = serde_json::to_string(&envelope).unwrap();

        let back: Envelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.decode::<IndexRequest>().unwrap(), req);
    }

    #[test]
    fn wire_shape_matches_the_web_side() {
        let req = IndexRequest::AddHistoricEvents {
            events: Vec::new(),
            checkpoint: Some(checkpoint().advance("t1")),
            old_checkpoint: Some(checkpoint()),
        };
        let json = serde_json::to_value(Envelope::request(&req, Some(1)).unwrap()).unwrap();
        assert_eq!(json["type"], "seshat");
        assert_eq!(json["method"], "addHistoricEvents");
        assert_eq!(json["content"]["oldCheckpoint"]["token"], "t0");
        assert_eq!(json["content"]["checkpoint"]["roomId"], "!r1:localhost");
        assert_eq!(json["content"]["checkpoint"]["fullCrawl"], true);
        assert_eq!(json["id"], 1);
    }

    #[test]
    fn unit_requests_have_no_content() {
        let json = serde_json::to_value(Envelope::request(&IndexRequest::GetStats, None).unwrap()).unwrap();
        assert_eq!(json, json!({"type": "seshat", "method": "getStats"}));

        let env: Envelope = serde_json::from_value(json!({
            "type": "seshat", "method": "loadCheckpoints", "content": null
        }))
        .unwrap();
        assert_eq!(env.decode::<IndexRequest>().unwrap(), IndexRequest::LoadCheckpoints);
    }

    #[test]
    fn key_requests_use_owner_fields() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "keytar",
            "method": "getPickleKey",
            "content": {"userId": "@u:x", "deviceId": "DEV"}
        }))
        .unwrap();
        let req = env.decode::<KeyRequest>().unwrap();
        assert_eq!(req.owner().device_id.as_str(), "DEV");
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let env: Envelope =
            serde_json::from_value(json!({"type": "seshat", "method": "dropTables"})).unwrap();
        assert!(matches!(
            env.decode::<IndexRequest>(),
            Err(BridgeError::MethodNotFound(m)) if m == "dropTables"
        ));
    }

    #[test]
    fn wrong_boundary_is_method_not_found() {
        let env: Envelope =
            serde_json::from_value(json!({"type": "keytar", "method": "getStats"})).unwrap();
        assert!(matches!(
            env.decode::<IndexRequest>(),
            Err(BridgeError::MethodNotFound(_))
        ));
    }

    #[test]
    fn bad_content_is_invalid_params() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "seshat", "method": "setUserVersion", "content": {"version": "two"}
        }))
        .unwrap();
        let err = env.decode::<IndexRequest>().unwrap_err();
        assert_eq!(err.wire_code(), "INVALID_PARAMS");
    }

    #[test]
    fn errors_decode_to_the_same_variant() {
        let cases = vec![
            BridgeError::ChannelUnavailable("closed".into()),
            BridgeError::Timeout(Duration::from_millis(1500)),
            BridgeError::Engine("disk full".into()),
            BridgeError::DuplicateCheckpoint(checkpoint().key()),
            BridgeError::SchemaVersionMismatch { expected: 2, found: 1 },
            BridgeError::PermissionDenied("nope".into()),
            BridgeError::Codec("bad".into()),
            BridgeError::MethodNotFound("x".into()),
            BridgeError::Cancelled,
        ];
        for err in cases {
            let reply = Reply::err(Some(3), &err);
            let wire: Reply = serde_json::from_str(&serde_json::to_string(&reply).unwrap()).unwrap();
            assert!(!wire.success);
            assert_eq!(wire.into_result().unwrap_err(), err);
        }
    }

    #[test]
    fn unknown_error_code_is_engine_error() {
        let reply: Reply = serde_json::from_value(json!({
            "id": 1, "success": false, "error": {"code": "SOMETHING_NEW", "message": "huh"}
        }))
        .unwrap();
        assert_eq!(reply.into_result().unwrap_err(), BridgeError::Engine("huh".into()));
    }

    #[test]
    fn typed_reply() {
        let reply = Reply::ok(Some(1), json!([serde_json::to_value(checkpoint()).unwrap()]));
        let cps: Vec<Checkpoint> = reply.into_typed().unwrap();
        assert_eq!(cps, vec![checkpoint()]);
    }
}
