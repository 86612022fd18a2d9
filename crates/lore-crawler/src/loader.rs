//! Matrix `/messages` pagination as a [`HistoryLoader`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use lore_core::checkpoint::Checkpoint;
use lore_core::errors::BridgeError;
use lore_core::event::{EventAndProfile, HistoricEventBatch, MatrixEvent, Profile, MEMBER_TYPE};
use lore_core::index::HistoryLoader;

use crate::error::CrawlerError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LAZY_LOAD_FILTER: &str = r#"{"lazy_load_members":true}"#;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<Value>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    state: Vec<Value>,
}

pub struct MatrixHistoryLoader {
    client: Client,
    homeserver: Url,
    access_token: SecretString,
    page_size: u32,
}

impl MatrixHistoryLoader {
    pub fn new(
        homeserver: &str,
        access_token: SecretString,
        page_size: u32,
    ) -> Result<Self, CrawlerError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            homeserver: Url::parse(homeserver)?,
            access_token,
            page_size: page_size.max(1),
        })
    }

    fn messages_url(&self, checkpoint: &Checkpoint) -> Result<Url, BridgeError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::Codec(format!("homeserver URL cannot be a base: {}", self.homeserver)))?
            .pop_if_empty()
            .extend([
                "_matrix",
                "client",
                "v3",
                "rooms",
                checkpoint.room_id.as_str(),
                "messages",
            ]);
        url.query_pairs_mut()
            .append_pair("from", &checkpoint.token)
            .append_pair("dir", checkpoint.direction.as_str())
            .append_pair("limit", &self.page_size.to_string())
            .append_pair("filter", LAZY_LOAD_FILTER);
        Ok(url)
    }
}

fn status_error(status: StatusCode, body: &str) -> BridgeError {
    let detail = format!("homeserver returned {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BridgeError::PermissionDenied(detail),
        StatusCode::TOO_MANY_REQUESTS => BridgeError::ChannelUnavailable(detail),
        s if s.is_server_error() => BridgeError::ChannelUnavailable(detail),
        _ => BridgeError::Codec(detail),
    }
}

#[async_trait]
impl HistoryLoader for MatrixHistoryLoader {
    #[instrument(skip_all, fields(room_id = %checkpoint.room_id, direction = %checkpoint.direction))]
    async fn load_events(&self, checkpoint: &Checkpoint) -> Result<HistoricEventBatch, BridgeError> {
        let url = self.messages_url(checkpoint)?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| BridgeError::ChannelUnavailable(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let page: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::Codec(format!("malformed /messages response: {e}")))?;

        Ok(into_batch(checkpoint, page))
    }
}

fn into_batch(checkpoint: &Checkpoint, page: MessagesResponse) -> HistoricEventBatch {
    let exhausted = page.chunk.is_empty() || page.end.is_none();

    // Lazy-loaded members arrive in `state`; a join inside the page is the fallback.
    let mut profiles = member_profiles(&page.state);
    for (user, profile) in member_profiles(&page.chunk) {
        profiles.entry(user).or_insert(profile);
    }

    let received = page.chunk.len();
    let mut events = Vec::with_capacity(received);
    for mut raw in page.chunk {
        if let Value::Object(map) = &mut raw {
            // Events returned by /messages may omit their room.
            map.entry("room_id")
                .or_insert_with(|| Value::String(checkpoint.room_id.to_string()));
        }
        let event = match serde_json::from_value::<MatrixEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping unparsable timeline event");
                continue;
            }
        };
        if !event.is_indexable() {
            continue;
        }
        let profile = profiles.get(event.sender.as_str()).cloned().unwrap_or_default();
        events.push(EventAndProfile::new(event, profile));
    }

    debug!(received, indexable = events.len(), exhausted, "page loaded");

    HistoricEventBatch {
        events,
        consumed: checkpoint.clone(),
        next: match (exhausted, page.end) {
            (false, Some(end)) => Some(checkpoint.advance(end)),
            _ => None,
        },
    }
}

/// Display data from `m.room.member` events, keyed by `state_key`.
fn member_profiles(events: &[Value]) -> HashMap<String, Profile> {
    events
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) == Some(MEMBER_TYPE))
        .filter_map(|e| {
            let user = e.get("state_key")?.as_str()?.to_string();
            let field = |name: &str| {
                e.pointer(&format!("/content/{name}"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            Some((
                user,
                Profile {
                    displayname: field("displayname"),
                    avatar_url: field("avatar_url"),
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_core::ids::RoomId;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MESSAGES_PATH: &str = "/_matrix/client/v3/rooms/!r:x/messages";

    fn loader(server: &MockServer) -> MatrixHistoryLoader {
        MatrixHistoryLoader::new(&server.uri(), SecretString::from("syt_token".to_string()), 50).unwrap()
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::backward(RoomId::from_raw("!r:x"), "t0").with_full_crawl(true)
    }

    fn message(id: &str, sender: &str, ts: i64, body: &str) -> Value {
        json!({
            "event_id": id,
            "sender": sender,
            "type": "m.room.message",
            "origin_server_ts": ts,
            "content": {"msgtype": "m.text", "body": body}
        })
    }

    #[tokio::test]
    async fn page_with_profiles_and_next_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .and(query_param("from", "t0"))
            .and(query_param("dir", "b"))
            .and(query_param("limit", "50"))
            .and(query_param("filter", LAZY_LOAD_FILTER))
            .and(header("authorization", "Bearer syt_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "start": "t0",
                "end": "t1",
                "chunk": [
                    message("$2", "@alice:x", 20, "second"),
                    message("$1", "@bob:x", 10, "first"),
                    {
                        "event_id": "$3", "sender": "@alice:x", "type": "m.room.message",
                        "origin_server_ts": 5, "content": {},
                        "unsigned": {"redacted_because": {"type": "m.room.redaction"}}
                    }
                ],
                "state": [{
                    "event_id": "$m", "sender": "@alice:x", "type": "m.room.member",
                    "state_key": "@alice:x", "origin_server_ts": 1,
                    "content": {"membership": "join", "displayname": "Alice", "avatar_url": "mxc://x/a"}
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let batch = loader(&server).load_events(&checkpoint()).await.unwrap();

        assert_eq!(batch.events.len(), 2, "redacted event is dropped");
        assert_eq!(batch.events[0].event.room_id.as_str(), "!r:x");
        assert_eq!(batch.events[0].profile.displayname.as_deref(), Some("Alice"));
        assert_eq!(batch.events[1].profile, Profile::default());

        let next = batch.next.unwrap();
        assert_eq!(next.token, "t1");
        assert!(next.full_crawl, "replacement inherits full_crawl");
        assert_eq!(batch.consumed, checkpoint());
    }

    #[tokio::test]
    async fn missing_end_means_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "start": "t0",
                "chunk": [message("$1", "@a:x", 1, "last one")]
            })))
            .mount(&server)
            .await;

        let batch = loader(&server).load_events(&checkpoint()).await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(batch.next.is_none());
    }

    #[tokio::test]
    async fn empty_chunk_is_exhausted_even_with_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"start": "t0", "end": "t0", "chunk": []})),
            )
            .mount(&server)
            .await;

        let batch = loader(&server).load_events(&checkpoint()).await.unwrap();
        assert!(batch.is_exhausted());
    }

    #[tokio::test]
    async fn filtered_page_still_advances() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "end": "t1",
                "chunk": [{
                    "event_id": "$j", "sender": "@a:x", "type": "m.room.member",
                    "state_key": "@a:x", "origin_server_ts": 1, "content": {"membership": "join"}
                }]
            })))
            .mount(&server)
            .await;

        let batch = loader(&server).load_events(&checkpoint()).await.unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.next.map(|c| c.token), Some("t1".to_string()));
    }

    #[tokio::test]
    async fn rate_limit_and_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({"errcode": "M_LIMIT_EXCEEDED"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let loader = loader(&server);
        let first = loader.load_events(&checkpoint()).await.unwrap_err();
        assert!(matches!(first, BridgeError::ChannelUnavailable(_)));
        let second = loader.load_events(&checkpoint()).await.unwrap_err();
        assert!(second.is_retryable());
    }

    #[tokio::test]
    async fn forbidden_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"errcode": "M_FORBIDDEN"})))
            .mount(&server)
            .await;

        let err = loader(&server).load_events(&checkpoint()).await.unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(ref m) if m.contains("M_FORBIDDEN")));
    }

    #[test]
    fn url_keeps_homeserver_prefix() {
        let loader = MatrixHistoryLoader::new(
            "https://hs.example/base/",
            SecretString::from("t".to_string()),
            10,
        )
        .unwrap();
        let url = loader.messages_url(&checkpoint()).unwrap();
        assert_eq!(url.path(), "/base/_matrix/client/v3/rooms/!r:x/messages");
        assert!(url.query().unwrap().contains("dir=b"));
    }

    #[test]
    fn bad_homeserver_rejected() {
        let err = MatrixHistoryLoader::new("not a url", SecretString::from("t".to_string()), 10)
            .err()
            .unwrap();
        assert!(matches!(err, CrawlerError::InvalidUrl(_)));
    }
}
